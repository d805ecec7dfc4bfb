//! Provenance: run event log and configuration fingerprints.

pub mod eventlog;
pub mod hasher;
