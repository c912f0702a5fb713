//! Adapters for the domain ports.

pub mod clock;
pub mod in_memory;
pub mod json_parser;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
pub mod simulated;
