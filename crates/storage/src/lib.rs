//! In-memory replica storage for ringkv.
//!
//! Each table is a multi-version memtable keyed by `Cell`; every write keeps
//! its timestamp so reads can be served at any point in time.

pub mod engine;
pub mod memtable;

pub use engine::MemoryKeyValueService;
pub use memtable::Memtable;
