//! LMDB storage backend for tollgate.
//!
//! Implements [`tollgate_store::PersistentKv`] using the `heed` LMDB bindings.
//! Each bucket maps to a named LMDB database within a single environment.

pub mod environment;
pub mod error;

pub use environment::LmdbKv;
pub use error::LmdbError;
