//! Pool lifecycle coordinator: open/create/close/leave, backend selection,
//! and the background replica tick (spec.md §4.8).

pub mod backend;
pub mod dump;
pub mod pool;

pub use backend::{resolve_backend, Backend};
pub use dump::PoolDump;
pub use pool::{Globals, Pool};
