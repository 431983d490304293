//! Encrypted blob store: the abstract `BlobStore` interface, the in-scope
//! local filesystem driver, and guard checkpoints.

pub mod blob_store;
pub mod guard;
pub mod local_fs;
pub mod memory;
pub mod prefix;
pub mod replicate;

pub use blob_store::{BlobStore, ByteRange, Entry};
pub use guard::Guard;
pub use local_fs::LocalFsBlobStore;
pub use memory::MemoryBlobStore;
pub use prefix::PrefixBlobStore;
pub use replicate::{copy_missing, sync_bidirectional};
