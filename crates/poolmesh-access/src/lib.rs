//! Access-control engine: access-file merge, master-key rotation, and
//! identity-folder sync (spec.md §4.5).

pub mod access;
pub mod engine;
pub mod identities;

pub use access::{AccessFile, AccessRecord, AccessState, KeyEntry, ACCESS_FILE_VERSION};
pub use engine::AccessEngine;

use poolmesh_core::PoolId;

/// Every local-store scope owned by this crate for `pool_id` (access
/// records/meta plus the identity trust cache), for `leave`-style cleanup.
pub fn local_scopes(pool_id: PoolId) -> Vec<String> {
    let mut scopes = engine::local_scopes(pool_id);
    scopes.extend(identities::local_scopes(pool_id));
    scopes
}
