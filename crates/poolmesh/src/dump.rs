//! Diagnostic snapshot of a pool's local state (SPEC_FULL.md §C.2, grounded
//! on `poolmesh_core::DiagnosticsLog` plus the teacher's own debug-dump
//! commands). Never touches the network; reflects only what this node
//! currently believes.

use poolmesh_access::AccessRecord;
use poolmesh_core::{Bandwidth, KeyId, PoolId};

/// A point-in-time view of a pool's membership, keys, and recent activity,
/// for operator tooling and tests. Not part of the wire protocol.
#[derive(Debug, Clone)]
pub struct PoolDump {
    pub pool_id: PoolId,
    pub name: String,
    pub primary_backend: String,
    pub bandwidth: Bandwidth,
    pub master_key_id: Option<KeyId>,
    pub members: Vec<AccessRecord>,
    pub feed_entry_count: usize,
    pub recent_log_lines: Vec<String>,
}
