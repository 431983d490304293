//! Identifiers used across the Poolmesh workspace
//!
//! Snowflake ids drive both feed entry ids and access-file names (spec.md
//! §3). The epoch, bit layout, and base64 identity-id scheme are pinned
//! here so every crate agrees on byte-for-byte encodings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Epoch for snowflake timestamps: 2023-01-01T00:00:00Z, in milliseconds
/// since the Unix epoch. See SPEC_FULL.md §C.3.
pub const SNOWFLAKE_EPOCH_MS: u64 = 1_672_531_200_000;

const SEQUENCE_BITS: u32 = 12;
const MACHINE_BITS: u32 = 10;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const MACHINE_MASK: u64 = (1 << MACHINE_BITS) - 1;

/// A 64-bit time-ordered id: 41 bits of milliseconds since
/// [`SNOWFLAKE_EPOCH_MS`], 10 bits of machine id, 12 bits of sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Snowflake(pub u64);

impl Snowflake {
    /// Build a snowflake from its components, truncating each field to its
    /// bit width.
    pub fn from_parts(millis_since_epoch: u64, machine_id: u16, sequence: u16) -> Self {
        let ts = millis_since_epoch << (MACHINE_BITS + SEQUENCE_BITS);
        let machine = (machine_id as u64 & MACHINE_MASK) << SEQUENCE_BITS;
        let seq = sequence as u64 & SEQUENCE_MASK;
        Self(ts | machine | seq)
    }

    /// The millisecond timestamp (since [`SNOWFLAKE_EPOCH_MS`]) encoded in
    /// this id.
    pub fn millis_since_epoch(self) -> u64 {
        self.0 >> (MACHINE_BITS + SEQUENCE_BITS)
    }

    /// The wall-clock instant this id was minted at.
    pub fn timestamp(self) -> SystemTime {
        UNIX_EPOCH + std::time::Duration::from_millis(SNOWFLAKE_EPOCH_MS + self.millis_since_epoch())
    }

    /// Smallest snowflake whose timestamp is `>= at`. Used as the
    /// lifespan GC threshold (spec.md §4.4 step 4): entries with
    /// `id < base_id` are eligible for deletion.
    pub fn floor_at(at: SystemTime) -> Self {
        let millis = at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let since_epoch = millis.saturating_sub(SNOWFLAKE_EPOCH_MS);
        Self::from_parts(since_epoch, 0, 0)
    }

    /// Parse from the decimal string used in file names.
    pub fn parse(s: &str) -> Option<Self> {
        s.parse::<u64>().ok().map(Self)
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic, thread-safe snowflake generator for a single machine.
///
/// A publisher that clock-jumps backward still produces
/// monotonically-increasing ids: if wall time has not advanced past the
/// last-minted millisecond, the sequence counter is bumped instead (spec.md
/// §5 "Ordering guarantees").
pub struct SnowflakeGenerator {
    machine_id: u16,
    state: AtomicU64,
}

impl SnowflakeGenerator {
    /// Create a generator for the given machine id (truncated to 10 bits).
    pub fn new(machine_id: u16) -> Self {
        Self {
            machine_id: machine_id & (MACHINE_MASK as u16),
            state: AtomicU64::new(0),
        }
    }

    /// Mint the next id, reading the system clock.
    pub fn next_id(&self) -> Snowflake {
        self.next_id_at(SystemTime::now())
    }

    /// Mint the next id as of the given instant (used by tests to control
    /// time deterministically).
    pub fn next_id_at(&self, now: SystemTime) -> Snowflake {
        let millis = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let since_epoch = millis.saturating_sub(SNOWFLAKE_EPOCH_MS);

        loop {
            let prev = self.state.load(Ordering::Acquire);
            let prev_ms = prev >> SEQUENCE_BITS;
            let (next_ms, next_seq) = if since_epoch > prev_ms {
                (since_epoch, 0)
            } else {
                (prev_ms, (prev & SEQUENCE_MASK) + 1)
            };
            let next_state = (next_ms << SEQUENCE_BITS) | (next_seq & SEQUENCE_MASK);
            if self
                .state
                .compare_exchange(prev, next_state, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Snowflake::from_parts(next_ms, self.machine_id, next_seq as u16);
            }
        }
    }
}

/// Identity of a pool member: base64 of the concatenated Ed25519 signing
/// public key (32 bytes) and secp256k1 encryption public key (33 bytes,
/// compressed), with `/` rewritten to `_` (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    /// Derive a user id from the concatenated public key bytes.
    pub fn from_public_parts(signing_pub: &[u8; 32], encryption_pub: &[u8; 33]) -> Self {
        use base64::Engine;
        let mut bytes = Vec::with_capacity(65);
        bytes.extend_from_slice(signing_pub);
        bytes.extend_from_slice(encryption_pub);
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        Self(encoded.replace('/', "_"))
    }

    /// Borrow the id as a plain string (used as a map key / file name).
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric id of a pool, minted once at creation time as a snowflake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PoolId(pub u64);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool-{}", self.0)
    }
}

impl From<Snowflake> for PoolId {
    fn from(s: Snowflake) -> Self {
        Self(s.0)
    }
}

/// Identifier of a symmetric key inside a [keystore](crate). Current master
/// is the maximum key-id currently referenced by the access file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyId(pub u64);

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key-{}", self.0)
    }
}
