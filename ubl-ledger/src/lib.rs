//! # UBL Ledger
//!
//! The append-only, hash-chained, per-container store (§4.E). This is
//! the one place in the core that performs I/O: everything upstream
//! (canonicalizer, kernel, membrane) is pure and synchronous.
//!
//! [`LedgerStore`] is the trait every backend implements; [`InMemoryLedgerStore`]
//! is an in-process backend useful for tests and embedding, and
//! [`postgres::PgLedgerStore`] is the persistence-backed implementation
//! for production deployments, grounded in the same SERIALIZABLE +
//! `FOR UPDATE` transaction shape used historically for this kind of
//! store, with the retry/backoff and append-only triggers §4.E/§6 ask
//! for layered on top.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryLedgerStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use thiserror::Error;
use ubl_kernel::{Hash, PublicKey};
use ubl_link::{ContainerState, IntentClass};

/// Errors from ledger store operations (§7).
#[derive(Error, Debug)]
pub enum LedgerError {
    /// `previous_hash` no longer matches the container's current
    /// `last_entry_hash` by the time the append transaction re-read
    /// state (§4.E step 4). The caller must rebuild and resubmit.
    #[error("reality drift: previous_hash does not match current state")]
    RealityDrift,

    /// `expected_sequence` no longer matches `last_sequence + 1` by the
    /// time the append transaction re-read state (§4.E step 4).
    #[error("sequence mismatch: expected {expected}, got {actual}")]
    SequenceMismatch {
        /// What the container's state requires next.
        expected: u64,
        /// What the link carried.
        actual: u64,
    },

    /// The append transaction hit a serialization conflict on every
    /// attempt within the retry budget (§4.E step 7).
    #[error("serialization conflict exhausted after {attempts} attempts")]
    ConflictExhausted {
        /// How many attempts were made before giving up.
        attempts: u32,
    },

    /// The backing store itself failed (connection, I/O, decode).
    /// Propagated unchanged per §4.H; safe to retry.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

/// Result type for ledger store operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// A materialized, stored link: the committed-entry template the
/// membrane produced, plus the fields §3 says a ledger entry carries.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// The container this entry belongs to.
    pub container_id: Hash,
    /// 1-indexed, strictly monotone, dense sequence within the container.
    pub sequence: u64,
    /// `link_hash` of the accepted envelope.
    pub link_hash: Hash,
    /// `entry_hash` of the entry preceding this one (genesis hash for
    /// the container's first entry).
    pub previous_hash: Hash,
    /// `BLAKE3(previous_hash ‖ link_hash)` — this entry's own hash,
    /// chained into the next entry's `previous_hash`.
    pub entry_hash: Hash,
    /// Hash of the atom this entry's link referenced.
    pub atom_hash: Hash,
    /// The link's physical classification.
    pub intent_class: IntentClass,
    /// The link's physical delta.
    #[serde_as(as = "DisplayFromStr")]
    pub physics_delta: i128,
    /// Wall-clock time of acceptance, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// The link's author.
    pub author_public_key: PublicKey,
}

/// A content-addressed, append-only, hash-chained store for one or more
/// containers (§4.E). Implementations must uphold the §3 invariants:
/// dense monotone sequencing, tangency between consecutive entries, and
/// no UPDATE/DELETE of anything once inserted.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Current derived state of a container: genesis state
    /// (`ContainerState::genesis()`) if it has never accepted an entry.
    async fn state(&self, container_id: &Hash) -> Result<ContainerState>;

    /// Look up a specific entry by `(container_id, sequence)`.
    async fn entry(&self, container_id: &Hash, sequence: u64) -> Result<Option<LedgerEntry>>;

    /// Look up an entry by its own `entry_hash`, used by audit tooling
    /// that only has a hash to go on.
    async fn entry_by_hash(&self, entry_hash: &Hash) -> Result<Option<LedgerEntry>>;

    /// Look up an entry by the `link_hash` of the commit that produced
    /// it — the lookup the Commit API's idempotency check (§4.G) uses.
    async fn entry_by_link_hash(
        &self,
        container_id: &Hash,
        link_hash: &Hash,
    ) -> Result<Option<LedgerEntry>>;

    /// Entries in `(container_id, sequence)` order starting at
    /// `from_sequence`, capped at `limit` — the batch-fetch primitive
    /// the tail bus uses to catch subscribers up (§4.F).
    async fn entries_range(
        &self,
        container_id: &Hash,
        from_sequence: u64,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>>;

    /// Fetch an atom's canonical bytes by hash.
    async fn atom(&self, atom_hash: &Hash) -> Result<Option<Vec<u8>>>;

    /// Insert atom bytes if not already present. Idempotent: inserting
    /// identical bytes under the same hash twice is a no-op (§3).
    async fn insert_atom(&self, atom_hash: &Hash, canonical_bytes: &[u8]) -> Result<()>;

    /// Run the full append transaction protocol (§4.E): insert the atom,
    /// re-read state under the strongest available locking, re-check
    /// tangency/sequence against that freshly read state (defeating
    /// TOCTOU between the membrane's read and this write), compute
    /// `entry_hash`, insert the entry row, and retry on serialization
    /// conflict up to the implementation's bound before surfacing
    /// [`LedgerError::ConflictExhausted`].
    ///
    /// `link_hash` is the value the membrane already computed while
    /// validating this link; passed in rather than recomputed.
    async fn append(
        &self,
        link: &ubl_link::LinkCommit,
        link_hash: &Hash,
        atom_bytes: &[u8],
    ) -> Result<LedgerEntry>;
}

pub(crate) fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
