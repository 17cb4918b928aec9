//! # UBL Commit
//!
//! The Commit API (§4.G): orchestrates the membrane, the ledger, and
//! the tail bus behind a single `accept()` call, and makes the whole
//! thing idempotent by `(container_id, link_hash)` so a client that
//! retries a timed-out request gets its original receipt back instead
//! of a fresh rejection.
//!
//! No teacher file does this orchestration in one place — the teacher
//! inlines membrane-equivalent checks, `PgLedger::append`, and
//! `TailBus::notify` directly into its axum handler. This crate pulls
//! that handler body out into a reusable, transport-agnostic API, the
//! same move the teacher itself made for `messenger_gateway`'s
//! idempotency handling (check-before-validate, return the cached
//! result) — just keyed by ledger state instead of an in-memory cache.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use thiserror::Error;
use ubl_kernel::Hash;
use ubl_ledger::LedgerStore;
use ubl_link::LinkCommit;
use ubl_membrane::{ContainerConfig, MembraneError};
use ubl_pact::PactVerifier;
use ubl_tail::TailBus;

/// Per-container configuration the Commit API needs beyond what's in
/// the request: the Evolution risk tier and the pact verifier to
/// consult. Supplied by whatever owns container configuration — the
/// core does not persist this itself (§4.D's `ContainerConfig` is
/// likewise caller-supplied).
pub trait ContainerRegistry: Send + Sync {
    /// Admission configuration for this container.
    fn config(&self, container_id: &Hash) -> ContainerConfig;
    /// The pact verifier to consult for this container's Entropy/Evolution
    /// links, or `None` if it never authorizes those classes.
    fn pact_verifier(&self, container_id: &Hash) -> Option<Arc<dyn PactVerifier>>;
}

/// Errors from [`CommitApi::accept`] (§4.G, §7). Mirrors the eight
/// membrane rejections plus the ledger-layer failures that can only be
/// detected once the append transaction re-reads state.
#[derive(Error, Debug)]
pub enum CommitError {
    /// The link or its atom could not be canonicalized, or the atom
    /// bytes supplied do not hash to the link's `atom_hash`.
    #[error("encoding error: {0}")]
    EncodingError(String),

    /// One of the eight membrane admission checks rejected the link.
    #[error(transparent)]
    Membrane(#[from] MembraneError),

    /// The ledger store rejected the append — typically a TOCTOU
    /// re-check of tangency/sequence, or retry exhaustion.
    #[error(transparent)]
    Ledger(#[from] ubl_ledger::LedgerError),
}

/// Result type for commit operations.
pub type Result<T> = std::result::Result<T, CommitError>;

/// What a successful commit returns (§6): enough to let the caller
/// locate the entry later without re-deriving anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterializationReceipt {
    /// The container the entry was written to.
    pub container_id: Hash,
    /// The entry's sequence within its container.
    pub sequence: u64,
    /// The entry's own hash.
    pub entry_hash: Hash,
    /// Wall-clock acceptance time, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

/// Whether a commit actually appended a new entry or replayed one that
/// already existed for this `(container_id, link_hash)` (§4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A new entry was appended.
    Accepted(MaterializationReceipt),
    /// An entry for this exact link already existed; no new entry was
    /// written and the membrane did not re-run.
    IdempotentReplay(MaterializationReceipt),
}

impl Outcome {
    /// The receipt regardless of which variant this is.
    pub fn receipt(&self) -> MaterializationReceipt {
        match self {
            Outcome::Accepted(r) | Outcome::IdempotentReplay(r) => *r,
        }
    }
}

/// Orchestrates membrane validation, ledger append, and tail
/// notification behind one call (§4.G).
pub struct CommitApi {
    store: Arc<dyn LedgerStore>,
    tail: TailBus,
    registry: Arc<dyn ContainerRegistry>,
}

impl CommitApi {
    /// Build a Commit API over a ledger store, tail bus, and
    /// per-container configuration source.
    pub fn new(
        store: Arc<dyn LedgerStore>,
        tail: TailBus,
        registry: Arc<dyn ContainerRegistry>,
    ) -> Self {
        Self {
            store,
            tail,
            registry,
        }
    }

    /// Validate and, if accepted, durably append `link` with its atom
    /// bytes, notifying tail subscribers on success (§4.G).
    ///
    /// Idempotent: if an entry already exists for `(link.container_id,
    /// link_hash)`, that entry's receipt is returned as
    /// [`Outcome::IdempotentReplay`] without re-running the membrane or
    /// touching the ledger again.
    pub async fn accept(&self, link: &LinkCommit, atom_bytes: &[u8]) -> Result<Outcome> {
        let link_hash = link
            .link_hash()
            .map_err(|e| CommitError::EncodingError(e.to_string()))?;

        let atom_text = std::str::from_utf8(atom_bytes)
            .map_err(|e| CommitError::EncodingError(e.to_string()))?;
        let canonical_atom = ubl_atom::canonicalize_str(atom_text)
            .map_err(|e| CommitError::EncodingError(e.to_string()))?;
        let atom_hash = ubl_kernel::hash_atom(&canonical_atom);
        if atom_hash != link.atom_hash {
            return Err(CommitError::EncodingError(
                "atom bytes do not hash to the link's atom_hash".to_string(),
            ));
        }

        if let Some(existing) = self
            .store
            .entry_by_link_hash(&link.container_id, &link_hash)
            .await?
        {
            return Ok(Outcome::IdempotentReplay(receipt_of(&existing)));
        }

        let state = self.store.state(&link.container_id).await?;
        let config = self.registry.config(&link.container_id);
        let verifier = self.registry.pact_verifier(&link.container_id);

        ubl_membrane::validate(
            link,
            link.container_id,
            &state,
            &config,
            verifier.as_deref(),
            now_ms(),
        )?;

        let entry = self
            .store
            .append(link, &link_hash, &canonical_atom)
            .await?;

        self.tail.notify(entry.container_id, entry.sequence);

        Ok(Outcome::Accepted(receipt_of(&entry)))
    }

    /// Run the membrane's eight checks without touching the ledger
    /// (`POST /validate`). Still idempotency-aware in the sense that it
    /// reads current state, but never writes and never notifies tail.
    pub async fn validate_only(
        &self,
        link: &LinkCommit,
    ) -> std::result::Result<ubl_membrane::AcceptedLink, MembraneError> {
        let state = self
            .store
            .state(&link.container_id)
            .await
            .map_err(|_| MembraneError::ContainerMismatch)?;
        let config = self.registry.config(&link.container_id);
        let verifier = self.registry.pact_verifier(&link.container_id);

        ubl_membrane::validate(
            link,
            link.container_id,
            &state,
            &config,
            verifier.as_deref(),
            now_ms(),
        )
    }
}

fn receipt_of(entry: &ubl_ledger::LedgerEntry) -> MaterializationReceipt {
    MaterializationReceipt {
        container_id: entry.container_id,
        sequence: entry.sequence,
        entry_hash: entry.entry_hash,
        timestamp_ms: entry.timestamp_ms,
    }
}

fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
