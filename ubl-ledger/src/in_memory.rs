//! An in-process [`LedgerStore`] backed by a single mutex. Useful for
//! tests, embedding, and local development without a database; holds the
//! lock for the whole append so it never needs the retry/backoff path
//! [`crate::postgres::PgLedgerStore`] needs against real contention.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use ubl_kernel::Hash;
use ubl_link::{ContainerState, LinkCommit};

use crate::{now_ms, LedgerEntry, LedgerError, LedgerStore, Result};

#[derive(Default)]
struct State {
    atoms: HashMap<Hash, Vec<u8>>,
    chains: HashMap<Hash, Vec<LedgerEntry>>,
    by_entry_hash: HashMap<Hash, (Hash, u64)>,
    by_link_hash: HashMap<(Hash, Hash), u64>,
}

/// An in-memory [`LedgerStore`]. Entries never leave the process; drop
/// the store and the history is gone, same as any other in-memory
/// structure — this is a testing/embedding backend, not a durability
/// guarantee.
#[derive(Default)]
pub struct InMemoryLedgerStore {
    state: Mutex<State>,
}

impl InMemoryLedgerStore {
    /// Create an empty store with no containers.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn state(&self, container_id: &Hash) -> Result<ContainerState> {
        let state = self.state.lock().await;
        Ok(state
            .chains
            .get(container_id)
            .and_then(|chain| chain.last())
            .map(|last| ContainerState {
                last_sequence: last.sequence,
                last_entry_hash: last.entry_hash,
            })
            .unwrap_or_default())
    }

    async fn entry(&self, container_id: &Hash, sequence: u64) -> Result<Option<LedgerEntry>> {
        if sequence == 0 {
            return Ok(None);
        }
        let state = self.state.lock().await;
        Ok(state
            .chains
            .get(container_id)
            .and_then(|chain| chain.get((sequence - 1) as usize))
            .cloned())
    }

    async fn entry_by_hash(&self, entry_hash: &Hash) -> Result<Option<LedgerEntry>> {
        let state = self.state.lock().await;
        match state.by_entry_hash.get(entry_hash) {
            Some((container_id, sequence)) => Ok(state
                .chains
                .get(container_id)
                .and_then(|chain| chain.get((*sequence - 1) as usize))
                .cloned()),
            None => Ok(None),
        }
    }

    async fn entry_by_link_hash(
        &self,
        container_id: &Hash,
        link_hash: &Hash,
    ) -> Result<Option<LedgerEntry>> {
        let state = self.state.lock().await;
        match state.by_link_hash.get(&(*container_id, *link_hash)) {
            Some(sequence) => Ok(state
                .chains
                .get(container_id)
                .and_then(|chain| chain.get((*sequence - 1) as usize))
                .cloned()),
            None => Ok(None),
        }
    }

    async fn entries_range(
        &self,
        container_id: &Hash,
        from_sequence: u64,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        let chain = match state.chains.get(container_id) {
            Some(chain) => chain,
            None => return Ok(Vec::new()),
        };
        let start = from_sequence.saturating_sub(1) as usize;
        Ok(chain.iter().skip(start).take(limit).cloned().collect())
    }

    async fn atom(&self, atom_hash: &Hash) -> Result<Option<Vec<u8>>> {
        let state = self.state.lock().await;
        Ok(state.atoms.get(atom_hash).cloned())
    }

    async fn insert_atom(&self, atom_hash: &Hash, canonical_bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .atoms
            .entry(*atom_hash)
            .or_insert_with(|| canonical_bytes.to_vec());
        Ok(())
    }

    async fn append(
        &self,
        link: &LinkCommit,
        link_hash: &Hash,
        atom_bytes: &[u8],
    ) -> Result<LedgerEntry> {
        let mut state = self.state.lock().await;

        state
            .atoms
            .entry(link.atom_hash)
            .or_insert_with(|| atom_bytes.to_vec());

        let (last_sequence, last_entry_hash) = state
            .chains
            .get(&link.container_id)
            .and_then(|chain| chain.last())
            .map(|last| (last.sequence, last.entry_hash))
            .unwrap_or((0, ubl_kernel::GENESIS_HASH));

        if link.previous_hash != last_entry_hash {
            return Err(LedgerError::RealityDrift);
        }
        let expected = last_sequence + 1;
        if link.expected_sequence != expected {
            return Err(LedgerError::SequenceMismatch {
                expected,
                actual: link.expected_sequence,
            });
        }

        let entry_hash = ubl_kernel::hash_entry(&link.previous_hash, link_hash);
        let entry = LedgerEntry {
            container_id: link.container_id,
            sequence: expected,
            link_hash: *link_hash,
            previous_hash: link.previous_hash,
            entry_hash,
            atom_hash: link.atom_hash,
            intent_class: link.intent_class,
            physics_delta: link.physics_delta,
            timestamp_ms: now_ms(),
            author_public_key: link.author_public_key,
        };

        state
            .chains
            .entry(link.container_id)
            .or_default()
            .push(entry.clone());
        state
            .by_entry_hash
            .insert(entry_hash, (link.container_id, entry.sequence));
        state
            .by_link_hash
            .insert((link.container_id, *link_hash), entry.sequence);

        Ok(entry)
    }
}
