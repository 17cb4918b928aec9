//! # UBL Tail
//!
//! The live notification bus (§4.F): a way for readers to learn "a new
//! entry landed in container X" without polling the ledger. Grounded in
//! the teacher's SSE tail endpoint, generalized two ways the original
//! lacked:
//!
//! - the signal stays minimal (`container_id:sequence`, not a full
//!   entry) but catch-up is now cursor-based: a subscriber names the
//!   sequence it already has and is handed everything it missed before
//!   switching to live dispatch, rather than only ever seeing entries
//!   committed after it happened to connect.
//! - a subscriber that falls behind is disconnected with
//!   [`TailEvent::ResumeRequired`] instead of having entries silently
//!   dropped off the back of a broadcast channel.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use ubl_kernel::Hash;
use ubl_ledger::{LedgerEntry, LedgerStore};

/// Errors surfaced while setting up a tail subscription.
#[derive(Error, Debug)]
pub enum TailError {
    /// The ledger store could not be read while computing the catch-up
    /// window.
    #[error("ledger read failed while catching up: {0}")]
    CatchUpFailed(#[from] ubl_ledger::LedgerError),
}

/// Result type for tail operations.
pub type Result<T> = std::result::Result<T, TailError>;

/// The minimal fact a commit publishes: an entry landed at this
/// sequence in this container. Subscribers fetch the full entry
/// themselves (via [`LedgerStore::entry`]) if they need it — this keeps
/// the broadcast payload small and avoids double-transporting entries
/// that a slow subscriber will fetch from the ledger anyway on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitSignal {
    /// Container the new entry belongs to.
    pub container_id: Hash,
    /// Sequence of the new entry.
    pub sequence: u64,
}

/// What a subscriber receives on its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailEvent {
    /// A ledger entry, either replayed during catch-up or forwarded
    /// live.
    Entry(LedgerEntry),
    /// The subscriber's buffer overflowed: some entries were not
    /// delivered. It must re-subscribe from its last known sequence
    /// rather than assume it has seen everything up to now.
    ResumeRequired,
}

/// The process-wide notification bus. One bus serves every container;
/// subscribers filter by `container_id` themselves (cheap, since the
/// whole signal is a `(Hash, u64)` pair).
#[derive(Clone)]
pub struct TailBus {
    tx: broadcast::Sender<CommitSignal>,
}

impl TailBus {
    /// Create a bus with the given broadcast lag tolerance: how many
    /// unconsumed signals a subscriber may fall behind by before the
    /// broadcast channel itself starts dropping the oldest ones. Falling
    /// behind this far always yields [`TailEvent::ResumeRequired`] on
    /// the next poll, never a silent gap.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish that `container_id` accepted a new entry at `sequence`.
    /// Called by the commit orchestrator immediately after a successful
    /// [`LedgerStore::append`]. No-op if nobody is currently subscribed.
    pub fn notify(&self, container_id: Hash, sequence: u64) {
        let _ = self.tx.send(CommitSignal {
            container_id,
            sequence,
        });
    }

    /// Subscribe to a container's entries from `from_sequence` onward
    /// (inclusive). Entries already in the ledger are replayed first;
    /// once caught up, the subscription switches to live dispatch.
    ///
    /// `buffer` bounds how many undelivered events may queue for this
    /// subscriber before it is disconnected with
    /// [`TailEvent::ResumeRequired`] rather than backing up the whole
    /// bus.
    pub async fn subscribe(
        &self,
        store: Arc<dyn LedgerStore>,
        container_id: Hash,
        from_sequence: u64,
        buffer: usize,
    ) -> Result<Subscription> {
        // Subscribe to live signals before reading catch-up history, so
        // nothing committed between the read and the subscribe is lost.
        let live = self.tx.subscribe();

        let catch_up = store
            .entries_range(&container_id, from_sequence.max(1), i64::MAX as usize)
            .await?;

        let (out_tx, out_rx) = mpsc::channel(buffer.max(1));

        tokio::spawn(run_subscription(
            store,
            container_id,
            catch_up,
            live,
            out_tx,
        ));

        Ok(Subscription {
            container_id,
            receiver: out_rx,
        })
    }
}

/// A live subscription to one container's tail. Implements [`futures_util::Stream`]
/// via [`Subscription::into_stream`].
pub struct Subscription {
    container_id: Hash,
    receiver: mpsc::Receiver<TailEvent>,
}

impl Subscription {
    /// The container this subscription was opened against.
    pub fn container_id(&self) -> Hash {
        self.container_id
    }

    /// Pull the next event, or `None` once the bus itself is gone.
    pub async fn next(&mut self) -> Option<TailEvent> {
        self.receiver.recv().await
    }

    /// Convert into a [`futures_util::Stream`] of [`TailEvent`], the
    /// shape an HTTP SSE handler wants.
    pub fn into_stream(self) -> ReceiverStream<TailEvent> {
        ReceiverStream::new(self.receiver)
    }
}

async fn run_subscription(
    store: Arc<dyn LedgerStore>,
    container_id: Hash,
    catch_up: Vec<LedgerEntry>,
    mut live: broadcast::Receiver<CommitSignal>,
    out_tx: mpsc::Sender<TailEvent>,
) {
    let mut last_sent = 0u64;
    for entry in catch_up {
        last_sent = entry.sequence;
        if out_tx.send(TailEvent::Entry(entry)).await.is_err() {
            return;
        }
    }

    loop {
        match live.recv().await {
            Ok(signal) => {
                if signal.container_id != container_id || signal.sequence <= last_sent {
                    continue;
                }
                match store.entry(&container_id, signal.sequence).await {
                    Ok(Some(entry)) => {
                        last_sent = entry.sequence;
                        if out_tx.try_send(TailEvent::Entry(entry)).is_err() {
                            let _ = out_tx.try_send(TailEvent::ResumeRequired);
                            return;
                        }
                    }
                    Ok(None) => continue,
                    Err(_) => {
                        let _ = out_tx.try_send(TailEvent::ResumeRequired);
                        return;
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {
                let _ = out_tx.try_send(TailEvent::ResumeRequired);
                return;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
