//! Postgres-backed [`LedgerStore`]. Grounded in the historical
//! SERIALIZABLE + `FOR UPDATE` append transaction, with two additions
//! §4.E/§6 call for that the original lacked: a bounded retry with
//! exponential backoff on serialization failure (SQLSTATE 40001)
//! instead of surfacing the conflict to the caller on the first try,
//! and no `.expect()` in the transaction body — every failure path
//! propagates through [`LedgerError::StorageUnavailable`].

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction};
use ubl_kernel::{Hash, PublicKey};
use ubl_link::{ContainerState, IntentClass, LinkCommit};

use crate::{now_ms, LedgerEntry, LedgerError, LedgerStore, Result};

const MAX_ATTEMPTS: u32 = 5;
const SERIALIZATION_FAILURE: &str = "40001";

/// A [`LedgerStore`] backed by a Postgres pool. One pool may serve many
/// containers; containers are isolated by the `container_id` column,
/// not by separate tables or schemas.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Wrap an already-connected pool. Running the migrations under
    /// `ubl-ledger/migrations` is the caller's responsibility, the same
    /// way the teacher's binaries ran theirs at startup.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn is_serialization_failure(err: &sqlx::Error) -> bool {
        matches!(
            err,
            sqlx::Error::Database(db) if db.code().as_deref() == Some(SERIALIZATION_FAILURE)
        )
    }

    async fn backoff(attempt: u32) {
        let millis = 10u64.saturating_mul(1u64 << attempt.min(10));
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }

    async fn try_append(
        &self,
        link: &LinkCommit,
        link_hash: &Hash,
        atom_bytes: &[u8],
    ) -> std::result::Result<LedgerEntry, AttemptError> {
        let mut tx: Transaction<'_, Postgres> =
            self.pool.begin().await.map_err(AttemptError::storage)?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(AttemptError::storage)?;

        let row = sqlx::query(
            r#"
            SELECT sequence, entry_hash
            FROM ledger_entry
            WHERE container_id = $1
            ORDER BY sequence DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(link.container_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(AttemptError::storage)?;

        let (last_sequence, last_entry_hash) = match row {
            Some(r) => {
                let sequence: i64 = r.try_get("sequence").map_err(AttemptError::storage)?;
                let entry_hash: String =
                    r.try_get("entry_hash").map_err(AttemptError::storage)?;
                let entry_hash: Hash = entry_hash
                    .parse()
                    .map_err(|_| AttemptError::Logical(LedgerError::StorageUnavailable(
                        "corrupt entry_hash in ledger_entry row".into(),
                    )))?;
                (sequence as u64, entry_hash)
            }
            None => (0, ubl_kernel::GENESIS_HASH),
        };

        if link.previous_hash != last_entry_hash {
            return Err(AttemptError::Logical(LedgerError::RealityDrift));
        }
        let expected = last_sequence + 1;
        if link.expected_sequence != expected {
            return Err(AttemptError::Logical(LedgerError::SequenceMismatch {
                expected,
                actual: link.expected_sequence,
            }));
        }

        let entry_hash = ubl_kernel::hash_entry(&link.previous_hash, link_hash);
        let timestamp_ms = now_ms();

        sqlx::query(
            r#"
            INSERT INTO ledger_entry
                (container_id, sequence, link_hash, previous_hash, entry_hash,
                 atom_hash, intent_class, physics_delta, timestamp_ms, author_public_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(link.container_id.to_string())
        .bind(expected as i64)
        .bind(link_hash.to_string())
        .bind(link.previous_hash.to_string())
        .bind(entry_hash.to_string())
        .bind(link.atom_hash.to_string())
        .bind(intent_class_label(link.intent_class))
        .bind(link.physics_delta.to_string())
        .bind(timestamp_ms)
        .bind(link.author_public_key.to_string())
        .execute(&mut *tx)
        .await
        .map_err(AttemptError::storage)?;

        sqlx::query(
            r#"
            INSERT INTO ledger_atom (atom_hash, canonical_bytes)
            VALUES ($1, $2)
            ON CONFLICT (atom_hash) DO NOTHING
            "#,
        )
        .bind(link.atom_hash.to_string())
        .bind(atom_bytes)
        .execute(&mut *tx)
        .await
        .map_err(AttemptError::storage)?;

        tx.commit().await.map_err(AttemptError::storage)?;

        Ok(LedgerEntry {
            container_id: link.container_id,
            sequence: expected,
            link_hash: *link_hash,
            previous_hash: link.previous_hash,
            entry_hash,
            atom_hash: link.atom_hash,
            intent_class: link.intent_class,
            physics_delta: link.physics_delta,
            timestamp_ms,
            author_public_key: link.author_public_key,
        })
    }
}

enum AttemptError {
    Retryable,
    Logical(LedgerError),
}

impl AttemptError {
    fn storage(err: sqlx::Error) -> Self {
        if PgLedgerStore::is_serialization_failure(&err) {
            AttemptError::Retryable
        } else {
            AttemptError::Logical(LedgerError::StorageUnavailable(err.to_string()))
        }
    }
}

fn intent_class_label(class: IntentClass) -> &'static str {
    match class {
        IntentClass::Observation => "observation",
        IntentClass::Conservation => "conservation",
        IntentClass::Entropy => "entropy",
        IntentClass::Evolution => "evolution",
    }
}

fn parse_intent_class(label: &str) -> Result<IntentClass> {
    match label {
        "observation" => Ok(IntentClass::Observation),
        "conservation" => Ok(IntentClass::Conservation),
        "entropy" => Ok(IntentClass::Entropy),
        "evolution" => Ok(IntentClass::Evolution),
        other => Err(LedgerError::StorageUnavailable(format!(
            "unknown intent_class in storage: {other}"
        ))),
    }
}

fn parse_hash(raw: &str, field: &'static str) -> Result<Hash> {
    raw.parse()
        .map_err(|_| LedgerError::StorageUnavailable(format!("corrupt {field} in storage")))
}

fn row_to_entry(row: sqlx::postgres::PgRow) -> Result<LedgerEntry> {
    let sequence: i64 = row
        .try_get("sequence")
        .map_err(|e| LedgerError::StorageUnavailable(e.to_string()))?;
    let physics_delta: String = row
        .try_get("physics_delta")
        .map_err(|e| LedgerError::StorageUnavailable(e.to_string()))?;
    let intent_class: String = row
        .try_get("intent_class")
        .map_err(|e| LedgerError::StorageUnavailable(e.to_string()))?;
    let container_id: String = row
        .try_get("container_id")
        .map_err(|e| LedgerError::StorageUnavailable(e.to_string()))?;
    let link_hash: String = row
        .try_get("link_hash")
        .map_err(|e| LedgerError::StorageUnavailable(e.to_string()))?;
    let previous_hash: String = row
        .try_get("previous_hash")
        .map_err(|e| LedgerError::StorageUnavailable(e.to_string()))?;
    let entry_hash: String = row
        .try_get("entry_hash")
        .map_err(|e| LedgerError::StorageUnavailable(e.to_string()))?;
    let atom_hash: String = row
        .try_get("atom_hash")
        .map_err(|e| LedgerError::StorageUnavailable(e.to_string()))?;
    let author_public_key: String = row
        .try_get("author_public_key")
        .map_err(|e| LedgerError::StorageUnavailable(e.to_string()))?;
    let timestamp_ms: i64 = row
        .try_get("timestamp_ms")
        .map_err(|e| LedgerError::StorageUnavailable(e.to_string()))?;

    Ok(LedgerEntry {
        container_id: parse_hash(&container_id, "container_id")?,
        sequence: sequence as u64,
        link_hash: parse_hash(&link_hash, "link_hash")?,
        previous_hash: parse_hash(&previous_hash, "previous_hash")?,
        entry_hash: parse_hash(&entry_hash, "entry_hash")?,
        atom_hash: parse_hash(&atom_hash, "atom_hash")?,
        intent_class: parse_intent_class(&intent_class)?,
        physics_delta: physics_delta
            .parse()
            .map_err(|_| LedgerError::StorageUnavailable("corrupt physics_delta".into()))?,
        timestamp_ms,
        author_public_key: {
            let bytes: PublicKey = author_public_key
                .parse()
                .map_err(|_| LedgerError::StorageUnavailable("corrupt author_public_key".into()))?;
            bytes
        },
    })
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn state(&self, container_id: &Hash) -> Result<ContainerState> {
        let row = sqlx::query(
            r#"
            SELECT sequence, entry_hash
            FROM ledger_entry
            WHERE container_id = $1
            ORDER BY sequence DESC
            LIMIT 1
            "#,
        )
        .bind(container_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LedgerError::StorageUnavailable(e.to_string()))?;

        match row {
            Some(r) => {
                let sequence: i64 = r
                    .try_get("sequence")
                    .map_err(|e| LedgerError::StorageUnavailable(e.to_string()))?;
                let entry_hash: String = r
                    .try_get("entry_hash")
                    .map_err(|e| LedgerError::StorageUnavailable(e.to_string()))?;
                Ok(ContainerState {
                    last_sequence: sequence as u64,
                    last_entry_hash: parse_hash(&entry_hash, "entry_hash")?,
                })
            }
            None => Ok(ContainerState::genesis()),
        }
    }

    async fn entry(&self, container_id: &Hash, sequence: u64) -> Result<Option<LedgerEntry>> {
        let row = sqlx::query(
            "SELECT * FROM ledger_entry WHERE container_id = $1 AND sequence = $2",
        )
        .bind(container_id.to_string())
        .bind(sequence as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LedgerError::StorageUnavailable(e.to_string()))?;

        row.map(row_to_entry).transpose()
    }

    async fn entry_by_hash(&self, entry_hash: &Hash) -> Result<Option<LedgerEntry>> {
        let row = sqlx::query("SELECT * FROM ledger_entry WHERE entry_hash = $1")
            .bind(entry_hash.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LedgerError::StorageUnavailable(e.to_string()))?;

        row.map(row_to_entry).transpose()
    }

    async fn entry_by_link_hash(
        &self,
        container_id: &Hash,
        link_hash: &Hash,
    ) -> Result<Option<LedgerEntry>> {
        let row = sqlx::query(
            "SELECT * FROM ledger_entry WHERE container_id = $1 AND link_hash = $2",
        )
        .bind(container_id.to_string())
        .bind(link_hash.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LedgerError::StorageUnavailable(e.to_string()))?;

        row.map(row_to_entry).transpose()
    }

    async fn entries_range(
        &self,
        container_id: &Hash,
        from_sequence: u64,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM ledger_entry
            WHERE container_id = $1 AND sequence >= $2
            ORDER BY sequence ASC
            LIMIT $3
            "#,
        )
        .bind(container_id.to_string())
        .bind(from_sequence as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LedgerError::StorageUnavailable(e.to_string()))?;

        rows.into_iter().map(row_to_entry).collect()
    }

    async fn atom(&self, atom_hash: &Hash) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT canonical_bytes FROM ledger_atom WHERE atom_hash = $1")
            .bind(atom_hash.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LedgerError::StorageUnavailable(e.to_string()))?;

        row.map(|r| r.try_get::<Vec<u8>, _>("canonical_bytes"))
            .transpose()
            .map_err(|e| LedgerError::StorageUnavailable(e.to_string()))
    }

    async fn insert_atom(&self, atom_hash: &Hash, canonical_bytes: &[u8]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_atom (atom_hash, canonical_bytes)
            VALUES ($1, $2)
            ON CONFLICT (atom_hash) DO NOTHING
            "#,
        )
        .bind(atom_hash.to_string())
        .bind(canonical_bytes)
        .execute(&self.pool)
        .await
        .map_err(|e| LedgerError::StorageUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn append(
        &self,
        link: &LinkCommit,
        link_hash: &Hash,
        atom_bytes: &[u8],
    ) -> Result<LedgerEntry> {
        for attempt in 0..MAX_ATTEMPTS {
            match self.try_append(link, link_hash, atom_bytes).await {
                Ok(entry) => return Ok(entry),
                Err(AttemptError::Logical(err)) => return Err(err),
                Err(AttemptError::Retryable) => {
                    tracing::warn!(attempt, container_id = %link.container_id, "serialization conflict, retrying");
                    Self::backoff(attempt).await;
                }
            }
        }
        Err(LedgerError::ConflictExhausted {
            attempts: MAX_ATTEMPTS,
        })
    }
}
