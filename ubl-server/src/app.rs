//! Route handlers and router assembly for the §6 wire API.
//!
//! Grounded in the teacher's `main.rs` handler style (one function per
//! route, `State<AppState>` extraction, `tower-http` CORS/trace layers)
//! but rebuilt against `ubl-commit`/`ubl-ledger`/`ubl-tail` instead of
//! the teacher's direct `sqlx` calls.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use ubl_commit::{CommitApi, CommitError, ContainerRegistry, Outcome};
use ubl_kernel::{Hash, PublicKey};
use ubl_ledger::{LedgerEntry, LedgerError, LedgerStore};
use ubl_link::{IntentClass, LinkCommit};
use ubl_membrane::MembraneError;
use ubl_tail::{TailBus, TailEvent};

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// The commit orchestrator (membrane → ledger → tail).
    pub commit: Arc<CommitApi>,
    /// The ledger store directly, for read-only routes that don't need
    /// the commit orchestrator's idempotency/validation machinery.
    pub store: Arc<dyn LedgerStore>,
    /// The tail bus, for subscribing to live commits.
    pub tail: TailBus,
    /// Per-container configuration, shared with `commit` so read routes
    /// can report the same config the membrane actually enforces.
    pub registry: Arc<dyn ContainerRegistry>,
}

/// Build the router: the six §6 wire routes plus an ambient `/health`.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(route_health))
        .route("/commit", post(route_commit))
        .route("/validate", post(route_validate))
        .route("/state/:container_id", get(route_state))
        .route("/ledger/:container_id/tail", get(route_tail))
        .route("/atom/:atom_hash", get(route_atom))
        .route("/entry/:container_id/:sequence", get(route_entry))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn route_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Wire shape of [`ubl_commit::MaterializationReceipt`] (§6).
#[derive(Serialize)]
struct ReceiptWire {
    container_id: Hash,
    sequence: u64,
    entry_hash: Hash,
    timestamp_ms: i64,
}

impl From<ubl_commit::MaterializationReceipt> for ReceiptWire {
    fn from(r: ubl_commit::MaterializationReceipt) -> Self {
        ReceiptWire {
            container_id: r.container_id,
            sequence: r.sequence,
            entry_hash: r.entry_hash,
            timestamp_ms: r.timestamp_ms,
        }
    }
}

/// The `{kind, detail}` error shape §6/§7 specify, with an optional
/// embedded receipt for `IdempotentReplay`.
#[derive(Serialize)]
struct ErrorBody {
    kind: &'static str,
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    receipt: Option<ReceiptWire>,
}

fn membrane_kind(err: &MembraneError) -> &'static str {
    match err {
        MembraneError::VersionUnsupported(_) => "VersionUnsupported",
        MembraneError::SignatureInvalid => "SignatureInvalid",
        MembraneError::ContainerMismatch => "ContainerMismatch",
        MembraneError::RealityDrift => "RealityDrift",
        MembraneError::SequenceMismatch { .. } => "SequenceMismatch",
        MembraneError::PhysicsViolation { .. } => "PhysicsViolation",
        MembraneError::PactViolation { .. } => "PactViolation",
        MembraneError::UnauthorizedEvolution { .. } => "UnauthorizedEvolution",
    }
}

fn membrane_status(err: &MembraneError) -> StatusCode {
    match err {
        MembraneError::VersionUnsupported(_) | MembraneError::ContainerMismatch => {
            StatusCode::BAD_REQUEST
        }
        MembraneError::SignatureInvalid
        | MembraneError::PactViolation { .. }
        | MembraneError::UnauthorizedEvolution { .. } => StatusCode::FORBIDDEN,
        MembraneError::RealityDrift | MembraneError::SequenceMismatch { .. } => {
            StatusCode::CONFLICT
        }
        MembraneError::PhysicsViolation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

fn ledger_status(err: &LedgerError) -> StatusCode {
    match err {
        LedgerError::RealityDrift | LedgerError::SequenceMismatch { .. } => StatusCode::CONFLICT,
        LedgerError::ConflictExhausted { .. } | LedgerError::StorageUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

fn ledger_kind(err: &LedgerError) -> &'static str {
    match err {
        LedgerError::RealityDrift => "RealityDrift",
        LedgerError::SequenceMismatch { .. } => "SequenceMismatch",
        LedgerError::ConflictExhausted { .. } => "ConflictExhausted",
        LedgerError::StorageUnavailable(_) => "StorageUnavailable",
    }
}

fn commit_error_response(err: CommitError) -> axum::response::Response {
    let (status, kind) = match &err {
        CommitError::EncodingError(_) => (StatusCode::BAD_REQUEST, "EncodingError"),
        CommitError::Membrane(e) => (membrane_status(e), membrane_kind(e)),
        CommitError::Ledger(e) => (ledger_status(e), ledger_kind(e)),
    };
    let body = ErrorBody {
        kind,
        detail: err.to_string(),
        receipt: None,
    };
    (status, Json(body)).into_response()
}

/// The body `POST /commit` and `POST /validate` both accept: the link
/// envelope plus the atom it references. The membrane only ever sees
/// `atom_hash`; the atom's own bytes are needed here so the ledger has
/// something to store and the hash can be checked against what the
/// caller claims.
///
/// `atom` is captured as [`serde_json::value::RawValue`], not `Value` —
/// a `Value` has already collapsed duplicate object keys by the time
/// this struct finishes deserializing, which would silently defeat
/// `ubl_atom::canonicalize_str`'s duplicate-key rejection for every atom
/// submitted over the wire. `RawValue` preserves the exact submitted
/// bytes, duplicates included, so the canonicalizer is the one place
/// that decides whether they're rejected.
#[derive(Deserialize)]
struct LinkSubmission {
    link: LinkCommit,
    atom: Box<serde_json::value::RawValue>,
}

async fn route_commit(
    State(state): State<AppState>,
    Json(body): Json<LinkSubmission>,
) -> axum::response::Response {
    let atom_bytes = body.atom.get().as_bytes();

    match state.commit.accept(&body.link, atom_bytes).await {
        Ok(Outcome::Accepted(receipt)) => {
            (StatusCode::OK, Json(ReceiptWire::from(receipt))).into_response()
        }
        Ok(Outcome::IdempotentReplay(receipt)) => (
            StatusCode::OK,
            Json(ErrorBody {
                kind: "IdempotentReplay",
                detail: "a commit for this link_hash already exists".to_string(),
                receipt: Some(ReceiptWire::from(receipt)),
            }),
        )
            .into_response(),
        Err(e) => commit_error_response(e),
    }
}

#[derive(Serialize)]
#[serde(tag = "decision")]
enum ValidateResponse {
    Accept,
    Reject { kind: &'static str, detail: String },
}

async fn route_validate(
    State(state): State<AppState>,
    Json(body): Json<LinkSubmission>,
) -> axum::response::Response {
    match state.commit.validate_only(&body.link).await {
        Ok(_) => (StatusCode::OK, Json(ValidateResponse::Accept)).into_response(),
        Err(e) => {
            let status = membrane_status(&e);
            let body = ValidateResponse::Reject {
                kind: membrane_kind(&e),
                detail: e.to_string(),
            };
            (status, Json(body)).into_response()
        }
    }
}

#[derive(Serialize)]
struct StateWire {
    last_sequence: u64,
    last_entry_hash: Hash,
}

async fn route_state(
    State(state): State<AppState>,
    Path(container_id): Path<Hash>,
) -> axum::response::Response {
    match state.store.state(&container_id).await {
        Ok(s) => (
            StatusCode::OK,
            Json(StateWire {
                last_sequence: s.last_sequence,
                last_entry_hash: s.last_entry_hash,
            }),
        )
            .into_response(),
        Err(e) => (ledger_status(&e), Json(ledger_error_body(&e))).into_response(),
    }
}

fn ledger_error_body(e: &LedgerError) -> ErrorBody {
    ErrorBody {
        kind: ledger_kind(e),
        detail: e.to_string(),
        receipt: None,
    }
}

/// Wire shape of a tail event (§6): deliberately narrower than the full
/// entry record — no `container_id` or `previous_hash`, since a tail
/// subscriber already knows which container it asked for and the chain
/// linkage is this event's problem to verify, not the client's.
#[serde_as]
#[derive(Serialize)]
struct TailEntryWire {
    sequence: u64,
    entry_hash: Hash,
    link_hash: Hash,
    atom_hash: Hash,
    intent_class: IntentClass,
    #[serde_as(as = "DisplayFromStr")]
    physics_delta: i128,
    timestamp_ms: i64,
    author_public_key: PublicKey,
}

impl From<&LedgerEntry> for TailEntryWire {
    fn from(e: &LedgerEntry) -> Self {
        TailEntryWire {
            sequence: e.sequence,
            entry_hash: e.entry_hash,
            link_hash: e.link_hash,
            atom_hash: e.atom_hash,
            intent_class: e.intent_class,
            physics_delta: e.physics_delta,
            timestamp_ms: e.timestamp_ms,
            author_public_key: e.author_public_key,
        }
    }
}

#[derive(Deserialize)]
struct TailQuery {
    #[serde(default)]
    from: Option<u64>,
}

const TAIL_SUBSCRIBER_BUFFER: usize = 256;

async fn route_tail(
    State(state): State<AppState>,
    Path(container_id): Path<Hash>,
    Query(query): Query<TailQuery>,
) -> axum::response::Response {
    let from_sequence = query.from.unwrap_or(1).max(1);

    let subscription = match state
        .tail
        .subscribe(state.store.clone(), container_id, from_sequence, TAIL_SUBSCRIBER_BUFFER)
        .await
    {
        Ok(s) => s,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorBody {
                    kind: "StorageUnavailable",
                    detail: e.to_string(),
                    receipt: None,
                }),
            )
                .into_response()
        }
    };

    let stream = subscription
        .into_stream()
        .map(|event| -> Result<Event, std::convert::Infallible> {
            match event {
                TailEvent::Entry(entry) => Ok(Event::default()
                    .event("entry")
                    .id(entry.sequence.to_string())
                    .json_data(TailEntryWire::from(&entry))
                    .unwrap_or_else(|_| Event::default().event("error"))),
                TailEvent::ResumeRequired => Ok(Event::default()
                    .event("resume_required")
                    .data("subscriber fell behind; reconnect with ?from=<last sequence you saw>+1")),
            }
        });

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn route_atom(
    State(state): State<AppState>,
    Path(atom_hash): Path<Hash>,
) -> axum::response::Response {
    match state.store.atom(&atom_hash).await {
        Ok(Some(bytes)) => (
            StatusCode::OK,
            [("content-type", "application/ubl-atom+json")],
            bytes,
        )
            .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                kind: "NotFound",
                detail: format!("no atom for hash {atom_hash}"),
                receipt: None,
            }),
        )
            .into_response(),
        Err(e) => (ledger_status(&e), Json(ledger_error_body(&e))).into_response(),
    }
}

/// Wire shape of a full entry record (§6): every field `LedgerEntry`
/// carries, the only route that exposes `container_id`/`previous_hash`
/// directly since this is the one meant for point lookups and audit,
/// not streaming.
#[serde_as]
#[derive(Serialize)]
struct EntryWire {
    container_id: Hash,
    sequence: u64,
    link_hash: Hash,
    previous_hash: Hash,
    entry_hash: Hash,
    atom_hash: Hash,
    intent_class: IntentClass,
    #[serde_as(as = "DisplayFromStr")]
    physics_delta: i128,
    timestamp_ms: i64,
    author_public_key: PublicKey,
}

impl From<LedgerEntry> for EntryWire {
    fn from(e: LedgerEntry) -> Self {
        EntryWire {
            container_id: e.container_id,
            sequence: e.sequence,
            link_hash: e.link_hash,
            previous_hash: e.previous_hash,
            entry_hash: e.entry_hash,
            atom_hash: e.atom_hash,
            intent_class: e.intent_class,
            physics_delta: e.physics_delta,
            timestamp_ms: e.timestamp_ms,
            author_public_key: e.author_public_key,
        }
    }
}

async fn route_entry(
    State(state): State<AppState>,
    Path((container_id, sequence)): Path<(Hash, u64)>,
) -> axum::response::Response {
    match state.store.entry(&container_id, sequence).await {
        Ok(Some(entry)) => (StatusCode::OK, Json(EntryWire::from(entry))).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                kind: "NotFound",
                detail: format!("no entry at sequence {sequence} in container {container_id}"),
                receipt: None,
            }),
        )
            .into_response(),
        Err(e) => (ledger_status(&e), Json(ledger_error_body(&e))).into_response(),
    }
}

/// A [`ContainerRegistry`] that applies one [`ubl_membrane::ContainerConfig`]
/// and one [`ubl_pact::PactVerifier`] to every container. Sufficient for a
/// deployment with a single shared pact registry; a multi-tenant deployment
/// would replace this with one backed by a per-container configuration
/// table, without touching `ubl-commit` or anything upstream of it.
pub struct UniformRegistry {
    config: ubl_membrane::ContainerConfig,
    pact_verifier: Option<Arc<dyn ubl_pact::PactVerifier>>,
}

impl UniformRegistry {
    /// Build a registry that applies the same config/verifier everywhere.
    pub fn new(
        config: ubl_membrane::ContainerConfig,
        pact_verifier: Option<Arc<dyn ubl_pact::PactVerifier>>,
    ) -> Self {
        Self {
            config,
            pact_verifier,
        }
    }
}

impl ContainerRegistry for UniformRegistry {
    fn config(&self, _container_id: &Hash) -> ubl_membrane::ContainerConfig {
        self.config
    }

    fn pact_verifier(&self, _container_id: &Hash) -> Option<Arc<dyn ubl_pact::PactVerifier>> {
        self.pact_verifier.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::collections::HashMap as StdHashMap;
    use tower::ServiceExt;
    use ubl_kernel::generate_keypair;
    use ubl_ledger::InMemoryLedgerStore;
    use ubl_link::LinkBuilder;

    fn test_state() -> AppState {
        let store: Arc<dyn LedgerStore> = Arc::new(InMemoryLedgerStore::new());
        let tail = TailBus::new(64);
        let registry: Arc<dyn ContainerRegistry> =
            Arc::new(UniformRegistry::new(ubl_membrane::ContainerConfig::default(), None));
        let commit = Arc::new(CommitApi::new(store.clone(), tail.clone(), registry.clone()));
        AppState {
            commit,
            store,
            tail,
            registry,
        }
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn commit_then_state_then_entry_round_trip() {
        let app = router(test_state());
        let (_, key) = generate_keypair();
        let cid = Hash([7; 32]);
        let atom = serde_json::json!({"hello": "world"});
        let atom_hash = ubl_atom::atom_hash_value(&atom).unwrap();
        let link = LinkBuilder::new(
            cid,
            1,
            ubl_kernel::GENESIS_HASH,
            atom_hash,
            IntentClass::Observation,
            0,
        )
        .build(&key)
        .unwrap();

        let mut body = StdHashMap::new();
        body.insert("link", serde_json::to_value(&link).unwrap());
        body.insert("atom", atom);

        let commit_response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/commit")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(commit_response.status(), StatusCode::OK);

        let state_response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/state/{cid}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(state_response.status(), StatusCode::OK);

        let entry_response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/entry/{cid}/1"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(entry_response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn committing_an_atom_with_duplicate_keys_is_rejected() {
        // Built as raw JSON text, not `serde_json::Value` — a `Value`
        // collapses duplicate keys on construction, which would hide the
        // exact thing this test needs to submit over the wire.
        let app = router(test_state());
        let (_, key) = generate_keypair();
        let cid = Hash([8; 32]);
        let atom_hash = ubl_atom::atom_hash_value(&serde_json::json!({"a": 1})).unwrap();
        let link = LinkBuilder::new(
            cid,
            1,
            ubl_kernel::GENESIS_HASH,
            atom_hash,
            IntentClass::Observation,
            0,
        )
        .build(&key)
        .unwrap();

        let body = format!(
            r#"{{"link":{},"atom":{{"a":1,"a":2}}}}"#,
            serde_json::to_string(&link).unwrap()
        );

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/commit")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_container_state_is_genesis_not_an_error() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/state/{}", Hash([0xAB; 32])))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
