//! # UBL Pact
//!
//! Authority, consensus, and risk management for links whose intent class
//! demands more than a single author's signature. A pact defines who may
//! authorize a link and under what conditions; the membrane only needs to
//! know whether a presented [`ubl_link::PactProof`] satisfies *some*
//! registered pact, so the threshold/quorum algebra itself lives behind
//! the [`PactVerifier`] trait and can be swapped out without touching the
//! membrane.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ubl_kernel::{Hash, PublicKey};
use ubl_link::{IntentClass, PactProof};

/// Risk levels, ordered from least to most consequential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
    /// Pure observation.
    L0 = 0,
    /// Low impact.
    L1 = 1,
    /// Local impact.
    L2 = 2,
    /// Financial impact.
    L3 = 3,
    /// Systemic impact.
    L4 = 4,
    /// Sovereignty / evolution of the rules themselves.
    L5 = 5,
}

/// The scope a pact applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PactScope {
    /// Valid for a single container.
    Container(Hash),
    /// Valid for a named namespace of containers.
    Namespace(String),
    /// Valid system-wide.
    Global,
}

/// The time window during which a pact is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Earliest valid time (Unix ms).
    pub not_before: i64,
    /// Latest valid time (Unix ms).
    pub not_after: i64,
}

impl TimeWindow {
    /// Whether a timestamp falls within `[not_before, not_after]`.
    pub fn contains(&self, timestamp_ms: i64) -> bool {
        timestamp_ms >= self.not_before && timestamp_ms <= self.not_after
    }
}

/// A registered authority rule: who may jointly authorize which intent
/// classes, under which scope and time window, and with how many
/// signatures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pact {
    /// Unique pact identifier.
    pub pact_id: String,
    /// Protocol version.
    pub version: u8,
    /// Scope of application.
    pub scope: PactScope,
    /// Intent classes this pact may authorize.
    pub intent_classes: Vec<IntentClass>,
    /// Minimum distinct signatures required.
    pub threshold: u8,
    /// Authorized signer public keys.
    pub signers: HashSet<PublicKey>,
    /// Validity window.
    pub window: TimeWindow,
    /// Risk level this pact is rated for.
    pub risk_level: RiskLevel,
}

/// Errors validating a pact proof.
#[derive(Error, Debug, Clone)]
pub enum PactError {
    /// No pact in the registry matches the proof's `pact_id`.
    #[error("unknown pact: {0}")]
    UnknownPact(String),

    /// The pact's time window does not cover the current time.
    #[error("pact expired or not yet valid")]
    PactExpired,

    /// The pact does not govern the presented intent class.
    #[error("intent class is not governed by this pact (risk level {pact_level:?})")]
    UngovernedIntentClass {
        /// The pact's rated risk level.
        pact_level: RiskLevel,
    },

    /// `signer_public_keys` and `signatures` have different lengths.
    #[error("pact proof has {signers} signer keys but {signatures} signatures")]
    MalformedProof {
        /// Number of signer keys presented.
        signers: usize,
        /// Number of signatures presented.
        signatures: usize,
    },

    /// Fewer valid, distinct signatures than the pact's threshold.
    #[error("insufficient signatures: got {got}, need {need}")]
    InsufficientSignatures {
        /// Valid distinct signatures collected.
        got: usize,
        /// Threshold required.
        need: u8,
    },

    /// A signer is not in the pact's authorized set.
    #[error("unauthorized signer: {0}")]
    UnauthorizedSigner(PublicKey),

    /// The same signer key appears more than once in a proof.
    #[error("duplicate signature from: {0}")]
    DuplicateSignature(PublicKey),

    /// A signature does not verify against the pact's signing message.
    #[error("invalid signature from: {0}")]
    InvalidSignature(PublicKey),
}

/// Result type for pact operations.
pub type Result<T> = std::result::Result<T, PactError>;

/// Validates whether a presented proof satisfies a specific pact. Returns
/// the pact's [`RiskLevel`] on success so callers (the membrane's
/// Evolution authorization check) can compare it against what they
/// require without a second registry lookup.
///
/// `atom_hash`/`intent_class`/`physics_delta` must be exactly the values
/// from the link under validation — the signing message binds the proof
/// to them, so a proof collected for a different commit will not verify.
pub fn validate_pact(
    pact: &Pact,
    proof: &PactProof,
    atom_hash: &Hash,
    intent_class: IntentClass,
    physics_delta: i128,
    current_time_ms: i64,
) -> Result<RiskLevel> {
    if proof.pact_id != pact.pact_id {
        return Err(PactError::UnknownPact(proof.pact_id.clone()));
    }

    if !pact.window.contains(current_time_ms) {
        return Err(PactError::PactExpired);
    }

    if !pact.intent_classes.contains(&intent_class) {
        return Err(PactError::UngovernedIntentClass {
            pact_level: pact.risk_level,
        });
    }

    if proof.signer_public_keys.len() != proof.signatures.len() {
        return Err(PactError::MalformedProof {
            signers: proof.signer_public_keys.len(),
            signatures: proof.signatures.len(),
        });
    }

    let sign_message = build_pact_sign_message(&pact.pact_id, atom_hash, intent_class, physics_delta);

    let mut valid_signers: HashSet<PublicKey> = HashSet::new();
    for (signer, signature) in proof.signer_public_keys.iter().zip(proof.signatures.iter()) {
        if valid_signers.contains(signer) {
            return Err(PactError::DuplicateSignature(*signer));
        }
        if !pact.signers.contains(signer) {
            return Err(PactError::UnauthorizedSigner(*signer));
        }
        if ubl_kernel::verify(signer, &sign_message, signature).is_err() {
            return Err(PactError::InvalidSignature(*signer));
        }
        valid_signers.insert(*signer);
    }

    if valid_signers.len() < pact.threshold as usize {
        return Err(PactError::InsufficientSignatures {
            got: valid_signers.len(),
            need: pact.threshold,
        });
    }

    Ok(pact.risk_level)
}

/// Build the message pact signers sign: domain tag ‖ pact_id ‖ atom_hash
/// ‖ intent_class ‖ physics_delta, all raw bytes (no hex text).
fn build_pact_sign_message(pact_id: &str, atom_hash: &Hash, intent_class: IntentClass, physics_delta: i128) -> Vec<u8> {
    let mut message = Vec::new();
    message.extend_from_slice(ubl_kernel::domains::PACT);
    message.extend_from_slice(pact_id.as_bytes());
    message.extend_from_slice(atom_hash.as_bytes());
    message.push(intent_class.as_byte());
    message.extend_from_slice(&physics_delta.to_be_bytes());
    message
}

/// Something able to verify a pact proof without the caller needing to
/// know which concrete threshold/quorum scheme backs it.
pub trait PactVerifier: Send + Sync {
    /// Verify `proof` authorizes a link with the given shape. Returns the
    /// satisfied pact's risk level on success.
    fn verify(
        &self,
        proof: &PactProof,
        atom_hash: &Hash,
        intent_class: IntentClass,
        physics_delta: i128,
        current_time_ms: i64,
    ) -> Result<RiskLevel>;
}

/// An in-memory registry of pacts, keyed by `pact_id`. The default
/// [`PactVerifier`] implementation: threshold-signature quorum.
#[derive(Debug, Default)]
pub struct PactRegistry {
    pacts: HashMap<String, Pact>,
}

impl PactRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a pact.
    pub fn register(&mut self, pact: Pact) {
        self.pacts.insert(pact.pact_id.clone(), pact);
    }

    /// Look up a pact by id.
    pub fn get(&self, pact_id: &str) -> Option<&Pact> {
        self.pacts.get(pact_id)
    }
}

impl PactVerifier for PactRegistry {
    fn verify(
        &self,
        proof: &PactProof,
        atom_hash: &Hash,
        intent_class: IntentClass,
        physics_delta: i128,
        current_time_ms: i64,
    ) -> Result<RiskLevel> {
        let pact = self
            .get(&proof.pact_id)
            .ok_or_else(|| PactError::UnknownPact(proof.pact_id.clone()))?;
        validate_pact(pact, proof, atom_hash, intent_class, physics_delta, current_time_ms)
    }
}
