//! # UBL Membrane
//!
//! The semantically blind admission validator (§4.D). A membrane decides
//! Accept/Reject for a single [`LinkCommit`] using only cryptography,
//! causal order, and the physics invariants of §3 — it never interprets
//! the atom the link references.
//!
//! The eight checks below run in fixed order; the first failure is the
//! returned [`MembraneError`]. [`validate`] has no side effects: it reads
//! only what is passed in and writes nothing.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use thiserror::Error;
use ubl_kernel::Hash;
use ubl_link::{ContainerState, IntentClass, LinkCommit};
use ubl_pact::{PactVerifier, RiskLevel};

/// The eight admission rejections (§4.D, §7), in the order they are
/// checked.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MembraneError {
    /// `version` is not the one protocol version this membrane supports.
    #[error("unsupported version: {0}")]
    VersionUnsupported(u8),

    /// `signature` does not verify under `author_public_key` over
    /// `signing_bytes()`.
    #[error("signature does not verify")]
    SignatureInvalid,

    /// `container_id` does not match the container this membrane was
    /// asked to validate against.
    #[error("container_id does not match the target container")]
    ContainerMismatch,

    /// `previous_hash` does not match the container's current
    /// `last_entry_hash`. The caller's view is stale; it must re-read
    /// state and rebuild the link. The membrane does not retry or
    /// reorder.
    #[error("reality drift: previous_hash does not match current state")]
    RealityDrift,

    /// `expected_sequence` is not `state.last_sequence + 1`.
    #[error("sequence mismatch: expected {expected}, got {actual}")]
    SequenceMismatch {
        /// What the container's state requires next.
        expected: u64,
        /// What the link carried.
        actual: u64,
    },

    /// `intent_class`/`physics_delta` disagree about the physics shape
    /// the class requires (§3), or (when the caller supplies a balance)
    /// the post-state of a Conservation link would be negative.
    #[error("physics violation: {reason}")]
    PhysicsViolation {
        /// Human-readable detail; not machine-interpreted.
        reason: String,
    },

    /// Entropy/Evolution without a pact proof, or a proof that fails
    /// pact verification (unknown pact, expired window, wrong intent
    /// class, insufficient signatures, ...).
    #[error("pact violation: {reason}")]
    PactViolation {
        /// Human-readable detail from the pact verifier, or a fixed
        /// message when no proof was presented at all.
        reason: String,
    },

    /// An Evolution link's pact proof does not carry the risk tier the
    /// container requires for rule changes.
    #[error("unauthorized evolution: pact risk level {got:?} below required {required:?}")]
    UnauthorizedEvolution {
        /// The risk level the presented pact actually satisfied.
        got: RiskLevel,
        /// The risk level the container's configuration requires.
        required: RiskLevel,
    },
}

/// Result type for membrane validation.
pub type Result<T> = std::result::Result<T, MembraneError>;

/// Per-container configuration the membrane needs beyond the link and
/// its current state: the risk tier Evolution links must clear (§4.D
/// check 8). Not part of the core's own persistence — callers supply it
/// from wherever container configuration lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerConfig {
    /// Minimum risk level an Evolution link's pact proof must carry.
    pub required_evolution_risk_level: RiskLevel,
}

impl Default for ContainerConfig {
    /// The highest defined risk tier — sovereignty-level authorization
    /// is the conservative default for mutating a container's own rules.
    fn default() -> Self {
        ContainerConfig {
            required_evolution_risk_level: RiskLevel::L5,
        }
    }
}

/// What [`validate`] returns on success: enough of a template to
/// materialize a ledger entry without recomputing the link hash twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptedLink {
    /// `link_hash` of the accepted envelope.
    pub link_hash: Hash,
}

/// The membrane's decision for a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// All eight checks passed.
    Accept(AcceptedLink),
    /// The first check that failed, and why.
    Reject(MembraneError),
}

impl Decision {
    /// Whether this decision is [`Decision::Accept`].
    pub fn is_accept(&self) -> bool {
        matches!(self, Decision::Accept(_))
    }
}

/// Run the eight ordered admission checks against a link (§4.D).
///
/// `pact_verifier` is consulted only for Entropy/Evolution links; it may
/// be `None` for containers that never authorize those classes, in which
/// case any Entropy/Evolution link is rejected for lacking a proof.
pub fn validate(
    link: &LinkCommit,
    container_id: Hash,
    state: &ContainerState,
    config: &ContainerConfig,
    pact_verifier: Option<&dyn PactVerifier>,
    current_time_ms: i64,
) -> Result<AcceptedLink> {
    // 1. VersionUnsupported
    if link.version != 1 {
        return Err(MembraneError::VersionUnsupported(link.version));
    }

    // 2. SignatureInvalid
    let signing_bytes = link.signing_bytes();
    ubl_kernel::verify(&link.author_public_key, &signing_bytes, &link.signature)
        .map_err(|_| MembraneError::SignatureInvalid)?;

    // 3. ContainerMismatch
    if link.container_id != container_id {
        return Err(MembraneError::ContainerMismatch);
    }

    // 4. RealityDrift
    if link.previous_hash != state.last_entry_hash {
        return Err(MembraneError::RealityDrift);
    }

    // 5. SequenceMismatch
    let expected = state.next_sequence();
    if link.expected_sequence != expected {
        return Err(MembraneError::SequenceMismatch {
            expected,
            actual: link.expected_sequence,
        });
    }

    // 6. PhysicsViolation — class/delta shape. Whole-transaction
    // Conservation pairing (Σ=0 across paired links) is a policy-layer
    // concern outside the membrane; only the per-link shape is checked
    // here (§9 Open Question).
    link.check_physics_shape()
        .map_err(|_| MembraneError::PhysicsViolation {
            reason: format!(
                "physics_delta {} is not valid for {:?}",
                link.physics_delta, link.intent_class
            ),
        })?;

    // 7. PactViolation
    let pact_risk_level = if link.intent_class.requires_pact_proof() {
        let proof = link.pact.as_ref().ok_or_else(|| MembraneError::PactViolation {
            reason: format!("{:?} requires a pact proof", link.intent_class),
        })?;
        let verifier = pact_verifier.ok_or_else(|| MembraneError::PactViolation {
            reason: "container has no configured pact verifier".to_string(),
        })?;
        let risk_level = verifier
            .verify(
                proof,
                &link.atom_hash,
                link.intent_class,
                link.physics_delta,
                current_time_ms,
            )
            .map_err(|e| MembraneError::PactViolation {
                reason: e.to_string(),
            })?;
        Some(risk_level)
    } else {
        None
    };

    // 8. UnauthorizedEvolution
    if link.intent_class == IntentClass::Evolution {
        let got = pact_risk_level.expect("Evolution requires_pact_proof, so check 7 set this");
        if got < config.required_evolution_risk_level {
            return Err(MembraneError::UnauthorizedEvolution {
                got,
                required: config.required_evolution_risk_level,
            });
        }
    }

    let link_hash = link.link_hash().map_err(|_| MembraneError::PhysicsViolation {
        reason: "link envelope could not be canonicalized".to_string(),
    })?;
    Ok(AcceptedLink { link_hash })
}

/// Run [`validate`] and wrap the outcome as a [`Decision`] rather than a
/// `Result`, for callers (like `POST /validate`) that want to treat
/// Accept/Reject uniformly instead of branching on `Err`.
pub fn decide(
    link: &LinkCommit,
    container_id: Hash,
    state: &ContainerState,
    config: &ContainerConfig,
    pact_verifier: Option<&dyn PactVerifier>,
    current_time_ms: i64,
) -> Decision {
    match validate(link, container_id, state, config, pact_verifier, current_time_ms) {
        Ok(accepted) => Decision::Accept(accepted),
        Err(e) => Decision::Reject(e),
    }
}
