//! # UBL Link
//!
//! The only interface of tangency between the writer side and the ledger.
//! This is the sole valid protocol for materialization into a container.
//!
//! ## The Link Commit
//! The envelope that crosses the boundary into the ledger. It contains:
//! - Container identity
//! - Causal control (sequence, previous hash)
//! - Atom hash (the semantic content, hashed)
//! - Physical class (Observation, Conservation, Entropy, Evolution)
//! - Physics delta (the physical change)
//! - Authority (signature)

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use thiserror::Error;
use ubl_kernel::{Hash, PublicKey, Signature};

/// The physical classification of an intent (§3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum IntentClass {
    /// Δ = 0 — pure observation, no physical change.
    Observation = 0x00,
    /// ΣΔ = 0 across a set — conservation law, paired changes required.
    Conservation = 0x01,
    /// Authorized creation/destruction of value; requires a pact proof.
    Entropy = 0x02,
    /// Δ = 0 but mutates invariants (the rules themselves); requires a
    /// pact proof.
    Evolution = 0x03,
}

impl IntentClass {
    /// Byte representation used in signing bytes and on the wire.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether this class's physics shape requires `physics_delta == 0`.
    pub fn requires_zero_delta(self) -> bool {
        matches!(self, IntentClass::Observation | IntentClass::Evolution)
    }

    /// Whether this class requires an attached [`PactProof`].
    pub fn requires_pact_proof(self) -> bool {
        matches!(self, IntentClass::Entropy | IntentClass::Evolution)
    }
}

/// A pact proof carried inline in a link envelope. The membrane treats
/// this as opaque material to verify, not to interpret; threshold/quorum
/// semantics live in `ubl-pact`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PactProof {
    /// Identifier of the pact this proof satisfies.
    pub pact_id: String,
    /// Public keys of the signers who contributed a signature.
    pub signer_public_keys: Vec<PublicKey>,
    /// Signatures over the pact's signing message, one per signer key.
    pub signatures: Vec<Signature>,
}

/// Errors constructing or hashing a link envelope.
#[derive(Error, Debug)]
pub enum LinkError {
    /// The envelope could not be canonicalized into bytes.
    #[error("link envelope cannot be canonicalized: {0}")]
    EncodingError(#[from] ubl_atom::AtomError),

    /// `intent_class` and `physics_delta` disagree about the expected
    /// physics shape (e.g. Observation with a nonzero delta).
    #[error("physics_delta {delta} is not valid for {class:?}")]
    PhysicsShapeError {
        /// The offending intent class.
        class: IntentClass,
        /// The offending delta.
        delta: i128,
    },
}

/// Result type for link operations.
pub type Result<T> = std::result::Result<T, LinkError>;

/// The canonical fields of a commit envelope, in fixed order (§3).
/// `pact`, `author_public_key`, and `signature` are NOT part of the
/// signed region.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkCommit {
    /// Protocol version; currently always 1.
    pub version: u8,

    /// The container this commit targets.
    pub container_id: Hash,

    /// Expected sequence number (causal control): the sequence this
    /// commit will receive if and only if it is the next one accepted.
    pub expected_sequence: u64,

    /// Hash of the last entry accepted into the container, or the
    /// all-zero genesis hash if this is the first commit.
    pub previous_hash: Hash,

    /// Hash of the semantic content (the atom) this commit references.
    pub atom_hash: Hash,

    /// Physical class of the intent.
    pub intent_class: IntentClass,

    /// Physical delta. Transported as a decimal string so JSON numeric
    /// clients never lose precision above 2^53.
    #[serde_as(as = "DisplayFromStr")]
    pub physics_delta: i128,

    /// Pact proof, required when `intent_class` demands one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pact: Option<PactProof>,

    /// Author's Ed25519 public key.
    pub author_public_key: PublicKey,

    /// Signature over `signing_bytes()`.
    pub signature: Signature,
}

impl LinkCommit {
    /// The bytes Ed25519 actually signs (§3): the concatenation, in
    /// fixed order, of raw (not hex-text) field bytes. `pact`,
    /// `author_public_key`, and `signature` are excluded.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + 32 + 8 + 32 + 32 + 1 + 16);
        bytes.push(self.version);
        bytes.extend_from_slice(self.container_id.as_bytes());
        bytes.extend_from_slice(&self.expected_sequence.to_be_bytes());
        bytes.extend_from_slice(self.previous_hash.as_bytes());
        bytes.extend_from_slice(self.atom_hash.as_bytes());
        bytes.push(self.intent_class.as_byte());
        bytes.extend_from_slice(&self.physics_delta.to_be_bytes());
        bytes
    }

    /// Canonical JSON bytes of the full envelope, including `pact`,
    /// `author_public_key`, and `signature` — this is what `link_hash`
    /// is computed over.
    pub fn canonical_envelope(&self) -> Result<Vec<u8>> {
        let value = serde_json::to_value(self).map_err(ubl_atom::AtomError::from)?;
        Ok(ubl_atom::canonicalize_value(&value)?)
    }

    /// `link_hash = BLAKE3(canonical envelope bytes)` (no domain tag, §3).
    pub fn link_hash(&self) -> Result<Hash> {
        Ok(ubl_kernel::hash_link(&self.canonical_envelope()?))
    }

    /// Check that `physics_delta` agrees with what `intent_class`
    /// requires. Does not check pact presence — the membrane's
    /// `PactViolation` check owns that, since it also needs to verify
    /// the proof's signatures.
    pub fn check_physics_shape(&self) -> Result<()> {
        if self.intent_class.requires_zero_delta() && self.physics_delta != 0 {
            return Err(LinkError::PhysicsShapeError {
                class: self.intent_class,
                delta: self.physics_delta,
            });
        }
        if !self.intent_class.requires_zero_delta() && self.physics_delta == 0 {
            return Err(LinkError::PhysicsShapeError {
                class: self.intent_class,
                delta: self.physics_delta,
            });
        }
        Ok(())
    }
}

/// A container's derived state: the only two facts a caller needs to build
/// the next link (§3). Genesis state (`last_sequence = 0`,
/// `last_entry_hash = GENESIS_HASH`) names "no prior entry."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerState {
    /// Sequence of the last accepted entry, or 0 before genesis.
    pub last_sequence: u64,
    /// `entry_hash` of the last accepted entry, or the all-zero genesis
    /// hash before genesis.
    pub last_entry_hash: Hash,
}

impl ContainerState {
    /// The state of a container that has never accepted an entry.
    pub const fn genesis() -> Self {
        ContainerState {
            last_sequence: 0,
            last_entry_hash: ubl_kernel::GENESIS_HASH,
        }
    }

    /// The `expected_sequence` a link must carry to be accepted next.
    pub fn next_sequence(&self) -> u64 {
        self.last_sequence + 1
    }
}

impl Default for ContainerState {
    fn default() -> Self {
        Self::genesis()
    }
}

/// Builds and signs a [`LinkCommit`] (§4.C). Does not read ledger state:
/// callers are expected to have fetched `{last_sequence, last_entry_hash}`
/// first and pass them in as `expected_sequence`/`previous_hash`.
pub struct LinkBuilder {
    version: u8,
    container_id: Hash,
    expected_sequence: u64,
    previous_hash: Hash,
    atom_hash: Hash,
    intent_class: IntentClass,
    physics_delta: i128,
    pact: Option<PactProof>,
}

impl LinkBuilder {
    /// Start building a link for the next sequence in a container.
    pub fn new(
        container_id: Hash,
        expected_sequence: u64,
        previous_hash: Hash,
        atom_hash: Hash,
        intent_class: IntentClass,
        physics_delta: i128,
    ) -> Self {
        LinkBuilder {
            version: 1,
            container_id,
            expected_sequence,
            previous_hash,
            atom_hash,
            intent_class,
            physics_delta,
            pact: None,
        }
    }

    /// Attach a pact proof (required for Entropy/Evolution intents).
    pub fn with_pact(mut self, pact: PactProof) -> Self {
        self.pact = Some(pact);
        self
    }

    /// Sign and produce the final envelope.
    pub fn build(self, signing_key: &ed25519_dalek::SigningKey) -> Result<LinkCommit> {
        let author_public_key = ubl_kernel::public_key_of(signing_key);
        let mut commit = LinkCommit {
            version: self.version,
            container_id: self.container_id,
            expected_sequence: self.expected_sequence,
            previous_hash: self.previous_hash,
            atom_hash: self.atom_hash,
            intent_class: self.intent_class,
            physics_delta: self.physics_delta,
            pact: self.pact,
            author_public_key,
            signature: Signature([0u8; 64]),
        };
        commit.check_physics_shape()?;
        let signing_bytes = commit.signing_bytes();
        commit.signature = ubl_kernel::sign(signing_key, &signing_bytes);
        Ok(commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(byte: u8) -> Hash {
        Hash([byte; 32])
    }

    #[test]
    fn intent_class_byte_values() {
        assert_eq!(IntentClass::Observation.as_byte(), 0x00);
        assert_eq!(IntentClass::Conservation.as_byte(), 0x01);
        assert_eq!(IntentClass::Entropy.as_byte(), 0x02);
        assert_eq!(IntentClass::Evolution.as_byte(), 0x03);
    }

    #[test]
    fn observation_and_evolution_require_zero_delta() {
        assert!(IntentClass::Observation.requires_zero_delta());
        assert!(IntentClass::Evolution.requires_zero_delta());
        assert!(!IntentClass::Conservation.requires_zero_delta());
        assert!(!IntentClass::Entropy.requires_zero_delta());
    }

    #[test]
    fn entropy_and_evolution_require_pact_proof() {
        assert!(IntentClass::Entropy.requires_pact_proof());
        assert!(IntentClass::Evolution.requires_pact_proof());
        assert!(!IntentClass::Observation.requires_pact_proof());
        assert!(!IntentClass::Conservation.requires_pact_proof());
    }

    fn make_commit(intent_class: IntentClass, physics_delta: i128) -> LinkCommit {
        let (pubkey, signing_key) = ubl_kernel::generate_keypair();
        let mut commit = LinkCommit {
            version: 1,
            container_id: h(1),
            expected_sequence: 1,
            previous_hash: ubl_kernel::GENESIS_HASH,
            atom_hash: h(2),
            intent_class,
            physics_delta,
            pact: None,
            author_public_key: pubkey,
            signature: Signature([0u8; 64]),
        };
        let signing_bytes = commit.signing_bytes();
        commit.signature = ubl_kernel::sign(&signing_key, &signing_bytes);
        commit
    }

    #[test]
    fn signing_bytes_are_deterministic() {
        let commit = make_commit(IntentClass::Conservation, -100);
        assert_eq!(commit.signing_bytes(), commit.signing_bytes());
    }

    #[test]
    fn signing_bytes_exclude_signature_and_pubkey() {
        let commit = make_commit(IntentClass::Conservation, -100);
        let bytes = commit.signing_bytes();
        assert!(!bytes.windows(64).any(|w| w == commit.signature.as_bytes()));
        assert!(!bytes
            .windows(32)
            .any(|w| w == commit.author_public_key.as_bytes()));
    }

    #[test]
    fn signing_bytes_use_raw_hash_bytes_not_hex_text() {
        let commit = make_commit(IntentClass::Observation, 0);
        let bytes = commit.signing_bytes();
        // 1 (version) + 32 (container_id) + 8 (sequence) + 32 (previous_hash)
        // + 32 (atom_hash) + 1 (intent_class) + 16 (physics_delta) = 122.
        // Hex-text encoding of the three hashes would instead cost 64 ASCII
        // bytes apiece, making this length impossible to hit by accident.
        assert_eq!(bytes.len(), 122);
    }

    #[test]
    fn signature_round_trip_verifies() {
        let commit = make_commit(IntentClass::Entropy, 50);
        assert!(ubl_kernel::verify(
            &commit.author_public_key,
            &commit.signing_bytes(),
            &commit.signature
        )
        .is_ok());
    }

    #[test]
    fn json_round_trip_preserves_fields() {
        let commit = make_commit(IntentClass::Conservation, -50);
        let json = serde_json::to_string(&commit).unwrap();
        let parsed: LinkCommit = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.container_id, commit.container_id);
        assert_eq!(parsed.physics_delta, commit.physics_delta);
        assert_eq!(parsed.signature, commit.signature);
    }

    #[test]
    fn physics_delta_is_a_json_string_not_number() {
        let commit = make_commit(IntentClass::Entropy, 100_000_000_000_000_000_i128);
        let json = serde_json::to_string(&commit).unwrap();
        assert!(json.contains("\"physics_delta\":\"100000000000000000\""));
        let parsed: LinkCommit = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.physics_delta, 100_000_000_000_000_000_i128);
    }

    #[test]
    fn check_physics_shape_rejects_nonzero_observation_delta() {
        let commit = make_commit(IntentClass::Observation, 1);
        assert!(matches!(
            commit.check_physics_shape(),
            Err(LinkError::PhysicsShapeError { .. })
        ));
    }

    #[test]
    fn check_physics_shape_accepts_valid_shapes() {
        assert!(make_commit(IntentClass::Observation, 0).check_physics_shape().is_ok());
        assert!(make_commit(IntentClass::Evolution, 0).check_physics_shape().is_ok());
        assert!(make_commit(IntentClass::Conservation, -7).check_physics_shape().is_ok());
    }

    #[test]
    fn check_physics_shape_rejects_zero_delta_conservation_and_entropy() {
        assert!(matches!(
            make_commit(IntentClass::Conservation, 0).check_physics_shape(),
            Err(LinkError::PhysicsShapeError { .. })
        ));
        assert!(matches!(
            make_commit(IntentClass::Entropy, 0).check_physics_shape(),
            Err(LinkError::PhysicsShapeError { .. })
        ));
    }

    #[test]
    fn link_hash_is_deterministic_and_differs_from_atom_hash() {
        let commit = make_commit(IntentClass::Observation, 0);
        let link_hash = commit.link_hash().unwrap();
        assert_eq!(link_hash, commit.link_hash().unwrap());
        assert_ne!(link_hash, commit.atom_hash);
    }

    #[test]
    fn builder_produces_verifiable_signature() {
        let (_, signing_key) = ubl_kernel::generate_keypair();
        let commit = LinkBuilder::new(
            h(9),
            1,
            ubl_kernel::GENESIS_HASH,
            h(3),
            IntentClass::Observation,
            0,
        )
        .build(&signing_key)
        .unwrap();
        assert!(ubl_kernel::verify(
            &commit.author_public_key,
            &commit.signing_bytes(),
            &commit.signature
        )
        .is_ok());
    }

    #[test]
    fn genesis_container_state_has_zero_sequence_and_hash() {
        let state = ContainerState::genesis();
        assert_eq!(state.last_sequence, 0);
        assert_eq!(state.last_entry_hash, ubl_kernel::GENESIS_HASH);
        assert_eq!(state.next_sequence(), 1);
    }

    #[test]
    fn builder_rejects_bad_physics_shape() {
        let (_, signing_key) = ubl_kernel::generate_keypair();
        let result = LinkBuilder::new(
            h(9),
            1,
            ubl_kernel::GENESIS_HASH,
            h(3),
            IntentClass::Observation,
            5,
        )
        .build(&signing_key);
        assert!(matches!(result, Err(LinkError::PhysicsShapeError { .. })));
    }
}
