//! # UBL Kernel
//!
//! Pure cryptography. Mathematically closed. Semantically blind.
//! Implements SPEC-UBL-KERNEL.
//!
//! ## Features
//! - BLAKE3 hashing (`atom_hash`, `link_hash`, and `entry_hash` are all bare,
//!   untagged digests per their §3/§8 literal formulas; only pact signing
//!   messages carry a domain tag)
//! - Ed25519 signing and verification
//! - Fixed-size hash/key/signature newtypes with the §6 wire hex encoding
//!   baked in, so every other crate shares one validated representation
//!   instead of re-parsing hex strings at each boundary.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::fmt;
use std::str::FromStr;

use blake3::Hasher;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Domain prefixes for hash separation.
///
/// Only pact signing messages carry one. `atom_hash`, `link_hash`, and
/// `entry_hash` deliberately do NOT: §3 and the §8 end-to-end scenarios fix
/// their formulas literally (`atom_hash = BLAKE3(canonical_bytes)`,
/// `entry_hash = BLAKE3(previous_hash ‖ link_hash)`) with no prefix, so two
/// independent implementations of this ledger must land on the same bytes.
pub mod domains {
    /// Domain for pact signing messages (not normatively fixed by §3/§8).
    pub const PACT: &[u8] = b"ubl:pact\n";
}

/// Errors from kernel operations.
#[derive(Error, Debug)]
pub enum KernelError {
    /// Hex string was not valid hex.
    #[error("invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// Decoded bytes were not the expected fixed length.
    #[error("expected {expected} bytes, got {actual}")]
    WrongLength {
        /// Expected byte length.
        expected: usize,
        /// Actual byte length.
        actual: usize,
    },

    /// Ed25519 signature verification failed.
    #[error("signature verification failed")]
    SignatureVerification,

    /// Key bytes were not a valid Ed25519 key.
    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

/// Result type for kernel operations.
pub type Result<T> = std::result::Result<T, KernelError>;

macro_rules! fixed_bytes_newtype {
    ($name:ident, $len:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// All-zero value.
            pub const ZERO: $name = $name([0u8; $len]);

            /// Borrow the raw bytes.
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Consume into the raw bytes.
            pub fn into_bytes(self) -> [u8; $len] {
                self.0
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                $name(bytes)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = KernelError;

            fn from_str(s: &str) -> Result<Self> {
                let bytes = hex::decode(s)?;
                if bytes.len() != $len {
                    return Err(KernelError::WrongLength {
                        expected: $len,
                        actual: bytes.len(),
                    });
                }
                let mut out = [0u8; $len];
                out.copy_from_slice(&bytes);
                Ok($name(out))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                $name::from_str(&s).map_err(D::Error::custom)
            }
        }
    };
}

fixed_bytes_newtype!(Hash, 32, "A 32-byte BLAKE3 digest, lowercase-hex on the wire (§6).");
fixed_bytes_newtype!(PublicKey, 32, "A raw 32-byte Ed25519 public key.");
fixed_bytes_newtype!(Signature, 64, "A raw 64-byte Ed25519 signature.");

/// The genesis hash: 32 zero bytes, meaning "no prior entry" (§3).
pub const GENESIS_HASH: Hash = Hash::ZERO;

/// Hash an atom's canonical bytes. NO domain tag — per SPEC_FULL.md §1,
/// `atom_hash` must stay bit-identical to a bare BLAKE3 digest so atoms
/// remain hash-equivalent across independent implementations of the same
/// canonical JSON form.
pub fn hash_atom(canonical_bytes: &[u8]) -> Hash {
    Hash(*blake3::hash(canonical_bytes).as_bytes())
}

/// Hash a link's full canonical envelope bytes into its `link_hash`. No
/// domain tag: `link_hash` is "Hash of the full canonical envelope" (§3),
/// a bare BLAKE3 digest.
pub fn hash_link(envelope_bytes: &[u8]) -> Hash {
    Hash(*blake3::hash(envelope_bytes).as_bytes())
}

/// Derive `entry_hash = BLAKE3(previous_hash ‖ link_hash)` (§3, §8 scenario 1).
/// No domain tag — the literal formula is normative and must be bit-exact
/// across independent implementations.
pub fn hash_entry(previous_hash: &Hash, link_hash: &Hash) -> Hash {
    let mut hasher = Hasher::new();
    hasher.update(previous_hash.as_bytes());
    hasher.update(link_hash.as_bytes());
    Hash(*hasher.finalize().as_bytes())
}

/// Sign a message with an Ed25519 signing key.
pub fn sign(signing_key: &SigningKey, message: &[u8]) -> Signature {
    Signature(signing_key.sign(message).to_bytes())
}

/// Verify an Ed25519 signature. Constant-time: delegates entirely to
/// `ed25519_dalek::VerifyingKey::verify`, which never branches on secret
/// data.
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &Signature) -> Result<()> {
    let verifying_key = VerifyingKey::from_bytes(&public_key.0)
        .map_err(|e| KernelError::InvalidKey(e.to_string()))?;
    let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
    verifying_key
        .verify(message, &sig)
        .map_err(|_| KernelError::SignatureVerification)
}

/// Generate a new signing keypair (for tests and key provisioning tools,
/// never used inside the membrane itself).
pub fn generate_keypair() -> (PublicKey, SigningKey) {
    let signing_key = SigningKey::generate(&mut rand::thread_rng());
    let public_key = PublicKey(signing_key.verifying_key().to_bytes());
    (public_key, signing_key)
}

/// Get the public key for a signing key.
pub fn public_key_of(signing_key: &SigningKey) -> PublicKey {
    PublicKey(signing_key.verifying_key().to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_atom_deterministic() {
        let data = b"test data";
        assert_eq!(hash_atom(data), hash_atom(data));
    }

    #[test]
    fn atom_hash_has_no_domain_tag() {
        let data = b"test";
        let raw = Hash(*blake3::hash(data).as_bytes());
        assert_eq!(hash_atom(data), raw, "atom_hash must match raw BLAKE3, no domain tag");
    }

    #[test]
    fn link_hash_matches_bare_blake3() {
        // link_hash carries no domain tag either (§3): same formula as
        // hash_atom, applied to different inputs in practice (canonical
        // envelope bytes vs. canonical atom bytes).
        let data = b"some bytes";
        assert_eq!(hash_link(data), hash_atom(data));
    }

    #[test]
    fn entry_hash_is_order_sensitive() {
        let a = Hash([1u8; 32]);
        let b = Hash([2u8; 32]);
        assert_ne!(hash_entry(&a, &b), hash_entry(&b, &a));
    }

    #[test]
    fn hex_round_trip() {
        let h = Hash([0xabu8; 32]);
        let s = h.to_string();
        assert_eq!(s.len(), 64);
        assert_eq!(s.parse::<Hash>().unwrap(), h);
    }

    #[test]
    fn genesis_hash_is_64_hex_zero_chars() {
        assert_eq!(GENESIS_HASH.to_string(), "0".repeat(64));
    }

    #[test]
    fn rejects_wrong_length_hex() {
        let err = "ab".parse::<Hash>().unwrap_err();
        assert!(matches!(err, KernelError::WrongLength { .. }));
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let (pubkey, signing_key) = generate_keypair();
        let message = b"hello world";
        let signature = sign(&signing_key, message);
        assert!(verify(&pubkey, message, &signature).is_ok());
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let (pubkey, signing_key) = generate_keypair();
        let signature = sign(&signing_key, b"hello world");
        assert!(verify(&pubkey, b"goodbye world", &signature).is_err());
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let (_, signing_key) = generate_keypair();
        let (other_pubkey, _) = generate_keypair();
        let signature = sign(&signing_key, b"hello world");
        assert!(verify(&other_pubkey, b"hello world", &signature).is_err());
    }

    #[test]
    fn verify_flips_on_any_signature_bit() {
        let (pubkey, signing_key) = generate_keypair();
        let message = b"flip every bit";
        let signature = sign(&signing_key, message);
        for byte_idx in 0..signature.0.len() {
            let mut tampered = signature;
            tampered.0[byte_idx] ^= 0x01;
            assert!(verify(&pubkey, message, &tampered).is_err());
        }
    }
}
