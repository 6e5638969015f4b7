//! The lattice-scheme capability seam.
//!
//! Pipeline code never performs ring arithmetic itself; it drives a
//! [`LatticeBackend`] and treats ciphertexts as opaque leveled values. A
//! different scheme implementation can be swapped in behind this trait
//! without touching any pipeline logic.

use serde::{Deserialize, Serialize};

use crate::error::{HeError, HeResult};
use crate::keys::{EvalKeys, KeySet, PublicKey, SecretKey};
use crate::profile::{Profile, ProfileId};

/// Encoded slot vector ready for encryption or plaintext-side arithmetic.
#[derive(Clone, Debug, PartialEq)]
pub struct Plaintext {
    pub profile: ProfileId,
    pub slots: Vec<f64>,
}

impl Plaintext {
    pub fn new(profile: ProfileId, slots: Vec<f64>) -> Self {
        Self { profile, slots }
    }

    /// A plaintext with `value` broadcast into every slot.
    pub fn broadcast(profile: &Profile, value: f64) -> Self {
        Self {
            profile: profile.id,
            slots: vec![value; profile.slots],
        }
    }
}

/// An opaque leveled ciphertext.
///
/// The payload layout is backend-specific; everything else is public header
/// state that inspection tooling may read without any key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ciphertext {
    pub profile: ProfileId,
    /// Identifies the key pair this ciphertext was produced under.
    pub key_id: String,
    /// Remaining multiplicative levels.
    pub level: usize,
    pub scale: f64,
    pub payload: Vec<f64>,
}

impl Ciphertext {
    pub fn slot_count(&self) -> usize {
        self.payload.len()
    }
}

/// Scheme operations the pipeline depends on.
///
/// Level discipline: `mul*` consume one level and fail with
/// `DepthBudgetExceeded` on exhausted operands; additive ops and rotations
/// are free; `bootstrap` restores a ciphertext to the top level on profiles
/// that enable it.
pub trait LatticeBackend: Send + Sync {
    fn profile(&self) -> &'static Profile;

    /// Generate a fresh key set from a cryptographically secure source.
    fn keygen(&self) -> HeResult<KeySet>;

    fn encrypt(&self, pk: &PublicKey, pt: &Plaintext) -> HeResult<Ciphertext>;
    fn decrypt(&self, sk: &SecretKey, ct: &Ciphertext) -> HeResult<Plaintext>;

    fn add(&self, a: &Ciphertext, b: &Ciphertext) -> HeResult<Ciphertext>;
    fn sub(&self, a: &Ciphertext, b: &Ciphertext) -> HeResult<Ciphertext>;
    fn add_plain(&self, a: &Ciphertext, pt: &Plaintext) -> HeResult<Ciphertext>;
    fn add_scalar(&self, a: &Ciphertext, value: f64) -> HeResult<Ciphertext>;
    fn negate(&self, a: &Ciphertext) -> HeResult<Ciphertext>;

    fn mul(&self, a: &Ciphertext, b: &Ciphertext, ek: &EvalKeys) -> HeResult<Ciphertext>;
    fn mul_plain(&self, a: &Ciphertext, pt: &Plaintext) -> HeResult<Ciphertext>;
    fn mul_scalar(&self, a: &Ciphertext, value: f64) -> HeResult<Ciphertext>;

    /// Rotate slots left by `step` positions.
    fn rotate(&self, a: &Ciphertext, step: usize, ek: &EvalKeys) -> HeResult<Ciphertext>;

    /// Refresh an exhausted ciphertext back to the top level.
    fn bootstrap(&self, a: &Ciphertext) -> HeResult<Ciphertext>;
}

/// Shared operand validation for binary ciphertext operations.
pub(crate) fn check_pair(profile: &Profile, a: &Ciphertext, b: &Ciphertext) -> HeResult<()> {
    check_operand(profile, a)?;
    check_operand(profile, b)?;
    if a.slot_count() != b.slot_count() {
        return Err(HeError::SlotLayoutMismatch {
            reason: format!(
                "operand slot counts differ: {} vs {}",
                a.slot_count(),
                b.slot_count()
            ),
        });
    }
    if a.key_id != b.key_id {
        return Err(HeError::SlotLayoutMismatch {
            reason: format!(
                "operands encrypted under different keys: {} vs {}",
                a.key_id, b.key_id
            ),
        });
    }
    Ok(())
}

pub(crate) fn check_operand(profile: &Profile, ct: &Ciphertext) -> HeResult<()> {
    if ct.profile != profile.id {
        return Err(HeError::profile_mismatch(
            profile.id,
            ct.profile,
            "ciphertext operand",
        ));
    }
    if ct.slot_count() != profile.slots {
        return Err(HeError::SlotLayoutMismatch {
            reason: format!(
                "ciphertext carries {} slots, profile {} packs {}",
                ct.slot_count(),
                profile.id,
                profile.slots
            ),
        });
    }
    Ok(())
}
