//! Parameter profiles for the lattice scheme.
//!
//! Profiles are compile-time constants looked up by id so that callers can
//! never pair mismatched parameters by accident:
//! - Profile A: no bootstrapping, short modulus chain, plain aggregations only.
//! - Profile B: bootstrapping enabled, full comparator/division support.
//! - Profile T: tiny bootstrapped profile (8 slots) for demos and tests.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{HeError, HeResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProfileId {
    A,
    B,
    T,
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileId::A => write!(f, "A"),
            ProfileId::B => write!(f, "B"),
            ProfileId::T => write!(f, "T"),
        }
    }
}

impl FromStr for ProfileId {
    type Err = HeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" => Ok(ProfileId::A),
            "B" => Ok(ProfileId::B),
            "T" => Ok(ProfileId::T),
            other => Err(HeError::UnknownProfile(other.to_string())),
        }
    }
}

/// A full parameter set: ring degree, modulus chain and derived bounds.
#[derive(Clone, Debug, PartialEq)]
pub struct Profile {
    pub id: ProfileId,
    /// log2 of the ring degree N.
    pub log_n: u32,
    /// Packed slots per ciphertext (N/2).
    pub slots: usize,
    /// log2 of the encoding scale.
    pub log_scale: u32,
    /// Bit sizes of the ciphertext modulus chain. Length - 1 bounds the
    /// multiplicative depth.
    pub log_q: &'static [u32],
    /// Bit sizes of the key-switching special moduli.
    pub log_p: &'static [u32],
    pub security_bits: u32,
    /// Whether the scheme may refresh exhausted ciphertexts.
    pub bootstrap: bool,
}

const PROFILE_A: Profile = Profile {
    id: ProfileId::A,
    log_n: 14,
    slots: 1 << 13,
    log_scale: 40,
    log_q: &[60, 40, 40, 40, 40, 40, 40, 40, 40],
    log_p: &[60, 60],
    security_bits: 128,
    bootstrap: false,
};

const PROFILE_B: Profile = Profile {
    id: ProfileId::B,
    log_n: 16,
    slots: 1 << 15,
    log_scale: 45,
    log_q: &[
        60, 45, 45, 45, 45, 45, 45, 45, 45, 45, 45, 45, 45, 45, 45, 45, 45, 45, 45, 45, 45,
    ],
    log_p: &[61, 61, 61, 61],
    security_bits: 128,
    bootstrap: true,
};

const PROFILE_T: Profile = Profile {
    id: ProfileId::T,
    log_n: 4,
    slots: 8,
    log_scale: 20,
    log_q: &[50, 30, 30, 30, 30, 30, 30, 30, 30],
    log_p: &[50],
    security_bits: 0,
    bootstrap: true,
};

impl Profile {
    /// Look up a registered profile by id.
    pub fn resolve(id: ProfileId) -> &'static Profile {
        match id {
            ProfileId::A => &PROFILE_A,
            ProfileId::B => &PROFILE_B,
            ProfileId::T => &PROFILE_T,
        }
    }

    /// Look up a profile from its string form, failing with `UnknownProfile`.
    pub fn resolve_str(id: &str) -> HeResult<&'static Profile> {
        Ok(Profile::resolve(id.parse()?))
    }

    pub fn ring_degree(&self) -> usize {
        1 << self.log_n
    }

    /// Maximum ciphertext level: number of chain moduli past Q0.
    pub fn max_level(&self) -> usize {
        self.log_q.len() - 1
    }

    pub fn scale(&self) -> f64 {
        (self.log_scale as f64).exp2()
    }

    /// Largest per-cell magnitude encodable without wrapping the first
    /// chain modulus.
    pub fn plain_bound(&self) -> f64 {
        ((self.log_q[0] - self.log_scale) as f64).exp2()
    }

    /// Magnitude above which a decrypted slot cannot be a legitimate result
    /// and must be treated as approximation garbage.
    // TODO: derive this from per-operation noise growth instead of a fixed
    // headroom over the aggregate bound.
    pub fn noise_bound(&self) -> f64 {
        self.plain_bound() * self.slots as f64 * 1024.0
    }

    /// Rotation steps needed for slot reductions: powers of two below `slots`.
    pub fn rotation_steps(&self) -> Vec<usize> {
        let mut steps = Vec::new();
        let mut s = 1;
        while s < self.slots {
            steps.push(s);
            s *= 2;
        }
        steps
    }

    /// Deterministic digest of the defining parameters, pinned for
    /// reproducibility across releases.
    pub fn params_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.id.to_string().as_bytes());
        hasher.update(&self.log_n.to_le_bytes());
        hasher.update(&self.log_scale.to_le_bytes());
        for q in self.log_q {
            hasher.update(&q.to_le_bytes());
        }
        for p in self.log_p {
            hasher.update(&p.to_le_bytes());
        }
        hasher.update(&[self.bootstrap as u8]);
        hex::encode(&hasher.finalize().as_bytes()[..16])
    }

    /// Consistency checks on the parameter set itself.
    pub fn validate(&self) -> HeResult<()> {
        let n = self.ring_degree();
        if !n.is_power_of_two() {
            return Err(HeError::corrupt_artifact(format!(
                "ring degree {n} is not a power of two"
            )));
        }
        if self.slots != n / 2 {
            return Err(HeError::corrupt_artifact(format!(
                "slot count {} does not match ring degree {n}",
                self.slots
            )));
        }
        if self.log_q.len() < 2 {
            return Err(HeError::corrupt_artifact("modulus chain too short".to_string()));
        }
        Ok(())
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "profile {}: logN={}, slots={}, logScale={}, maxLevel={}, bootstrap={}, hash={}",
            self.id,
            self.log_n,
            self.slots,
            self.log_scale,
            self.max_level(),
            self.bootstrap,
            self.params_hash()
        )
    }
}
