//! Mock CKKS-style backend.
//!
//! A non-cryptographic stand-in that lives behind the [`LatticeBackend`]
//! seam: it performs honest slot-wise arithmetic, enforces the level
//! discipline of a leveled scheme, and injects deterministic Gaussian noise
//! on every multiplication so downstream tolerance handling is exercised.
//! Slot values are stored in the clear inside the opaque payload — do not
//! deploy this backend outside tests, demos and development.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::backend::{check_operand, check_pair, Ciphertext, LatticeBackend, Plaintext};
use crate::error::{HeError, HeResult};
use crate::keys::{EvalKeys, KeySet, PublicKey, SecretKey};
use crate::profile::Profile;

pub struct MockCkksBackend {
    profile: &'static Profile,
}

impl MockCkksBackend {
    pub fn new(profile: &'static Profile) -> Self {
        Self { profile }
    }

    fn check_plain(&self, pt: &Plaintext) -> HeResult<()> {
        if pt.profile != self.profile.id {
            return Err(HeError::profile_mismatch(
                self.profile.id,
                pt.profile,
                "plaintext operand",
            ));
        }
        if pt.slots.len() != self.profile.slots {
            return Err(HeError::SlotLayoutMismatch {
                reason: format!(
                    "plaintext carries {} slots, profile {} packs {}",
                    pt.slots.len(),
                    self.profile.id,
                    self.profile.slots
                ),
            });
        }
        Ok(())
    }

    fn check_eval_keys(&self, ek: &EvalKeys, ct: &Ciphertext) -> HeResult<()> {
        if ek.profile != self.profile.id {
            return Err(HeError::profile_mismatch(
                self.profile.id,
                ek.profile,
                "evaluation keys",
            ));
        }
        if ek.key_id != ct.key_id {
            return Err(HeError::SlotLayoutMismatch {
                reason: format!(
                    "evaluation keys {} do not match ciphertext key {}",
                    ek.key_id, ct.key_id
                ),
            });
        }
        Ok(())
    }

    fn consume_level(&self, level: usize) -> HeResult<usize> {
        if level == 0 {
            return Err(HeError::DepthBudgetExceeded {
                needed: 1,
                available: 0,
            });
        }
        Ok(level - 1)
    }

    /// Deterministic per-operation noise, seeded from the operand payload so
    /// repeated evaluations of the same circuit agree bit-for-bit.
    fn noisy(&self, tag: &str, slots: Vec<f64>) -> Vec<f64> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(tag.as_bytes());
        for v in &slots {
            hasher.update(&v.to_le_bytes());
        }
        let mut rng = ChaCha8Rng::from_seed(*hasher.finalize().as_bytes());
        let sigma = self.profile.scale().recip();
        slots
            .into_iter()
            .map(|v| {
                let z: f64 = StandardNormal.sample(&mut rng);
                v + z * sigma
            })
            .collect()
    }

    fn wrap(&self, key_id: &str, level: usize, payload: Vec<f64>) -> Ciphertext {
        Ciphertext {
            profile: self.profile.id,
            key_id: key_id.to_string(),
            level,
            scale: self.profile.scale(),
            payload,
        }
    }
}

impl LatticeBackend for MockCkksBackend {
    fn profile(&self) -> &'static Profile {
        self.profile
    }

    fn keygen(&self) -> HeResult<KeySet> {
        // Key values come from the OS entropy source; weak randomness here
        // would void the scheme's security entirely.
        let mut seed = [0u8; 32];
        rand::rngs::OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|e| HeError::corrupt(format!("OS entropy source unavailable: {e}")))?;
        let key_id = hex::encode(&blake3::hash(&seed).as_bytes()[..8]);
        let material = *blake3::keyed_hash(&seed, b"cipherstat public key material").as_bytes();
        let secret = SecretKey {
            profile: self.profile.id,
            key_id: key_id.clone(),
            seed,
        };
        let public = PublicKey {
            profile: self.profile.id,
            key_id: key_id.clone(),
            material,
        };
        let eval = EvalKeys {
            profile: self.profile.id,
            key_id,
            relin: true,
            rotation_steps: self
                .profile
                .rotation_steps()
                .into_iter()
                .map(|s| s as u32)
                .collect(),
        };
        Ok(KeySet::new(secret, public, eval))
    }

    fn encrypt(&self, pk: &PublicKey, pt: &Plaintext) -> HeResult<Ciphertext> {
        if pk.profile != self.profile.id {
            return Err(HeError::profile_mismatch(
                self.profile.id,
                pk.profile,
                "public key",
            ));
        }
        self.check_plain(pt)?;
        let payload = self.noisy("encrypt", pt.slots.clone());
        Ok(self.wrap(&pk.key_id, self.profile.max_level(), payload))
    }

    fn decrypt(&self, sk: &SecretKey, ct: &Ciphertext) -> HeResult<Plaintext> {
        if sk.profile != self.profile.id {
            return Err(HeError::profile_mismatch(
                self.profile.id,
                sk.profile,
                "secret key",
            ));
        }
        check_operand(self.profile, ct)?;
        if sk.key_id != ct.key_id {
            // A real scheme hands back ring garbage, not an error; emulate
            // that so callers cannot rely on wrong-key decryption failing.
            let mut hasher = blake3::Hasher::new();
            hasher.update(sk.key_id.as_bytes());
            for v in &ct.payload {
                hasher.update(&v.to_le_bytes());
            }
            let mut rng = ChaCha8Rng::from_seed(*hasher.finalize().as_bytes());
            let garbage = (0..ct.payload.len())
                .map(|_| {
                    let z: f64 = StandardNormal.sample(&mut rng);
                    // Shift away from zero so garbage always dwarfs any
                    // legitimate aggregate.
                    (z + 4.0 * z.signum())
                        * self.profile.plain_bound()
                        * self.profile.slots as f64
                        * 4096.0
                })
                .collect();
            return Ok(Plaintext::new(self.profile.id, garbage));
        }
        Ok(Plaintext::new(self.profile.id, ct.payload.clone()))
    }

    fn add(&self, a: &Ciphertext, b: &Ciphertext) -> HeResult<Ciphertext> {
        check_pair(self.profile, a, b)?;
        let payload = a
            .payload
            .iter()
            .zip(&b.payload)
            .map(|(x, y)| x + y)
            .collect();
        Ok(self.wrap(&a.key_id, a.level.min(b.level), payload))
    }

    fn sub(&self, a: &Ciphertext, b: &Ciphertext) -> HeResult<Ciphertext> {
        check_pair(self.profile, a, b)?;
        let payload = a
            .payload
            .iter()
            .zip(&b.payload)
            .map(|(x, y)| x - y)
            .collect();
        Ok(self.wrap(&a.key_id, a.level.min(b.level), payload))
    }

    fn add_plain(&self, a: &Ciphertext, pt: &Plaintext) -> HeResult<Ciphertext> {
        check_operand(self.profile, a)?;
        self.check_plain(pt)?;
        let payload = a.payload.iter().zip(&pt.slots).map(|(x, y)| x + y).collect();
        Ok(self.wrap(&a.key_id, a.level, payload))
    }

    fn add_scalar(&self, a: &Ciphertext, value: f64) -> HeResult<Ciphertext> {
        check_operand(self.profile, a)?;
        let payload = a.payload.iter().map(|x| x + value).collect();
        Ok(self.wrap(&a.key_id, a.level, payload))
    }

    fn negate(&self, a: &Ciphertext) -> HeResult<Ciphertext> {
        check_operand(self.profile, a)?;
        let payload = a.payload.iter().map(|x| -x).collect();
        Ok(self.wrap(&a.key_id, a.level, payload))
    }

    fn mul(&self, a: &Ciphertext, b: &Ciphertext, ek: &EvalKeys) -> HeResult<Ciphertext> {
        check_pair(self.profile, a, b)?;
        self.check_eval_keys(ek, a)?;
        if !ek.relin {
            return Err(HeError::SlotLayoutMismatch {
                reason: "evaluation keys carry no relinearization key".to_string(),
            });
        }
        let level = self.consume_level(a.level.min(b.level))?;
        let product = a
            .payload
            .iter()
            .zip(&b.payload)
            .map(|(x, y)| x * y)
            .collect();
        Ok(self.wrap(&a.key_id, level, self.noisy("mul", product)))
    }

    fn mul_plain(&self, a: &Ciphertext, pt: &Plaintext) -> HeResult<Ciphertext> {
        check_operand(self.profile, a)?;
        self.check_plain(pt)?;
        let level = self.consume_level(a.level)?;
        let product = a.payload.iter().zip(&pt.slots).map(|(x, y)| x * y).collect();
        Ok(self.wrap(&a.key_id, level, self.noisy("mul_plain", product)))
    }

    fn mul_scalar(&self, a: &Ciphertext, value: f64) -> HeResult<Ciphertext> {
        check_operand(self.profile, a)?;
        let level = self.consume_level(a.level)?;
        let product = a.payload.iter().map(|x| x * value).collect();
        Ok(self.wrap(&a.key_id, level, self.noisy("mul_scalar", product)))
    }

    fn rotate(&self, a: &Ciphertext, step: usize, ek: &EvalKeys) -> HeResult<Ciphertext> {
        check_operand(self.profile, a)?;
        self.check_eval_keys(ek, a)?;
        if !ek.supports_rotation(step % self.profile.slots) {
            return Err(HeError::SlotLayoutMismatch {
                reason: format!("no rotation key for step {step}"),
            });
        }
        let mut payload = a.payload.clone();
        payload.rotate_left(step % self.profile.slots);
        Ok(self.wrap(&a.key_id, a.level, payload))
    }

    fn bootstrap(&self, a: &Ciphertext) -> HeResult<Ciphertext> {
        check_operand(self.profile, a)?;
        if !self.profile.bootstrap {
            return Err(HeError::DepthBudgetExceeded {
                needed: 1,
                available: a.level,
            });
        }
        let payload = self.noisy("bootstrap", a.payload.clone());
        Ok(self.wrap(&a.key_id, self.profile.max_level(), payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileId;
    use approx::assert_abs_diff_eq;

    fn setup() -> (MockCkksBackend, KeySet) {
        let backend = MockCkksBackend::new(Profile::resolve(ProfileId::T));
        let keys = backend.keygen().unwrap();
        (backend, keys)
    }

    fn encrypt(backend: &MockCkksBackend, keys: &KeySet, slots: &[f64]) -> Ciphertext {
        let pt = Plaintext::new(ProfileId::T, slots.to_vec());
        backend.encrypt(&keys.public, &pt).unwrap()
    }

    #[test]
    fn encrypt_decrypt_round_trips_within_noise() {
        let (backend, keys) = setup();
        let slots = [30.0, 40.0, 50.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let ct = encrypt(&backend, &keys, &slots);
        assert_eq!(ct.level, backend.profile().max_level());
        let pt = backend.decrypt(&keys.secret, &ct).unwrap();
        for (got, want) in pt.slots.iter().zip(&slots) {
            assert_abs_diff_eq!(got, want, epsilon = 1e-3);
        }
    }

    #[test]
    fn wrong_secret_key_yields_garbage_not_plaintext() {
        let (backend, keys) = setup();
        let other = backend.keygen().unwrap();
        let ct = encrypt(&backend, &keys, &[7.0; 8]);
        let pt = backend.decrypt(&other.secret, &ct).unwrap();
        assert!(pt.slots.iter().any(|v| (v - 7.0).abs() > 1.0));
    }

    #[test]
    fn mul_consumes_exactly_one_level() {
        let (backend, keys) = setup();
        let a = encrypt(&backend, &keys, &[2.0; 8]);
        let b = encrypt(&backend, &keys, &[3.0; 8]);
        let c = backend.mul(&a, &b, &keys.eval).unwrap();
        assert_eq!(c.level, a.level - 1);
        let pt = backend.decrypt(&keys.secret, &c).unwrap();
        assert_abs_diff_eq!(pt.slots[0], 6.0, epsilon = 1e-3);
    }

    #[test]
    fn exhausted_ciphertext_refuses_multiplication() {
        let (backend, keys) = setup();
        let mut ct = encrypt(&backend, &keys, &[1.5; 8]);
        for _ in 0..backend.profile().max_level() {
            ct = backend.mul_scalar(&ct, 1.0).unwrap();
        }
        assert_eq!(ct.level, 0);
        let err = backend.mul_scalar(&ct, 1.0).unwrap_err();
        assert!(err.to_string().starts_with("DepthBudgetExceeded"));
        // Bootstrapping restores the budget on profile T.
        let refreshed = backend.bootstrap(&ct).unwrap();
        assert_eq!(refreshed.level, backend.profile().max_level());
    }

    #[test]
    fn rotation_shifts_slots_left() {
        let (backend, keys) = setup();
        let ct = encrypt(&backend, &keys, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        let rotated = backend.rotate(&ct, 2, &keys.eval).unwrap();
        let pt = backend.decrypt(&keys.secret, &rotated).unwrap();
        assert_abs_diff_eq!(pt.slots[0], 3.0, epsilon = 1e-3);
        assert_abs_diff_eq!(pt.slots[7], 2.0, epsilon = 1e-3);
    }

    #[test]
    fn cross_key_operands_are_rejected() {
        let (backend, keys) = setup();
        let other = backend.keygen().unwrap();
        let a = encrypt(&backend, &keys, &[1.0; 8]);
        let b = encrypt(&backend, &other, &[1.0; 8]);
        let err = backend.add(&a, &b).unwrap_err();
        assert!(err.to_string().starts_with("SlotLayoutMismatch"));
    }

    #[test]
    fn cross_profile_plaintext_is_rejected() {
        let (backend, keys) = setup();
        let ct = encrypt(&backend, &keys, &[1.0; 8]);
        let pt = Plaintext::new(ProfileId::A, vec![1.0; 8]);
        let err = backend.add_plain(&ct, &pt).unwrap_err();
        assert!(err.to_string().starts_with("ProfileMismatch"));
    }
}
