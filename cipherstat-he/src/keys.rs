//! Key material types and on-disk key lifecycle.
//!
//! A key set is generated once into a directory (secret, public and
//! evaluation keys in distinct files), then loaded read-only. The secret key
//! is the only secret-bearing entity in the system and is never serialized
//! anywhere except its own key file.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::backend::LatticeBackend;
use crate::error::{HeError, HeResult};
use crate::profile::{Profile, ProfileId};
use crate::wire::{atomic_write, Reader, Writer, KEY_MAGIC};

pub const SECRET_KEY_FILE: &str = "secret.key";
pub const PUBLIC_KEY_FILE: &str = "public.key";
pub const EVAL_KEY_FILE: &str = "eval.key";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyKind {
    Secret,
    Public,
    Eval,
}

impl KeyKind {
    fn as_u8(self) -> u8 {
        match self {
            KeyKind::Secret => 0,
            KeyKind::Public => 1,
            KeyKind::Eval => 2,
        }
    }

    fn from_u8(v: u8) -> HeResult<Self> {
        match v {
            0 => Ok(KeyKind::Secret),
            1 => Ok(KeyKind::Public),
            2 => Ok(KeyKind::Eval),
            other => Err(HeError::corrupt(format!("unknown key kind tag {other}"))),
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyKind::Secret => write!(f, "secret"),
            KeyKind::Public => write!(f, "public"),
            KeyKind::Eval => write!(f, "eval"),
        }
    }
}

/// Secret decryption key. Deliberately not serde-serializable; the wire
/// format below is its only persistence path.
#[derive(Clone)]
pub struct SecretKey {
    pub profile: ProfileId,
    pub key_id: String,
    pub(crate) seed: [u8; 32],
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never leak the seed through Debug output.
        f.debug_struct("SecretKey")
            .field("profile", &self.profile)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub struct PublicKey {
    pub profile: ProfileId,
    pub key_id: String,
    pub(crate) material: [u8; 32],
}

/// Relinearization and rotation key material.
#[derive(Clone, Debug)]
pub struct EvalKeys {
    pub profile: ProfileId,
    pub key_id: String,
    pub relin: bool,
    pub rotation_steps: Vec<u32>,
}

impl EvalKeys {
    pub fn supports_rotation(&self, step: usize) -> bool {
        self.rotation_steps.contains(&(step as u32))
    }
}

/// A complete, logically paired key set for one profile.
#[derive(Debug)]
pub struct KeySet {
    pub profile: ProfileId,
    pub secret: SecretKey,
    pub public: PublicKey,
    pub eval: EvalKeys,
}

impl KeySet {
    pub(crate) fn new(secret: SecretKey, public: PublicKey, eval: EvalKeys) -> Self {
        Self {
            profile: secret.profile,
            secret,
            public,
            eval,
        }
    }
}

/// Generates and persists key sets, and loads them back read-only.
pub struct KeyManager;

impl KeyManager {
    /// Generate a key set for `backend`'s profile and persist it under `dir`.
    ///
    /// Refuses to overwrite existing key material unless `overwrite` is set.
    pub fn keygen(backend: &dyn LatticeBackend, dir: &Path, overwrite: bool) -> HeResult<KeySet> {
        fs::create_dir_all(dir)
            .map_err(|e| HeError::io(format!("creating key directory {}", dir.display()), e))?;
        for file in [SECRET_KEY_FILE, PUBLIC_KEY_FILE, EVAL_KEY_FILE] {
            let path = dir.join(file);
            if path.exists() && !overwrite {
                return Err(HeError::KeyExistsConflict { path });
            }
        }

        let keys = backend.keygen()?;
        atomic_write(&dir.join(SECRET_KEY_FILE), &secret_to_bytes(&keys.secret)?)?;
        atomic_write(&dir.join(PUBLIC_KEY_FILE), &public_to_bytes(&keys.public)?)?;
        atomic_write(&dir.join(EVAL_KEY_FILE), &eval_to_bytes(&keys.eval)?)?;
        info!(
            profile = %keys.profile,
            key_id = %keys.secret.key_id,
            dir = %dir.display(),
            "generated key set"
        );
        Ok(keys)
    }

    /// Load a complete key set from a key directory.
    pub fn load_keyset(dir: &Path) -> HeResult<KeySet> {
        let secret = Self::load_secret(&dir.join(SECRET_KEY_FILE))?;
        let public = Self::load_public(&dir.join(PUBLIC_KEY_FILE))?;
        let eval = Self::load_eval(&dir.join(EVAL_KEY_FILE))?;
        if public.profile != secret.profile || eval.profile != secret.profile {
            return Err(HeError::corrupt(format!(
                "key set in {} mixes profiles {}, {}, {}",
                dir.display(),
                secret.profile,
                public.profile,
                eval.profile
            )));
        }
        if public.key_id != secret.key_id || eval.key_id != secret.key_id {
            return Err(HeError::corrupt(format!(
                "key set in {} mixes unrelated key ids",
                dir.display()
            )));
        }
        Ok(KeySet::new(secret, public, eval))
    }

    pub fn load_secret(path: &Path) -> HeResult<SecretKey> {
        let (kind, profile, key_id, blob) = read_key_file(path)?;
        expect_kind(kind, KeyKind::Secret, path)?;
        let seed: [u8; 32] = blob
            .as_slice()
            .try_into()
            .map_err(|_| HeError::corrupt(format!("secret key blob in {} has wrong size", path.display())))?;
        Ok(SecretKey {
            profile,
            key_id,
            seed,
        })
    }

    pub fn load_public(path: &Path) -> HeResult<PublicKey> {
        let (kind, profile, key_id, blob) = read_key_file(path)?;
        expect_kind(kind, KeyKind::Public, path)?;
        let material: [u8; 32] = blob
            .as_slice()
            .try_into()
            .map_err(|_| HeError::corrupt(format!("public key blob in {} has wrong size", path.display())))?;
        Ok(PublicKey {
            profile,
            key_id,
            material,
        })
    }

    pub fn load_eval(path: &Path) -> HeResult<EvalKeys> {
        let (kind, profile, key_id, blob) = read_key_file(path)?;
        expect_kind(kind, KeyKind::Eval, path)?;
        let mut r = Reader::new(&blob);
        let relin = r.u8()? != 0;
        let count = r.u32()? as usize;
        let mut rotation_steps = Vec::with_capacity(count);
        for _ in 0..count {
            rotation_steps.push(r.u32()?);
        }
        Ok(EvalKeys {
            profile,
            key_id,
            relin,
            rotation_steps,
        })
    }
}

fn expect_kind(found: KeyKind, expected: KeyKind, path: &Path) -> HeResult<()> {
    if found != expected {
        return Err(HeError::corrupt(format!(
            "{} holds a {found} key, expected {expected}",
            path.display()
        )));
    }
    Ok(())
}

fn key_file_bytes(kind: KeyKind, profile: ProfileId, key_id: &str, blob: &[u8]) -> HeResult<Vec<u8>> {
    let mut w = Writer::new(KEY_MAGIC);
    w.u8(kind.as_u8());
    w.string(&profile.to_string())?;
    w.string(key_id)?;
    w.bytes(blob);
    Ok(w.finish())
}

fn secret_to_bytes(sk: &SecretKey) -> HeResult<Vec<u8>> {
    key_file_bytes(KeyKind::Secret, sk.profile, &sk.key_id, &sk.seed)
}

fn public_to_bytes(pk: &PublicKey) -> HeResult<Vec<u8>> {
    key_file_bytes(KeyKind::Public, pk.profile, &pk.key_id, &pk.material)
}

fn eval_to_bytes(ek: &EvalKeys) -> HeResult<Vec<u8>> {
    let mut blob = Writer::default();
    blob.u8(ek.relin as u8);
    blob.u32(ek.rotation_steps.len() as u32);
    for step in &ek.rotation_steps {
        blob.u32(*step);
    }
    key_file_bytes(KeyKind::Eval, ek.profile, &ek.key_id, &blob.finish())
}

fn read_key_file(path: &Path) -> HeResult<(KeyKind, ProfileId, String, Vec<u8>)> {
    let bytes =
        fs::read(path).map_err(|e| HeError::io(format!("reading key file {}", path.display()), e))?;
    let mut r = Reader::new(&bytes);
    let parsed: HeResult<_> = (|| {
        r.magic(KEY_MAGIC)?;
        r.version()?;
        let kind = KeyKind::from_u8(r.u8()?)?;
        let profile_str = r.string()?;
        let key_id = r.string()?;
        let blob = r.bytes()?;
        Ok((kind, profile_str, key_id, blob))
    })();
    let (kind, profile_str, key_id, blob) = parsed.map_err(|e| match e {
        // Framing problems in a key file are corrupt key material, whatever
        // the underlying reader reported.
        HeError::CorruptArtifact { reason } => HeError::corrupt(format!(
            "malformed key file {}: {reason}",
            path.display()
        )),
        other => other,
    })?;
    let profile: ProfileId = profile_str.parse().map_err(|_| {
        HeError::profile_mismatch(
            "a registered profile",
            &profile_str,
            format!("embedded in key file {}", path.display()),
        )
    })?;
    Ok((kind, profile, key_id, blob))
}

/// Sanity check that a key was generated for the expected profile.
pub fn require_profile(expected: &Profile, found: ProfileId, context: &str) -> HeResult<()> {
    if expected.id != found {
        return Err(HeError::profile_mismatch(expected.id, found, context));
    }
    Ok(())
}

/// Key file header fields, readable without interpreting the blob.
#[derive(Clone, Debug)]
pub struct KeyFileHeader {
    pub kind: String,
    pub profile: String,
    pub key_id: String,
}

/// Header-only view of a key file, for inspection tooling.
pub fn inspect_key_file(path: &Path) -> HeResult<KeyFileHeader> {
    let (kind, profile, key_id, _) = read_key_file(path)?;
    Ok(KeyFileHeader {
        kind: kind.to_string(),
        profile: profile.to_string(),
        key_id,
    })
}
