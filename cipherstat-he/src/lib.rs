//! Lattice-HE capability layer for the cipherstat pipeline.
//!
//! Exposes parameter profiles, key material with an on-disk lifecycle, and
//! the [`backend::LatticeBackend`] trait the pipeline evaluates against. The
//! bundled [`mock::MockCkksBackend`] is a development/test stand-in; a real
//! lattice library slots in behind the same trait.

pub mod backend;
pub mod error;
pub mod keys;
pub mod mock;
pub mod profile;
pub mod wire;

pub use backend::{Ciphertext, LatticeBackend, Plaintext};
pub use error::{HeError, HeResult};
pub use keys::{EvalKeys, KeyManager, KeySet, PublicKey, SecretKey};
pub use mock::MockCkksBackend;
pub use profile::{Profile, ProfileId};
