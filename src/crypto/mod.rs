//! GraphiVault - Cryptographic Core
//!
//! Password KDF, AES-256-GCM, key hierarchy and nonce sequencing.

pub mod aead;
pub mod kdf;
pub mod keys;
pub mod nonce;

pub use aead::{open, seal, NonceBytes, NONCE_LEN, TAG_LEN};
pub use kdf::{derive_key, generate_salt, KdfAlgorithm, KdfParams, KeyDeriver, StandardKdf};
pub use keys::{MasterKey, RootKey, SecretPassword, KEY_LEN};
pub use nonce::{NonceSequence, ReservationStore};
