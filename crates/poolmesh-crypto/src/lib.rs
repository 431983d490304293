//! Poolmesh crypto: identities, ECIES key wrapping, the streaming AEAD
//! codec, blob-mode AES-CBC, the keystore, and the signed-JSON envelope.

pub mod blob;
pub mod codec;
pub mod ecies;
pub mod envelope;
pub mod identity;
pub mod keystore;

pub use codec::{Blake2b256, DecryptingWriter, EncryptingReader, KeyFn};
pub use identity::{Identity, IdentityPublic};
pub use keystore::{Keystore, KeystoreLookup};
