pub mod ecdsa;
pub mod error;
pub mod jwk;
pub mod jwks;
pub mod keyhandle;
pub mod minter;
pub mod signer;
pub mod verifier;

pub use error::{JwksError, MintError, SignerError, VerifyError};
pub use jwks::{JwksCache, JwksSource, LocalJwksSource, RemoteJwksSource};
pub use keyhandle::KeyHandle;
pub use minter::{AssertionClaims, S2SMinter};
pub use signer::{KeySigner, KmsKeySigner};
pub use verifier::S2SVerifier;
