//! Rotating Ed25519 signing keys and the tokens signed with them.
//!
//! The issuer side generates, rotates and deletes keys, persists them as a
//! snapshot, publishes the public half as a JWKS and signs tokens with the
//! current active key. The verifier side resolves a token's `kid` against the
//! published set and checks signature and expiry.

pub mod endpoints;
pub mod jwks;
pub mod keys;
pub mod rotation;
pub mod scheduler;
pub mod signing;
pub mod snapshot;
pub mod store;
pub mod verify;

pub use endpoints::*;
pub use jwks::*;
pub use keys::*;
pub use rotation::*;
pub use scheduler::*;
pub use signing::*;
pub use snapshot::*;
pub use store::*;
pub use verify::*;
