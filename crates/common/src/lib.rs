//! Common functionality for the JWKS rotator.
//!
//! This crate holds everything the `jwks-issuer` and `jwks-verifier` binaries
//! share: settings, errors, logging and the key lifecycle itself.
//!
//! # Modules
//!
//! - [`error`]: Error types and their HTTP mapping
//! - [`key_signing`]: Keys, snapshots, rotation, signing and verification
//! - [`logging`]: Logger setup
//! - [`settings`]: Configuration management and validation
//! - [`test_support`]: Testing utilities

pub mod error;
pub mod key_signing;
pub mod logging;
pub mod settings;
