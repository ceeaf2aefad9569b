//! Handle and credential verification
//!
//! Every handle learned from a message passes through a [`Verifier`] before
//! the node stores or uses it. A rejected handle is treated as dead.

use std::fmt;

use ringmesh_protocol::{Credentials, Handle};
use thiserror::Error;

/// Verification failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("handle for {0} does not belong to this transport")]
    ForeignHandle(String),

    #[error("credentials rejected: {0}")]
    BadCredentials(String),
}

/// Pluggable verification layer
pub trait Verifier: Send + Sync + fmt::Debug {
    /// Check a handle, possibly returning a transport-specific replacement
    fn verify_handle(&self, handle: &Handle) -> Result<Handle, VerifyError>;

    /// Check the credentials carried by a routed message
    fn verify_credentials(&self, credentials: &Credentials) -> Result<(), VerifyError>;
}

/// Accepts every handle and credential unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissiveVerifier;

impl Verifier for PermissiveVerifier {
    fn verify_handle(&self, handle: &Handle) -> Result<Handle, VerifyError> {
        Ok(handle.clone())
    }

    fn verify_credentials(&self, _credentials: &Credentials) -> Result<(), VerifyError> {
        Ok(())
    }
}
