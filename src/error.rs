// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error taxonomy for the SPM.
//!
//! Every failure surfaced by this crate is an [`SpmError`]; the RPC layer
//! translates it to a client-facing status through [`SpmError::rpc_code`].
//! Errors are never retried inside the SPM, and a failing operation always
//! returns its pooled session on the way out.

use std::error::Error;
use std::fmt;
use std::fmt::Debug;
use std::fmt::Display;

/// RPC status category an [`SpmError`] maps to at the service boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcCode {
    /// Server-side failure; the request itself was well-formed.
    Internal,

    /// The caller supplied an argument the SPM cannot act on.
    InvalidArgument,
}

/// Errors surfaced by the SPM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpmError {
    /// Startup configuration failure: missing label, slot index out of
    /// range, module load or login failure.
    Config(String),

    /// Session pool failure: queue overflow on insert, acquisition timeout,
    /// failure to open or authenticate a session.
    Resource(String),

    /// A key label required by an operation is absent.
    Lookup(String),

    /// The HSM reported a derivation, wrap, sign or generate failure, or
    /// produced bytes could not be encoded.
    Crypto(String),

    /// The caller supplied an unsupported algorithm or malformed input.
    InvalidInput(String),

    /// The HSM exported a key of an unexpected concrete type.
    ExportedType(String),
}

impl SpmError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        SpmError::Config(msg.into())
    }

    pub(crate) fn resource(msg: impl Into<String>) -> Self {
        SpmError::Resource(msg.into())
    }

    pub(crate) fn lookup(msg: impl Into<String>) -> Self {
        SpmError::Lookup(msg.into())
    }

    pub(crate) fn crypto(msg: impl Into<String>) -> Self {
        SpmError::Crypto(msg.into())
    }

    pub(crate) fn invalid_input(msg: impl Into<String>) -> Self {
        SpmError::InvalidInput(msg.into())
    }

    pub(crate) fn exported_type(msg: impl Into<String>) -> Self {
        SpmError::ExportedType(msg.into())
    }

    /// Returns the RPC status category for this error.
    pub fn rpc_code(&self) -> RpcCode {
        match self {
            SpmError::InvalidInput(_) => RpcCode::InvalidArgument,
            _ => RpcCode::Internal,
        }
    }
}

impl Display for SpmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpmError::Config(msg) => write!(f, "configuration error: {msg}"),
            SpmError::Resource(msg) => write!(f, "resource error: {msg}"),
            SpmError::Lookup(msg) => write!(f, "lookup error: {msg}"),
            SpmError::Crypto(msg) => write!(f, "cryptographic failure: {msg}"),
            SpmError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            SpmError::ExportedType(msg) => {
                write!(f, "unexpected exported key type: {msg}")
            }
        }
    }
}

impl Error for SpmError {}

impl From<der::Error> for SpmError {
    fn from(err: der::Error) -> Self {
        SpmError::Crypto(format!("ASN.1 encoding failed: {err}"))
    }
}

/// Convenient result alias for SPM operations.
pub type SpmResult<T> = Result<T, SpmError>;

pub(crate) trait SpmErrorMapper<T, E> {
    fn map_spm_err(self, spm_err: SpmError) -> SpmResult<T>;
}

impl<T, E: Debug> SpmErrorMapper<T, E> for Result<T, E> {
    fn map_spm_err(self, spm_err: SpmError) -> SpmResult<T> {
        match self {
            Ok(t) => Ok(t),
            Err(err) => {
                tracing::error!("mapping error {:?} to SPM error: {:?}", err, spm_err);
                Err(spm_err)
            }
        }
    }
}
