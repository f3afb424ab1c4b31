// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(missing_docs)]

//! Secure Provisioning Module (SPM) secure element API.
//!
//! This crate mediates access to a hardware security module so that factory
//! provisioning flows can, per chip, derive wrapped transport secrets,
//! generate symmetric keys bound to a device identity, generate key pairs
//! with CA-signed X.509 certificates, and endorse externally built TBS
//! certificates.
//!
//! All operations run against a bounded pool of authenticated HSM sessions;
//! the pool is the only synchronization point, so the [`Hsm`] handle is safe
//! to share across request-serving threads.

mod cert;
mod config;
mod error;
mod hsm;
mod session;
mod types;

pub mod pk11;

pub use cert::CertTemplate;
pub use config::*;
pub use error::*;
pub use hsm::*;
pub use types::*;
