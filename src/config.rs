// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! SPM configuration surface.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::pk11;

/// Parameters used to configure a new [`crate::Hsm`] instance.
///
/// Supplied once at startup and immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HsmConfig {
    /// The type of the HSM behind the PKCS#11 module (software or network).
    pub hsm_type: pk11::HsmType,

    /// Path of the PKCS#11 module used to connect to the HSM.
    pub so_path: String,

    /// HSM slot ID.
    pub slot_id: usize,

    /// The Crypto User HSM password.
    pub hsm_password: String,

    /// Number of sessions to open in `slot_id`.
    pub num_sessions: usize,

    /// Upper bound on the time an operation may wait for a pooled session.
    ///
    /// `None` blocks indefinitely; a wedged HSM then wedges its callers, so
    /// production deployments are expected to set this.
    #[serde(default)]
    pub acquire_timeout: Option<Duration>,

    /// Labels of long-lived symmetric keys to resolve on the HSM at startup.
    #[serde(default)]
    pub symmetric_keys: Vec<String>,

    /// Labels of long-lived private keys to resolve on the HSM at startup.
    #[serde(default)]
    pub private_keys: Vec<String>,
}
