// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Request and response types for the SPM operations.

use crate::cert::CertTemplate;
use crate::pk11;

/// Parameters selecting the kind of key pair to generate.
#[derive(Debug, Clone)]
pub enum KeyParams {
    /// RSA key generation.
    Rsa {
        /// Modulus size in bits.
        mod_bits: u32,

        /// Public exponent.
        exponent: u32,
    },

    /// ECDSA key generation on a named curve.
    Ec {
        /// The curve to generate on.
        curve: pk11::EcCurve,
    },
}

/// Parameters for one certificate issuance.
#[derive(Debug, Clone)]
pub struct SigningParams {
    /// Key generation parameters.
    pub key_params: KeyParams,

    /// X.509 template for the issued certificate.
    pub template: CertTemplate,
}

/// Result of one [`crate::Hsm::generate_key_pair_and_cert`] issuance.
#[derive(Debug, Clone)]
pub struct CertInfo {
    /// DER-encoded certificate.
    pub cert: Vec<u8>,

    /// Generated private key, wrapped under the global secret `KG`.
    pub wrapped_key: Vec<u8>,

    /// IV used by the wrap.
    pub iv: Vec<u8>,
}

/// Post-processing applied to generated symmetric keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymmetricKeyType {
    /// Return the derived bytes as-is.
    Raw,

    /// Hash the derived bytes in place with cSHAKE128 and the `"LC_CTRL"`
    /// customization string, the form lifecycle tokens take in OTP.
    HashedOtLcToken,
}

/// Parameters for one symmetric key derivation.
#[derive(Debug, Clone)]
pub struct SymmetricKeygenParams {
    /// SKU identifier; used as the HKDF salt.
    pub sku: String,

    /// Diversification bytes; used as the HKDF info.
    pub diversifier: Vec<u8>,

    /// Derived key size in bits.
    pub size_in_bits: usize,

    /// Selects `HighSecKdfSeed` over `LowSecKdfSeed` as the derivation
    /// seed.
    pub use_high_security_seed: bool,

    /// Post-processing applied to the derived bytes.
    pub key_type: SymmetricKeyType,
}

/// Signature algorithms understood by the provisioning RPC surface.
///
/// Only the ECDSA variants are accepted by [`crate::Hsm::endorse_cert`];
/// the rest are rejected as invalid arguments before any HSM interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    /// ECDSA over SHA-256.
    EcdsaSha256,

    /// ECDSA over SHA-384.
    EcdsaSha384,

    /// ECDSA over SHA-512.
    EcdsaSha512,

    /// RSA PKCS#1 v1.5 over SHA-256.
    Sha256WithRsa,

    /// RSA PKCS#1 v1.5 over SHA-384.
    Sha384WithRsa,

    /// RSA PKCS#1 v1.5 over SHA-512.
    Sha512WithRsa,
}

/// Parameters for endorsing an externally built TBS certificate.
#[derive(Debug, Clone)]
pub struct EndorseCertParams {
    /// Label of the endorsing CA private key, resolved per request.
    pub key_label: String,

    /// Signature algorithm to endorse with.
    pub signature_algorithm: SignatureAlgorithm,
}
