// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! X.509 certificate production.
//!
//! [`assembler`] owns the signature-algorithm OID tables and the final DER
//! assembly of `SEQUENCE { tbsCertificate, signatureAlgorithm,
//! signatureValue }`; [`template`](CertTemplate) expands issuance templates
//! into TBS certificates. Neither half touches the HSM.

pub(crate) mod assembler;
mod template;

pub use template::CertTemplate;

pub(crate) use template::build_tbs_certificate;
pub(crate) use template::ca_signature_params;
