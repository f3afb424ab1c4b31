// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Issuance templates and TBS certificate construction.

use std::str::FromStr;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use der::asn1::GeneralizedTime;
use der::asn1::ObjectIdentifier;
use der::asn1::OctetString;
use der::asn1::UtcTime;
use der::Decode;
use der::DateTime;
use der::Encode;
use x509_cert::certificate::TbsCertificate;
use x509_cert::certificate::Version;
use x509_cert::ext::pkix::BasicConstraints;
use x509_cert::ext::pkix::KeyUsage;
use x509_cert::ext::pkix::KeyUsages;
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::Time;
use x509_cert::time::Validity;
use x509_cert::Certificate;

use super::assembler;
use crate::error::SpmError;
use crate::error::SpmResult;
use crate::pk11::HashAlgo;

const ID_CE_KEY_USAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.15");
const ID_CE_BASIC_CONSTRAINTS: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.19");

const ID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const SECP256R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");
const SECP384R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");
const SECP521R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.35");

/// X.509 template for certificates issued by
/// [`crate::Hsm::generate_key_pair_and_cert`].
///
/// Issuer and signature algorithm are not part of the template; both come
/// from the CA certificate at issuance time.
#[derive(Debug, Clone)]
pub struct CertTemplate {
    /// Certificate serial number, big-endian, positive.
    pub serial_number: Vec<u8>,

    /// Subject distinguished name in RFC 4514 form, e.g. `"CN=dev-0001"`.
    pub subject: String,

    /// Start of the validity window.
    pub not_before: SystemTime,

    /// End of the validity window.
    pub not_after: SystemTime,

    /// Whether the subject is itself a CA.
    pub is_ca: bool,
}

fn asn1_time(time: SystemTime) -> SpmResult<Time> {
    let unix = time
        .duration_since(UNIX_EPOCH)
        .map_err(|_| SpmError::invalid_input("validity time precedes the UNIX epoch"))?;
    let datetime = DateTime::from_unix_duration(unix)
        .map_err(|err| SpmError::invalid_input(format!("validity time out of range: {err}")))?;
    // RFC 5280: dates through 2049 are UTCTime, later ones GeneralizedTime.
    if datetime.year() < 2050 {
        Ok(Time::UtcTime(UtcTime::from_date_time(datetime)?))
    } else {
        Ok(Time::GeneralTime(GeneralizedTime::from_date_time(datetime)))
    }
}

fn extensions(template: &CertTemplate) -> SpmResult<Vec<Extension>> {
    let key_usage = if template.is_ca {
        KeyUsages::KeyCertSign | KeyUsages::CRLSign
    } else {
        KeyUsages::DigitalSignature.into()
    };
    let mut extensions = vec![Extension {
        extn_id: ID_CE_KEY_USAGE,
        critical: true,
        extn_value: OctetString::new(KeyUsage(key_usage).to_der()?)?,
    }];
    if template.is_ca {
        extensions.push(Extension {
            extn_id: ID_CE_BASIC_CONSTRAINTS,
            critical: true,
            extn_value: OctetString::new(
                BasicConstraints {
                    ca: true,
                    path_len_constraint: None,
                }
                .to_der()?,
            )?,
        });
    }
    Ok(extensions)
}

/// Expands `template` into DER-encoded TBS certificate bytes.
///
/// `spki_der` is the generated key's SubjectPublicKeyInfo as exported off
/// the HSM; `issuer` is the CA certificate's subject.
pub(crate) fn build_tbs_certificate(
    template: &CertTemplate,
    issuer: &Name,
    spki_der: &[u8],
    signature_algorithm: &AlgorithmIdentifierOwned,
) -> SpmResult<Vec<u8>> {
    let serial_number = SerialNumber::new(&template.serial_number)
        .map_err(|err| SpmError::invalid_input(format!("invalid serial number: {err}")))?;
    let subject = Name::from_str(&template.subject).map_err(|err| {
        SpmError::invalid_input(format!("invalid subject {:?}: {err}", template.subject))
    })?;
    let subject_public_key_info = SubjectPublicKeyInfoOwned::from_der(spki_der)
        .map_err(|err| SpmError::crypto(format!("exported public key is not valid SPKI: {err}")))?;

    let tbs = TbsCertificate {
        version: Version::V3,
        serial_number,
        signature: signature_algorithm.clone(),
        issuer: issuer.clone(),
        validity: Validity {
            not_before: asn1_time(template.not_before)?,
            not_after: asn1_time(template.not_after)?,
        },
        subject,
        subject_public_key_info,
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: Some(extensions(template)?),
    };
    Ok(tbs.to_der()?)
}

/// Derives the signature hash and algorithm OID for certificates signed by
/// the given CA, from the CA key's curve (the hash tracks the curve
/// strength, matching standard issuance behavior).
pub(crate) fn ca_signature_params(ca: &Certificate) -> SpmResult<(HashAlgo, ObjectIdentifier)> {
    let spki = &ca.tbs_certificate.subject_public_key_info;
    if spki.algorithm.oid != ID_EC_PUBLIC_KEY {
        return Err(SpmError::invalid_input(
            "CA public key is not an EC key; only ECDSA endorsement is supported",
        ));
    }
    let curve: ObjectIdentifier = spki
        .algorithm
        .parameters
        .as_ref()
        .ok_or_else(|| SpmError::invalid_input("CA public key has no curve parameters"))?
        .decode_as()
        .map_err(|err| {
            SpmError::invalid_input(format!("CA public key curve parameters are malformed: {err}"))
        })?;
    if curve == SECP256R1 {
        Ok((HashAlgo::Sha256, assembler::ECDSA_WITH_SHA256))
    } else if curve == SECP384R1 {
        Ok((HashAlgo::Sha384, assembler::ECDSA_WITH_SHA384))
    } else if curve == SECP521R1 {
        Ok((HashAlgo::Sha512, assembler::ECDSA_WITH_SHA512))
    } else {
        Err(SpmError::invalid_input(format!(
            "unsupported CA curve: {curve}"
        )))
    }
}
