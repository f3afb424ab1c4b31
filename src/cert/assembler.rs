// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! DER assembly of endorsed certificates and ECDSA signatures.

use der::asn1::AnyRef;
use der::asn1::BitStringRef;
use der::asn1::ObjectIdentifier;
use der::asn1::UintRef;
use der::Decode;
use der::Encode;
use der::Sequence;
use x509_cert::spki::AlgorithmIdentifierOwned;

use crate::error::SpmError;
use crate::error::SpmResult;
use crate::pk11::HashAlgo;
use crate::types::SignatureAlgorithm;

// OIDs for ECDSA signature algorithms corresponding to SHA-256, SHA-384 and
// SHA-512, per RFC 5758 section 3.2:
//
// ecdsa-with-SHA256 OBJECT IDENTIFIER ::= { iso(1) member-body(2)
//   us(840) ansi-X9-62(10045) signatures(4) ecdsa-with-SHA2(3) 2 }
pub(crate) const ECDSA_WITH_SHA256: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
pub(crate) const ECDSA_WITH_SHA384: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.3");
pub(crate) const ECDSA_WITH_SHA512: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.4");

/// Returns the ASN.1 object identifier for the given signature algorithm.
pub(crate) fn signature_oid(alg: SignatureAlgorithm) -> SpmResult<ObjectIdentifier> {
    match alg {
        SignatureAlgorithm::EcdsaSha256 => Ok(ECDSA_WITH_SHA256),
        SignatureAlgorithm::EcdsaSha384 => Ok(ECDSA_WITH_SHA384),
        SignatureAlgorithm::EcdsaSha512 => Ok(ECDSA_WITH_SHA512),
        other => Err(SpmError::invalid_input(format!(
            "unsupported signature algorithm: {other:?}"
        ))),
    }
}

/// Returns the hash to sign with for the given signature algorithm.
pub(crate) fn signature_hash(alg: SignatureAlgorithm) -> SpmResult<HashAlgo> {
    match alg {
        SignatureAlgorithm::EcdsaSha256 => Ok(HashAlgo::Sha256),
        SignatureAlgorithm::EcdsaSha384 => Ok(HashAlgo::Sha384),
        SignatureAlgorithm::EcdsaSha512 => Ok(HashAlgo::Sha512),
        other => Err(SpmError::invalid_input(format!(
            "unsupported signature algorithm: {other:?}"
        ))),
    }
}

#[derive(Sequence)]
struct EcdsaSigValue<'a> {
    r: UintRef<'a>,
    s: UintRef<'a>,
}

const ZERO: &[u8] = &[0x00];

fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|&b| b != 0) {
        Some(first_nonzero) => &bytes[first_nonzero..],
        None => ZERO,
    }
}

/// Encodes raw ECDSA halves as DER `SEQUENCE { r INTEGER, s INTEGER }`.
///
/// Both integers are encoded as canonical non-negative values; the encoder
/// adds the sign byte when the high bit is set.
pub(crate) fn encode_ecdsa_signature(r: &[u8], s: &[u8]) -> SpmResult<Vec<u8>> {
    let signature = EcdsaSigValue {
        r: UintRef::new(trim_leading_zeros(r))?,
        s: UintRef::new(trim_leading_zeros(s))?,
    };
    Ok(signature.to_der()?)
}

#[derive(Sequence)]
struct CertificateRaw<'a> {
    tbs_certificate: AnyRef<'a>,
    signature_algorithm: AlgorithmIdentifierOwned,
    signature: BitStringRef<'a>,
}

/// Assembles the final DER certificate from a pre-encoded TBS, the signature
/// algorithm OID, and the DER signature bytes.
///
/// The TBS is embedded verbatim; re-encoding it would change the bytes and
/// invalidate the signature. The signature bit string has zero unused bits.
pub(crate) fn assemble_certificate(
    tbs: &[u8],
    algorithm: ObjectIdentifier,
    signature: &[u8],
) -> SpmResult<Vec<u8>> {
    let certificate = CertificateRaw {
        tbs_certificate: AnyRef::from_der(tbs)
            .map_err(|err| SpmError::invalid_input(format!("TBS is not a DER element: {err}")))?,
        signature_algorithm: AlgorithmIdentifierOwned {
            oid: algorithm,
            parameters: None,
        },
        signature: BitStringRef::from_bytes(signature)?,
    };
    Ok(certificate.to_der()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcCode;

    #[test]
    fn signature_encoding_trims_and_round_trips() {
        // Leading zeros are trimmed; a set high bit gets a sign byte from
        // the encoder.
        let r = [0x00, 0x00, 0x80, 0x01];
        let s = [0x7f, 0xff];
        let der = encode_ecdsa_signature(&r, &s).unwrap();
        assert_eq!(
            der,
            [0x30, 0x09, 0x02, 0x03, 0x00, 0x80, 0x01, 0x02, 0x02, 0x7f, 0xff]
        );

        let parsed = EcdsaSigValue::from_der(&der).unwrap();
        assert_eq!(parsed.r.as_bytes(), [0x80, 0x01]);
        assert_eq!(parsed.s.as_bytes(), [0x7f, 0xff]);
        assert_eq!(parsed.to_der().unwrap(), der);
    }

    #[test]
    fn all_zero_component_encodes_as_zero() {
        let der = encode_ecdsa_signature(&[0x00, 0x00], &[0x01]).unwrap();
        let parsed = EcdsaSigValue::from_der(&der).unwrap();
        assert_eq!(parsed.r.as_bytes(), [0x00]);
    }

    #[test]
    fn assembled_certificate_embeds_tbs_verbatim() {
        // A minimal DER SEQUENCE standing in for a TBS body.
        let tbs = [0x30, 0x03, 0x02, 0x01, 0x05];
        let signature = encode_ecdsa_signature(&[0x11; 32], &[0x22; 32]).unwrap();
        let cert = assemble_certificate(&tbs, ECDSA_WITH_SHA256, &signature).unwrap();

        let parsed = CertificateRaw::from_der(&cert).unwrap();
        assert_eq!(parsed.tbs_certificate.to_der().unwrap(), tbs);
        assert_eq!(parsed.signature_algorithm.oid, ECDSA_WITH_SHA256);
        assert!(parsed.signature_algorithm.parameters.is_none());
        assert_eq!(parsed.signature.raw_bytes(), signature.as_slice());
        assert_eq!(parsed.signature.unused_bits(), 0);
    }

    #[test]
    fn garbage_tbs_is_an_input_error() {
        let result = assemble_certificate(&[0xff, 0x00], ECDSA_WITH_SHA256, &[0x01]);
        assert!(matches!(result, Err(SpmError::InvalidInput(_))));
    }

    #[test]
    fn oid_table_matches_rfc_5758() {
        assert_eq!(
            signature_oid(SignatureAlgorithm::EcdsaSha256).unwrap(),
            ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2")
        );
        assert_eq!(
            signature_oid(SignatureAlgorithm::EcdsaSha384).unwrap(),
            ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.3")
        );
        assert_eq!(
            signature_oid(SignatureAlgorithm::EcdsaSha512).unwrap(),
            ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.4")
        );
    }

    #[test]
    fn non_ecdsa_algorithms_are_rejected() {
        for alg in [
            SignatureAlgorithm::Sha256WithRsa,
            SignatureAlgorithm::Sha384WithRsa,
            SignatureAlgorithm::Sha512WithRsa,
        ] {
            let result = signature_oid(alg);
            let err = result.unwrap_err();
            assert!(matches!(err, SpmError::InvalidInput(_)));
            assert_eq!(err.rpc_code(), RpcCode::InvalidArgument);
            assert!(signature_hash(alg).is_err());
        }
    }
}
