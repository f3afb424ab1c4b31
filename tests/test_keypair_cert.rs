// Copyright (C) Microsoft Corporation. All rights reserved.

mod common;

use std::time::Duration;
use std::time::SystemTime;

use openssl::bn::BigNum;
use openssl::bn::BigNumContext;
use openssl::ec::EcGroup;
use openssl::ec::EcPoint;
use openssl::nid::Nid;
use openssl::x509::X509;
use spm::pk11::EcCurve;
use spm::CertTemplate;
use spm::KeyParams;
use spm::SigningParams;
use spm::SpmError;

use crate::common::*;

fn template(subject: &str) -> CertTemplate {
    CertTemplate {
        serial_number: vec![0x01, 0x23, 0x45],
        subject: subject.into(),
        not_before: SystemTime::now() - Duration::from_secs(3600),
        not_after: SystemTime::now() + Duration::from_secs(365 * 24 * 3600),
        is_ca: false,
    }
}

#[test]
fn test_ec_keypair_and_cert() {
    let setup = provision();
    let hsm = new_hsm(&setup, 2);
    let objects_before = setup.token.object_count();

    let infos = hsm
        .generate_key_pair_and_cert(
            &setup.ca_cert,
            &[SigningParams {
                key_params: KeyParams::Ec {
                    curve: EcCurve::P256,
                },
                template: template("CN=dev-0001"),
            }],
        )
        .unwrap();
    assert_eq!(infos.len(), 1);
    let info = &infos[0];

    // The certificate parses and verifies under the CA public key.
    let cert = X509::from_der(&info.cert).unwrap();
    assert!(cert.verify(&ca_public_key(&setup)).unwrap());
    let subject: Vec<_> = cert
        .subject_name()
        .entries()
        .map(|e| e.data().as_utf8().unwrap().to_string())
        .collect();
    assert_eq!(subject, ["dev-0001"]);

    // The wrapped private key unwraps under KG to the P-256 scalar matching
    // the certificate's public key.
    assert_eq!(info.iv.len(), 8);
    let scalar = unwrap_key(&setup.kg, &info.wrapped_key);
    assert_eq!(scalar.len(), 32);

    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let scalar_bn = BigNum::from_slice(&scalar).unwrap();
    let mut ctx = BigNumContext::new().unwrap();
    let mut derived_point = EcPoint::new(&group).unwrap();
    derived_point
        .mul_generator(&group, &scalar_bn, &ctx)
        .unwrap();
    let cert_key = cert.public_key().unwrap().ec_key().unwrap();
    assert!(derived_point
        .eq(&group, cert_key.public_key(), &mut ctx)
        .unwrap());

    // The ephemeral key pair was destroyed on the HSM.
    assert_eq!(setup.token.object_count(), objects_before);
}

#[test]
fn test_rsa_keypair_and_cert() {
    let setup = provision();
    let hsm = new_hsm(&setup, 2);

    let infos = hsm
        .generate_key_pair_and_cert(
            &setup.ca_cert,
            &[SigningParams {
                key_params: KeyParams::Rsa {
                    mod_bits: 2048,
                    exponent: 65537,
                },
                template: template("CN=dev-0002"),
            }],
        )
        .unwrap();
    assert_eq!(infos.len(), 1);

    let cert = X509::from_der(&infos[0].cert).unwrap();
    assert!(cert.verify(&ca_public_key(&setup)).unwrap());
    assert_eq!(cert.public_key().unwrap().rsa().unwrap().size(), 256);
    assert!(!infos[0].wrapped_key.is_empty());
}

#[test]
fn test_batch_issuance_preserves_order() {
    let setup = provision();
    let hsm = new_hsm(&setup, 2);

    let infos = hsm
        .generate_key_pair_and_cert(
            &setup.ca_cert,
            &[
                SigningParams {
                    key_params: KeyParams::Ec {
                        curve: EcCurve::P256,
                    },
                    template: template("CN=dev-a"),
                },
                SigningParams {
                    key_params: KeyParams::Ec {
                        curve: EcCurve::P384,
                    },
                    template: template("CN=dev-b"),
                },
            ],
        )
        .unwrap();
    assert_eq!(infos.len(), 2);

    for (info, expected) in infos.iter().zip(["dev-a", "dev-b"]) {
        let cert = X509::from_der(&info.cert).unwrap();
        assert!(cert.verify(&ca_public_key(&setup)).unwrap());
        let subject: Vec<_> = cert
            .subject_name()
            .entries()
            .map(|e| e.data().as_utf8().unwrap().to_string())
            .collect();
        assert_eq!(subject, [expected]);
    }
}

#[test]
fn test_garbage_ca_cert_is_an_input_error() {
    let setup = provision();
    let hsm = new_hsm(&setup, 1);

    let result = hsm.generate_key_pair_and_cert(
        b"not a certificate",
        &[SigningParams {
            key_params: KeyParams::Ec {
                curve: EcCurve::P256,
            },
            template: template("CN=dev-0001"),
        }],
    );
    assert!(
        matches!(result, Err(SpmError::InvalidInput(_))),
        "result {:?}",
        result
    );
}
