// Copyright (C) Microsoft Corporation. All rights reserved.

//! Shared provisioning helpers for the SPM integration tests.
//!
//! Each test binary provisions its own software tokens, preloaded with the
//! long-lived keys the SPM expects (`KG`, `KT`, `KCAPriv`,
//! `HighSecKdfSeed`, `LowSecKdfSeed`), and keeps the raw key material
//! around so OpenSSL can act as the independent verifier.

#![allow(dead_code)]

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::EcGroup;
use openssl::ec::EcKey;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::pkey::Private;
use openssl::pkey::Public;
use openssl::x509::X509NameBuilder;
use openssl::x509::X509;

use spm::pk11;
use spm::pk11::soft::SoftModule;
use spm::pk11::soft::SoftToken;
use spm::Hsm;
use spm::HsmConfig;

pub const TEST_PIN: &str = "test-pin";

pub struct TestHsmSetup {
    pub so_path: String,
    pub module: Arc<SoftModule>,
    pub token: SoftToken,
    pub kg: Vec<u8>,
    pub kt: Vec<u8>,
    pub high_seed: Vec<u8>,
    pub low_seed: Vec<u8>,
    pub ca_key: EcKey<Private>,
    pub ca_cert: Vec<u8>,
}

static NEXT_TOKEN: AtomicUsize = AtomicUsize::new(0);

/// Provisions a fresh soft token with the long-lived SPM keys.
pub fn provision() -> TestHsmSetup {
    let so_path = format!("soft-token-{}", NEXT_TOKEN.fetch_add(1, Ordering::Relaxed));
    let module = SoftModule::create(&so_path, TEST_PIN);
    let token = module.token(0).unwrap();

    let kg = random_key(32);
    let kt = random_key(32);
    let high_seed = random_key(32);
    let low_seed = random_key(32);
    token.import_aes_key("KG", &kg).unwrap();
    token.import_aes_key("KT", &kt).unwrap();
    token.import_aes_key("HighSecKdfSeed", &high_seed).unwrap();
    token.import_aes_key("LowSecKdfSeed", &low_seed).unwrap();

    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let ca_key = EcKey::generate(&group).unwrap();
    token
        .import_ec_private_key("KCAPriv", ca_key.clone())
        .unwrap();
    let ca_cert = self_signed_ca(&ca_key);

    TestHsmSetup {
        so_path,
        module,
        token,
        kg,
        kt,
        high_seed,
        low_seed,
        ca_key,
        ca_cert,
    }
}

pub fn config(setup: &TestHsmSetup, num_sessions: usize) -> HsmConfig {
    HsmConfig {
        hsm_type: pk11::HsmType::SoftHsm,
        so_path: setup.so_path.clone(),
        slot_id: 0,
        hsm_password: TEST_PIN.into(),
        num_sessions,
        acquire_timeout: None,
        symmetric_keys: vec![
            "KG".into(),
            "KT".into(),
            "HighSecKdfSeed".into(),
            "LowSecKdfSeed".into(),
        ],
        private_keys: vec!["KCAPriv".into()],
    }
}

pub fn new_hsm(setup: &TestHsmSetup, num_sessions: usize) -> Hsm {
    let result = Hsm::new(&config(setup, num_sessions));
    assert!(result.is_ok(), "result {:?}", result.err());
    result.unwrap()
}

pub fn random_key(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    openssl::rand::rand_bytes(&mut buf).unwrap();
    buf
}

/// Public half of the provisioned CA key.
pub fn ca_public_key(setup: &TestHsmSetup) -> PKey<Public> {
    X509::from_der(&setup.ca_cert).unwrap().public_key().unwrap()
}

fn self_signed_ca(key: &EcKey<Private>) -> Vec<u8> {
    let pkey = PKey::from_ec_key(key.clone()).unwrap();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "SPM Test CA").unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&pkey).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(3650).unwrap())
        .unwrap();
    builder.sign(&pkey, MessageDigest::sha256()).unwrap();
    builder.build().to_der().unwrap()
}

/// Builds an externally signed certificate under the test CA and returns
/// its TBS bytes, for endorsement tests. `md` selects the hash named in the
/// TBS signature field, so it must match the endorsement algorithm.
pub fn make_tbs(setup: &TestHsmSetup, md: MessageDigest) -> Vec<u8> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let leaf = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();
    let ca_pkey = PKey::from_ec_key(setup.ca_key.clone()).unwrap();

    let mut subject = X509NameBuilder::new().unwrap();
    subject.append_entry_by_text("CN", "endorse-target").unwrap();
    let subject = subject.build();
    let mut issuer = X509NameBuilder::new().unwrap();
    issuer.append_entry_by_text("CN", "SPM Test CA").unwrap();
    let issuer = issuer.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(7).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&subject).unwrap();
    builder.set_issuer_name(&issuer).unwrap();
    builder.set_pubkey(&leaf).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(365).unwrap())
        .unwrap();
    builder.sign(&ca_pkey, md).unwrap();

    tbs_bytes(&builder.build().to_der().unwrap())
}

/// AES-KW unwrap (RFC 3394) with the default initial value.
pub fn unwrap_key(kek: &[u8], wrapped: &[u8]) -> Vec<u8> {
    let key = openssl::aes::AesKey::new_decrypt(kek).unwrap();
    let mut out = vec![0u8; wrapped.len() - 8];
    let written = openssl::aes::unwrap_key(&key, None, &mut out, wrapped).unwrap();
    out.truncate(written);
    out
}

/// Returns the first element (the TBS) of a DER-encoded certificate.
pub fn tbs_bytes(cert_der: &[u8]) -> Vec<u8> {
    assert_eq!(cert_der[0], 0x30, "certificate is not a SEQUENCE");
    let (content_start, _) = der_length(cert_der, 1);
    assert_eq!(cert_der[content_start], 0x30, "TBS is not a SEQUENCE");
    let (tbs_content, tbs_len) = der_length(cert_der, content_start + 1);
    cert_der[content_start..tbs_content + tbs_len].to_vec()
}

/// Reads a DER length at `at`; returns (content offset, content length).
fn der_length(buf: &[u8], at: usize) -> (usize, usize) {
    let first = buf[at];
    if first < 0x80 {
        (at + 1, first as usize)
    } else {
        let num_bytes = (first & 0x7f) as usize;
        let mut len = 0usize;
        for i in 0..num_bytes {
            len = (len << 8) | buf[at + 1 + i] as usize;
        }
        (at + 1 + num_bytes, len)
    }
}
