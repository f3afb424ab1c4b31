// Copyright (C) Microsoft Corporation. All rights reserved.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use openssl::hash::MessageDigest;
use spm::EndorseCertParams;
use spm::SignatureAlgorithm;
use spm::SpmError;

use crate::common::*;

#[test]
fn test_parallel_endorsements_are_bounded_by_the_pool() {
    let setup = provision();
    let hsm = Arc::new(new_hsm(&setup, 2));
    let tbs = make_tbs(&setup, MessageDigest::sha256());

    // Slow each sign down so overlap is observable.
    setup.token.set_sign_delay(Some(Duration::from_millis(25)));

    let workers: Vec<_> = (0..16)
        .map(|_| {
            let hsm = hsm.clone();
            let tbs = tbs.clone();
            thread::spawn(move || {
                hsm.endorse_cert(
                    &tbs,
                    &EndorseCertParams {
                        key_label: "KCAPriv".into(),
                        signature_algorithm: SignatureAlgorithm::EcdsaSha256,
                    },
                )
            })
        })
        .collect();
    for worker in workers {
        let result = worker.join().unwrap();
        assert!(result.is_ok(), "result {:?}", result);
    }
    setup.token.set_sign_delay(None);

    assert_eq!(setup.token.sign_count(), 16);
    // With a pool of two sessions, at most two signs can be in flight.
    assert!(
        setup.token.sign_high_water() <= 2,
        "sign high water {}",
        setup.token.sign_high_water()
    );
}

#[test]
fn test_acquire_timeout_bounds_a_wedged_pool() {
    let setup = provision();
    let mut cfg = config(&setup, 1);
    cfg.acquire_timeout = Some(Duration::from_millis(50));
    let hsm = Arc::new(spm::Hsm::new(&cfg).unwrap());

    // Wedge the only session.
    setup.token.set_sign_delay(Some(Duration::from_millis(500)));
    let tbs = make_tbs(&setup, MessageDigest::sha256());
    let holder = {
        let hsm = hsm.clone();
        let tbs = tbs.clone();
        thread::spawn(move || {
            hsm.endorse_cert(
                &tbs,
                &EndorseCertParams {
                    key_label: "KCAPriv".into(),
                    signature_algorithm: SignatureAlgorithm::EcdsaSha256,
                },
            )
        })
    };
    // Wait until the holder is provably inside the sign call.
    let mut waited = Duration::ZERO;
    while setup.token.signs_in_flight() == 0 && waited < Duration::from_secs(2) {
        thread::sleep(Duration::from_millis(5));
        waited += Duration::from_millis(5);
    }
    assert_eq!(setup.token.signs_in_flight(), 1);

    let result = hsm.generate_random(16);
    assert!(matches!(result, Err(SpmError::Resource(_))), "result {:?}", result);

    setup.token.set_sign_delay(None);
    assert!(holder.join().unwrap().is_ok());
}
