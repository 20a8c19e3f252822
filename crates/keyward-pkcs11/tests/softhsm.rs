//! Runs the dispatcher against a real token. Needs SoftHSM2 with an
//! initialised token:
//!
//! ```text
//! softhsm2-util --init-token --free --label keyward-test --pin 1234 --so-pin 0000
//! KEYWARD_LIBRARY_PATH=/usr/lib/softhsm/libsofthsm2.so cargo test -p keyward-pkcs11 -- --ignored
//! ```

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use keyward_core::{
    CryptoDispatcher, KeyGenerationRequest, KeySelector, KeywardConfig, Plaintext,
    VerificationOutcome,
};
use keyward_pkcs11::Pkcs11Driver;

fn dispatcher() -> CryptoDispatcher<dyn keyward_core::KeyRegistry, dyn keyward_core::OperationLog> {
    let mut config = KeywardConfig::default();
    config.device.token_label = Some("keyward-test".into());
    let config = config.with_env_overrides().expect("config");
    let driver = Pkcs11Driver::from_config(&config.device).expect("library path");
    CryptoDispatcher::from_config(&config, Arc::new(driver)).expect("dispatcher")
}

fn unique(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    format!("{prefix}-{nanos}")
}

#[test]
#[ignore = "requires SoftHSM2"]
fn rsa_round_trip_on_softhsm() {
    let dispatcher = dispatcher();
    let label = unique("rsa");
    dispatcher
        .generate_key_pair(KeyGenerationRequest::rsa(&label, 2048))
        .expect("generate");
    let selector = KeySelector::named(&label);

    let signed = dispatcher.sign(b"hello", &selector).expect("sign");
    assert!(
        dispatcher
            .verify(b"hello", &signed.signature, &selector)
            .expect("verify")
            .valid
    );

    let encrypted = dispatcher.encrypt(b"secret", &selector).expect("encrypt");
    let decrypted = dispatcher
        .decrypt(&encrypted.ciphertext, &selector)
        .expect("decrypt");
    assert_eq!(decrypted.plaintext, Plaintext::Text("secret".into()));

    let hashed = dispatcher
        .hash_and_sign(b"contract", "sha256", &selector)
        .expect("hash and sign");
    let tampered = dispatcher
        .verify_hash_signature(b"contracts", &hashed.signature, "sha256", None, &selector)
        .expect("verify tampered");
    assert_eq!(tampered.outcome, VerificationOutcome::IntegrityMismatch);
    assert!(tampered.recovered_digest.is_some());
}

#[test]
#[ignore = "requires SoftHSM2"]
fn ec_sign_verify_on_softhsm() {
    let dispatcher = dispatcher();
    let label = unique("ec");
    let generated = dispatcher
        .generate_key_pair(KeyGenerationRequest::ec(&label))
        .expect("generate");
    assert_eq!(generated.public_info.len(), 130);

    let selector = KeySelector::named(&label);
    let signed = dispatcher.sign(b"payload", &selector).expect("sign");
    assert!(
        !dispatcher
            .verify(b"tampered", &signed.signature, &selector)
            .expect("verify")
            .valid
    );

    let hashed = dispatcher
        .hash_and_sign(b"contract", "sha256", &selector)
        .expect("hash and sign");
    let tampered = dispatcher
        .verify_hash_signature(
            b"contracts",
            &hashed.signature,
            "sha256",
            Some(&hashed.digest),
            &selector,
        )
        .expect("verify tampered");
    assert_eq!(tampered.outcome, VerificationOutcome::IntegrityMismatch);
}
