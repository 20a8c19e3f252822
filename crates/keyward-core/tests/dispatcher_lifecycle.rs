use std::{sync::Arc, thread};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keyward_core::{
    Analyzer, CryptoDispatcher, HsmError, KeyFilter, KeyGenerationRequest, KeyPolicyConfig,
    KeySelector, MemoryKeyRegistry, MemoryOperationLog, OperationLog, OperationQuery,
    OperationType, Plaintext, SessionAdapter, SessionCredentials, SoftHsm, VerificationOutcome,
    soft::DEFAULT_TOKEN_LABEL,
};

type Dispatcher = CryptoDispatcher<MemoryKeyRegistry, MemoryOperationLog>;

fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

fn setup() -> (SoftHsm, Arc<Dispatcher>) {
    init_tracing();
    let hsm = SoftHsm::new(DEFAULT_TOKEN_LABEL, "1234");
    let session = Arc::new(SessionAdapter::new(
        Arc::new(hsm.clone()),
        SessionCredentials::new(Some(DEFAULT_TOKEN_LABEL.into()), "1234"),
    ));
    let dispatcher = CryptoDispatcher::new(
        session,
        Arc::new(MemoryKeyRegistry::new()),
        Arc::new(MemoryOperationLog::new()),
        KeyPolicyConfig::default(),
    );
    (hsm, Arc::new(dispatcher))
}

fn all_records(dispatcher: &Dispatcher) -> Vec<keyward_core::OperationRecord> {
    dispatcher
        .operation_log()
        .query(&OperationQuery::default())
        .expect("query")
}

#[test]
fn rsa_key_lifecycle_gates_operations() {
    let (_hsm, dispatcher) = setup();
    let k1 = KeySelector::named("k1");

    let generated = dispatcher
        .generate_key_pair(KeyGenerationRequest::rsa("k1", 2048))
        .expect("generate k1");
    assert!(generated.public_info.starts_with("-----BEGIN PUBLIC KEY-----"));

    dispatcher.activate("k1").expect("activate");
    let signed = dispatcher.sign(b"hello", &k1).expect("sign");
    assert_eq!(signed.signature.len(), 512);

    let verified = dispatcher
        .verify(b"hello", &signed.signature, &k1)
        .expect("verify");
    assert!(verified.valid);

    dispatcher.deactivate("k1").expect("deactivate");
    let err = dispatcher
        .verify(b"hello", &signed.signature, &k1)
        .expect_err("inactive key");
    assert!(matches!(err, HsmError::KeyInactive(label) if label == "k1"));

    let record = dispatcher.key("k1").expect("k1 record");
    assert!(!record.active);
    assert_eq!(record.usage_count, 2);
    assert!(dispatcher.list_keys(KeyFilter::Active).expect("list").is_empty());
}

#[test]
fn deactivated_key_refuses_every_operation() {
    let (_hsm, dispatcher) = setup();
    dispatcher
        .generate_key_pair(KeyGenerationRequest::rsa("frozen", 2048))
        .expect("generate");
    let selector = KeySelector::named("frozen");
    let signed = dispatcher.sign(b"memo", &selector).expect("sign");
    let encrypted = dispatcher.encrypt(b"memo", &selector).expect("encrypt");
    let hashed = dispatcher
        .hash_and_sign(b"memo", "sha256", &selector)
        .expect("hash and sign");
    let usage_before = dispatcher.key("frozen").expect("record").usage_count;
    assert_eq!(usage_before, 3);

    dispatcher.deactivate("frozen").expect("deactivate");
    let refusals = [
        dispatcher.sign(b"memo", &selector).map(|_| ()),
        dispatcher.verify(b"memo", &signed.signature, &selector).map(|_| ()),
        dispatcher.encrypt(b"memo", &selector).map(|_| ()),
        dispatcher.decrypt(&encrypted.ciphertext, &selector).map(|_| ()),
        dispatcher.hash_and_sign(b"memo", "sha256", &selector).map(|_| ()),
        dispatcher
            .verify_hash_signature(
                b"memo",
                &hashed.signature,
                "sha256",
                Some(&hashed.digest),
                &selector,
            )
            .map(|_| ()),
    ];
    for refusal in refusals {
        assert!(matches!(refusal, Err(HsmError::KeyInactive(label)) if label == "frozen"));
    }

    let records = all_records(&dispatcher);
    for record in &records[..6] {
        assert!(!record.success);
        assert_eq!(record.key_label.as_deref(), Some("frozen"));
        assert!(record.error.as_deref().is_some_and(|e| e.starts_with("key_inactive")));
        assert!(record.signature.is_none());
        assert!(record.outcome.is_none());
        assert!(record.digest.is_none());
    }
    assert_eq!(dispatcher.key("frozen").expect("record").usage_count, usage_before);
}

#[test]
fn failed_lookups_leave_sign_means_untouched() {
    let (_hsm, dispatcher) = setup();
    dispatcher
        .generate_key_pair(KeyGenerationRequest::ec("timed"))
        .expect("generate");
    let signed = dispatcher
        .sign(b"sample", &KeySelector::named("timed"))
        .expect("sign");
    for _ in 0..9 {
        let err = dispatcher
            .sign(b"sample", &KeySelector::named("absent"))
            .expect_err("missing key");
        assert!(matches!(err, HsmError::KeyNotFound(_)));
    }

    let analyzer = Analyzer::new(Arc::clone(dispatcher.operation_log()));
    assert_eq!(
        analyzer.mean_duration(OperationType::Sign).expect("mean"),
        signed.processing_time
    );
    let by_algorithm = analyzer
        .mean_duration_by_algorithm(OperationType::Sign)
        .expect("by algorithm");
    assert_eq!(by_algorithm.get("ECDSA"), Some(&signed.processing_time));
    assert!(!by_algorithm.contains_key("unknown"));

    let summary = analyzer
        .usage_summary(dispatcher.registry().as_ref())
        .expect("summary");
    assert_eq!(summary.total_operations, 11);
    assert_eq!(summary.successful_operations, 2);
}

#[test]
fn encrypt_decrypt_round_trip() {
    let (_hsm, dispatcher) = setup();
    dispatcher
        .generate_key_pair(KeyGenerationRequest::rsa("enc", 2048))
        .expect("generate");
    let selector = KeySelector::named("enc");

    let encrypted = dispatcher.encrypt(b"secret", &selector).expect("encrypt");
    let decrypted = dispatcher
        .decrypt(&encrypted.ciphertext, &selector)
        .expect("decrypt");
    assert_eq!(decrypted.plaintext, Plaintext::Text("secret".into()));

    let binary = [0xffu8, 0x00, 0xfe];
    let encrypted = dispatcher.encrypt(&binary, &selector).expect("encrypt");
    let decrypted = dispatcher
        .decrypt(&encrypted.ciphertext, &selector)
        .expect("decrypt");
    assert_eq!(decrypted.plaintext.as_bytes(), &binary);
    assert!(!decrypted.plaintext.is_text());
}

#[test]
fn oversized_payload_is_rejected() {
    let (_hsm, dispatcher) = setup();
    dispatcher
        .generate_key_pair(KeyGenerationRequest::rsa("small", 1024))
        .expect("generate");
    let selector = KeySelector::named("small");
    dispatcher
        .encrypt(&[7u8; 117], &selector)
        .expect("payload at capacity");
    let err = dispatcher
        .encrypt(&[7u8; 118], &selector)
        .expect_err("payload too large");
    assert!(matches!(err, HsmError::InvalidInput(_)));
}

#[test]
fn hash_and_sign_detects_tampering() {
    let (_hsm, dispatcher) = setup();
    dispatcher
        .generate_key_pair(KeyGenerationRequest::rsa("doc", 2048))
        .expect("generate");
    let selector = KeySelector::named("doc");

    let signed = dispatcher
        .hash_and_sign(b"contract v1", "sha256", &selector)
        .expect("hash and sign");
    assert_eq!(signed.digest.len(), 64);

    let intact = dispatcher
        .verify_hash_signature(b"contract v1", &signed.signature, "sha256", None, &selector)
        .expect("verify intact");
    assert_eq!(intact.outcome, VerificationOutcome::Valid);
    assert_eq!(intact.recovered_digest.as_deref(), Some(signed.digest.as_str()));

    let tampered = dispatcher
        .verify_hash_signature(b"contract v2", &signed.signature, "sha256", None, &selector)
        .expect("verify tampered");
    assert_eq!(tampered.outcome, VerificationOutcome::IntegrityMismatch);
    assert!(!tampered.valid);

    let forged = "00".repeat(256);
    let garbage = dispatcher
        .verify_hash_signature(b"contract v1", &forged, "sha256", None, &selector)
        .expect("verify forged");
    assert_eq!(garbage.outcome, VerificationOutcome::SignatureInvalid);

    let records = dispatcher
        .operation_log()
        .query(&OperationQuery::operation(OperationType::HashVerify))
        .expect("query");
    let outcomes: Vec<_> = records.iter().filter_map(|r| r.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            VerificationOutcome::SignatureInvalid,
            VerificationOutcome::IntegrityMismatch,
            VerificationOutcome::Valid,
        ]
    );
}

#[test]
fn most_recent_key_is_used_without_a_label() {
    let (_hsm, dispatcher) = setup();
    dispatcher
        .generate_key_pair(KeyGenerationRequest::ec("first"))
        .expect("generate");
    dispatcher
        .generate_key_pair(KeyGenerationRequest::ec("second"))
        .expect("generate");
    let signed = dispatcher
        .sign(b"unlabelled", &KeySelector::from_label(None))
        .expect("sign");
    assert_eq!(signed.label, "second");
}

#[test]
fn every_call_appends_exactly_one_record() {
    let (_hsm, dispatcher) = setup();
    dispatcher
        .generate_key_pair(KeyGenerationRequest::ec("ec"))
        .expect("generate");
    let selector = KeySelector::named("ec");
    let signed = dispatcher.sign(b"a", &selector).expect("sign");
    dispatcher
        .verify(b"a", &signed.signature, &selector)
        .expect("verify");
    dispatcher.hash(b"a", "md5").expect("hash");
    let _ = dispatcher.sign(b"a", &KeySelector::named("missing"));
    let _ = dispatcher.hash(b"a", "whirlpool");
    let _ = dispatcher.encrypt(b"a", &selector);

    let records = all_records(&dispatcher);
    assert_eq!(records.len(), 7);
    assert_eq!(records.iter().filter(|r| r.success).count(), 4);
    let missing = records
        .iter()
        .find(|r| r.key_label.as_deref() == Some("missing"))
        .expect("missing key record");
    assert!(
        missing
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("key_not_found"))
    );
}

#[test]
fn concurrent_signers_keep_counts_consistent() {
    let (_hsm, dispatcher) = setup();
    dispatcher
        .generate_key_pair(KeyGenerationRequest::ec("shared"))
        .expect("generate");

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || {
                for round in 0..10 {
                    let message = format!("{worker}-{round}");
                    dispatcher
                        .sign(message.as_bytes(), &KeySelector::named("shared"))
                        .expect("sign");
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker");
    }

    assert_eq!(dispatcher.key("shared").expect("record").usage_count, 40);
    assert_eq!(
        dispatcher
            .operation_log()
            .query(&OperationQuery::operation(OperationType::Sign))
            .expect("query")
            .len(),
        40
    );
}

#[test]
fn session_recovers_after_device_reset() {
    let (hsm, dispatcher) = setup();
    dispatcher
        .generate_key_pair(KeyGenerationRequest::ec("ec"))
        .expect("generate");
    let selector = KeySelector::named("ec");
    dispatcher.sign(b"before", &selector).expect("sign");

    hsm.invalidate_sessions();
    dispatcher.sign(b"after", &selector).expect("sign after reset");

    hsm.set_available(false);
    let err = dispatcher.sign(b"offline", &selector).expect_err("offline");
    assert!(matches!(err, HsmError::DeviceUnavailable(_)));
    hsm.set_available(true);
    dispatcher.sign(b"online", &selector).expect("sign after outage");
}

#[test]
fn analyzer_reports_means_per_algorithm() {
    let (_hsm, dispatcher) = setup();
    for algorithm in ["sha256", "sha256", "md5", "sha3-512"] {
        dispatcher.hash(b"sample data", algorithm).expect("hash");
    }
    let analyzer = Analyzer::new(Arc::clone(dispatcher.operation_log()));
    let by_algorithm = analyzer
        .mean_duration_by_algorithm(OperationType::Hash)
        .expect("by algorithm");
    let names: Vec<_> = by_algorithm.keys().cloned().collect();
    assert_eq!(names, vec!["md5", "sha256", "sha3_512"]);

    let summary = analyzer
        .usage_summary(dispatcher.registry().as_ref())
        .expect("summary");
    assert_eq!(summary.total_operations, 4);
    assert_eq!(summary.success_rate, Some(1.0));
}
