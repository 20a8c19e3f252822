use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::{
    config::{KeyPolicyConfig, KeywardConfig},
    device::{HsmDriver, Mechanism, ObjectClass, ObjectHandle, pkcs1_max_payload},
    digest::HashAlgorithm,
    error::{ErrorKind, HsmError, HsmResult},
    models::{
        KeyFilter, KeyGenerationRequest, KeyRecord, KeyType, Plaintext, VerificationOutcome,
        millis,
    },
    oplog::{OperationLog, OperationRecord, OperationType, preview},
    registry::KeyRegistry,
    resolver::{KeyResolver, KeySelector},
    session::SessionAdapter,
};

const MAX_LABEL_LEN: usize = 128;

#[derive(Debug, Clone, Serialize)]
pub struct KeyGenerationResult {
    pub label: String,
    pub key_type: KeyType,
    pub key_size: u32,
    pub public_info: String,
    pub active: bool,
    #[serde(with = "millis")]
    pub processing_time: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignResult {
    pub label: String,
    pub mechanism: Mechanism,
    pub signature: String,
    #[serde(with = "millis")]
    pub processing_time: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyResult {
    pub label: String,
    pub mechanism: Mechanism,
    pub valid: bool,
    #[serde(with = "millis")]
    pub processing_time: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct EncryptResult {
    pub label: String,
    pub ciphertext: String,
    #[serde(with = "millis")]
    pub processing_time: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecryptResult {
    pub label: String,
    pub plaintext: Plaintext,
    #[serde(with = "millis")]
    pub processing_time: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct HashResult {
    pub algorithm: HashAlgorithm,
    pub digest: String,
    pub input_size: usize,
    #[serde(with = "millis")]
    pub processing_time: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct HashSignResult {
    pub label: String,
    pub algorithm: HashAlgorithm,
    pub mechanism: Mechanism,
    pub digest: String,
    pub signature: String,
    #[serde(with = "millis")]
    pub hash_time: Duration,
    #[serde(with = "millis")]
    pub sign_time: Duration,
    #[serde(rename = "processing_time", with = "millis")]
    pub total_time: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct HashVerifyResult {
    pub label: String,
    pub algorithm: HashAlgorithm,
    pub mechanism: Mechanism,
    pub computed_digest: String,
    /// Digest recovered from the signature, for mechanisms that embed it.
    pub recovered_digest: Option<String>,
    pub outcome: VerificationOutcome,
    pub valid: bool,
    #[serde(with = "millis")]
    pub hash_time: Duration,
    #[serde(with = "millis")]
    pub verify_time: Duration,
    #[serde(rename = "processing_time", with = "millis")]
    pub total_time: Duration,
}

/// A private key object found on the token, cross-referenced with the registry.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceKey {
    pub handle: ObjectHandle,
    pub label: Option<String>,
    pub registered: bool,
    pub active: bool,
}

/// Structured outcome handed to adapters: `{success: true, ..fields}` or
/// `{success: false, error_kind, message}`.
#[derive(Debug, Clone, Serialize)]
pub struct Response<T> {
    pub success: bool,
    #[serde(flatten)]
    pub body: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> From<HsmResult<T>> for Response<T> {
    fn from(result: HsmResult<T>) -> Self {
        match result {
            Ok(body) => Response {
                success: true,
                body: Some(body),
                error_kind: None,
                message: None,
            },
            Err(err) => Response {
                success: false,
                body: None,
                error_kind: Some(err.kind()),
                message: Some(err.to_string()),
            },
        }
    }
}

fn timed<T>(f: impl FnOnce() -> T) -> (Duration, T) {
    let started = Instant::now();
    let value = f();
    (started.elapsed(), value)
}

fn decode_hex(field: &str, value: &str) -> HsmResult<Vec<u8>> {
    hex::decode(value.trim()).map_err(|err| HsmError::invalid(format!("{field} is not valid hex: {err}")))
}

/// Orchestrates every key operation: resolve, gate, invoke, measure, record.
/// Whole operations are serialised so a state change cannot interleave with
/// an operation that already passed the active gate.
pub struct CryptoDispatcher<R: KeyRegistry + ?Sized, L: OperationLog + ?Sized> {
    session: Arc<SessionAdapter>,
    registry: Arc<R>,
    log: Arc<L>,
    resolver: KeyResolver<R>,
    policy: KeyPolicyConfig,
    serial: Mutex<()>,
}

impl CryptoDispatcher<dyn KeyRegistry, dyn OperationLog> {
    /// Build a dispatcher with the storage backends named in `config`.
    pub fn from_config(config: &KeywardConfig, driver: Arc<dyn HsmDriver>) -> HsmResult<Self> {
        config.validate()?;
        let session = Arc::new(SessionAdapter::new(driver, config.device.credentials()));
        Ok(Self::new(
            session,
            config.open_registry()?,
            config.open_operation_log()?,
            config.keys.clone(),
        ))
    }
}

impl<R, L> CryptoDispatcher<R, L>
where
    R: KeyRegistry + ?Sized,
    L: OperationLog + ?Sized,
{
    pub fn new(
        session: Arc<SessionAdapter>,
        registry: Arc<R>,
        log: Arc<L>,
        policy: KeyPolicyConfig,
    ) -> Self {
        let resolver = KeyResolver::new(Arc::clone(&registry), Arc::clone(&session));
        Self {
            session,
            registry,
            log,
            resolver,
            policy,
            serial: Mutex::new(()),
        }
    }

    pub fn session(&self) -> &SessionAdapter {
        &self.session
    }

    pub fn registry(&self) -> &Arc<R> {
        &self.registry
    }

    pub fn operation_log(&self) -> &Arc<L> {
        &self.log
    }

    /// Generate a key pair on the device and register it. Labels already known
    /// to the registry or present on the token are rejected.
    pub fn generate_key_pair(&self, request: KeyGenerationRequest) -> HsmResult<KeyGenerationResult> {
        let key_type = request.key_type.unwrap_or(self.policy.default_type);
        let key_size = request.key_size.unwrap_or(if key_type == self.policy.default_type {
            self.policy.default_size
        } else {
            key_type.default_size()
        });
        let active = request.active.unwrap_or(self.policy.activate_on_create);
        let label = match request.label.as_deref().map(str::trim) {
            Some(label) if !label.is_empty() => label.to_string(),
            _ => format!(
                "{}_key_{}",
                key_type.as_str().to_ascii_lowercase(),
                OffsetDateTime::now_utc().unix_timestamp()
            ),
        };

        let mut record = OperationRecord::new(OperationType::KeyGeneration);
        record.key_label = Some(label.clone());
        record.algorithm = Some(key_type.as_str().to_string());

        self.run(record, |rec| {
            if label.len() > MAX_LABEL_LEN || label.chars().any(char::is_control) {
                return Err(HsmError::invalid(format!(
                    "label must be at most {MAX_LABEL_LEN} printable characters"
                )));
            }
            key_type.validate_size(key_size)?;
            if self.registry.get(&label)?.is_some()
                || !self
                    .session
                    .find_objects(ObjectClass::PrivateKey, Some(&label))?
                    .is_empty()
            {
                return Err(HsmError::DuplicateLabel(label.clone()));
            }

            let (elapsed, generated) =
                timed(|| self.session.generate_key_pair(key_type, key_size, &label));
            rec.duration = elapsed;
            let pair = generated?;

            let key = KeyRecord::new(label.clone(), key_type, key_size, pair.public_info.clone(), active);
            if let Err(err) = self.registry.upsert(key) {
                for handle in [pair.private, pair.public] {
                    if let Err(cleanup) = self.session.destroy_object(handle) {
                        warn!(label = %label, handle, error = %cleanup, "failed to roll back key object");
                    }
                }
                return Err(err);
            }
            info!(label = %label, key_type = %key_type, key_size, active, "key pair generated");
            Ok(KeyGenerationResult {
                label: label.clone(),
                key_type,
                key_size,
                public_info: pair.public_info,
                active,
                processing_time: elapsed,
            })
        })
    }

    pub fn set_key_active(&self, label: &str, active: bool) -> HsmResult<()> {
        let _serial = self.serial.lock();
        if !self.registry.set_active(label, active)? {
            return Err(HsmError::KeyNotFound(label.to_string()));
        }
        info!(label = %label, active, "key state changed");
        Ok(())
    }

    pub fn activate(&self, label: &str) -> HsmResult<()> {
        self.set_key_active(label, true)
    }

    pub fn deactivate(&self, label: &str) -> HsmResult<()> {
        self.set_key_active(label, false)
    }

    pub fn list_keys(&self, filter: KeyFilter) -> HsmResult<Vec<KeyRecord>> {
        self.registry.list(filter)
    }

    pub fn key(&self, label: &str) -> HsmResult<KeyRecord> {
        self.registry
            .get(label)?
            .ok_or_else(|| HsmError::KeyNotFound(label.to_string()))
    }

    /// Private keys present on the token, with their registry standing.
    pub fn device_inventory(&self) -> HsmResult<Vec<DeviceKey>> {
        let _serial = self.serial.lock();
        let handles = self.session.find_objects(ObjectClass::PrivateKey, None)?;
        let mut inventory = Vec::with_capacity(handles.len());
        for handle in handles {
            let label = self.session.label_of(handle)?;
            let record = match label.as_deref() {
                Some(label) => self.registry.get(label)?,
                None => None,
            };
            inventory.push(DeviceKey {
                handle,
                label,
                registered: record.is_some(),
                active: record.is_some_and(|r| r.active),
            });
        }
        Ok(inventory)
    }

    pub fn sign(&self, data: &[u8], selector: &KeySelector) -> HsmResult<SignResult> {
        let record = self.draft(OperationType::Sign, selector, data.len());
        self.run(record, |rec| {
            let key = self.resolver.resolve_private(selector)?;
            let mechanism = self.signing_mechanism(&key.record);
            rec.key_label = Some(key.record.label.clone());
            rec.algorithm = Some(mechanism.as_str().to_string());

            let (elapsed, signed) = timed(|| self.session.sign(key.handle, mechanism, data));
            rec.duration = elapsed;
            let signature = hex::encode(signed?);
            rec.signature = Some(preview(&signature, self.policy.preview_chars));
            Ok(SignResult {
                label: key.record.label,
                mechanism,
                signature,
                processing_time: elapsed,
            })
        })
    }

    /// An invalid signature is a successful verification with `valid = false`.
    pub fn verify(
        &self,
        data: &[u8],
        signature_hex: &str,
        selector: &KeySelector,
    ) -> HsmResult<VerifyResult> {
        let record = self.draft(OperationType::Verify, selector, data.len());
        self.run(record, |rec| {
            let key = self.resolver.resolve_public(selector)?;
            let mechanism = self.signing_mechanism(&key.record);
            rec.key_label = Some(key.record.label.clone());
            rec.algorithm = Some(mechanism.as_str().to_string());
            rec.signature = Some(preview(signature_hex.trim(), self.policy.preview_chars));
            let signature = decode_hex("signature", signature_hex)?;

            let (elapsed, verified) =
                timed(|| self.session.verify(key.handle, mechanism, data, &signature));
            rec.duration = elapsed;
            let valid = verified?;
            rec.outcome = Some(if valid {
                VerificationOutcome::Valid
            } else {
                VerificationOutcome::SignatureInvalid
            });
            Ok(VerifyResult {
                label: key.record.label,
                mechanism,
                valid,
                processing_time: elapsed,
            })
        })
    }

    /// RSA-PKCS encryption under the key's public half. Payloads beyond the
    /// modulus capacity are rejected, not truncated.
    pub fn encrypt(&self, data: &[u8], selector: &KeySelector) -> HsmResult<EncryptResult> {
        let record = self.draft(OperationType::Encrypt, selector, data.len());
        self.run(record, |rec| {
            let key = self.resolver.resolve_public(selector)?;
            rec.key_label = Some(key.record.label.clone());
            rec.algorithm = Some(Mechanism::RsaPkcs.as_str().to_string());
            Self::require_rsa(&key.record)?;
            let capacity = pkcs1_max_payload(key.record.key_size);
            if data.len() > capacity {
                return Err(HsmError::invalid(format!(
                    "payload of {} bytes exceeds the {capacity}-byte limit of a {}-bit key",
                    data.len(),
                    key.record.key_size
                )));
            }

            let (elapsed, encrypted) =
                timed(|| self.session.encrypt(key.handle, Mechanism::RsaPkcs, data));
            rec.duration = elapsed;
            let ciphertext = hex::encode(encrypted?);
            rec.signature = Some(preview(&ciphertext, self.policy.preview_chars));
            Ok(EncryptResult {
                label: key.record.label,
                ciphertext,
                processing_time: elapsed,
            })
        })
    }

    pub fn decrypt(&self, ciphertext_hex: &str, selector: &KeySelector) -> HsmResult<DecryptResult> {
        let record = self.draft(OperationType::Decrypt, selector, ciphertext_hex.trim().len() / 2);
        self.run(record, |rec| {
            let key = self.resolver.resolve_private(selector)?;
            rec.key_label = Some(key.record.label.clone());
            rec.algorithm = Some(Mechanism::RsaPkcs.as_str().to_string());
            Self::require_rsa(&key.record)?;
            let ciphertext = decode_hex("ciphertext", ciphertext_hex)?;

            let (elapsed, decrypted) =
                timed(|| self.session.decrypt(key.handle, Mechanism::RsaPkcs, &ciphertext));
            rec.duration = elapsed;
            Ok(DecryptResult {
                label: key.record.label,
                plaintext: Plaintext::from_bytes(decrypted?),
                processing_time: elapsed,
            })
        })
    }

    pub fn hash(&self, data: &[u8], algorithm: &str) -> HsmResult<HashResult> {
        let mut record = OperationRecord::new(OperationType::Hash);
        record.input_size = data.len() as u64;
        record.algorithm = Some(algorithm.trim().to_string());
        self.run(record, |rec| {
            let algorithm: HashAlgorithm = algorithm.parse()?;
            rec.algorithm = Some(algorithm.as_str().to_string());
            let (elapsed, digest) = timed(|| algorithm.hex_digest(data));
            rec.duration = elapsed;
            rec.digest = Some(digest.clone());
            Ok(HashResult {
                algorithm,
                digest,
                input_size: data.len(),
                processing_time: elapsed,
            })
        })
    }

    /// Hash `data`, then sign the ASCII hex digest with the selected key.
    pub fn hash_and_sign(
        &self,
        data: &[u8],
        algorithm: &str,
        selector: &KeySelector,
    ) -> HsmResult<HashSignResult> {
        let mut record = self.draft(OperationType::HashAndSign, selector, data.len());
        record.algorithm = Some(algorithm.trim().to_string());
        self.run(record, |rec| {
            let algorithm: HashAlgorithm = algorithm.parse()?;
            rec.algorithm = Some(algorithm.as_str().to_string());
            let key = self.resolver.resolve_private(selector)?;
            let mechanism = self.signing_mechanism(&key.record);
            rec.key_label = Some(key.record.label.clone());
            let capacity = pkcs1_max_payload(key.record.key_size);
            if mechanism == Mechanism::RsaPkcs && algorithm.output_len() * 2 > capacity {
                return Err(HsmError::invalid(format!(
                    "{algorithm} hex digest exceeds the {capacity}-byte raw signing limit of a {}-bit key",
                    key.record.key_size
                )));
            }

            let (hash_time, digest) = timed(|| algorithm.hex_digest(data));
            rec.digest = Some(digest.clone());
            let (sign_time, signed) =
                timed(|| self.session.sign(key.handle, mechanism, digest.as_bytes()));
            rec.duration = hash_time + sign_time;
            let signature = hex::encode(signed?);
            rec.signature = Some(preview(&signature, self.policy.preview_chars));
            Ok(HashSignResult {
                label: key.record.label,
                algorithm,
                mechanism,
                digest,
                signature,
                hash_time,
                sign_time,
                total_time: hash_time + sign_time,
            })
        })
    }

    /// Recompute the digest of `data` and check it against the signature.
    ///
    /// When `expected_digest` (the digest returned by `hash_and_sign`) is
    /// given, a differing recomputed digest is an `IntegrityMismatch` and the
    /// device is never asked. Without it, only a recoverable mechanism can tell
    /// a tampered payload apart from a bad signature.
    pub fn verify_hash_signature(
        &self,
        data: &[u8],
        signature_hex: &str,
        algorithm: &str,
        expected_digest: Option<&str>,
        selector: &KeySelector,
    ) -> HsmResult<HashVerifyResult> {
        let mut record = self.draft(OperationType::HashVerify, selector, data.len());
        record.algorithm = Some(algorithm.trim().to_string());
        self.run(record, |rec| {
            let algorithm: HashAlgorithm = algorithm.parse()?;
            rec.algorithm = Some(algorithm.as_str().to_string());
            let key = self.resolver.resolve_public(selector)?;
            let mechanism = self.signing_mechanism(&key.record);
            rec.key_label = Some(key.record.label.clone());
            rec.signature = Some(preview(signature_hex.trim(), self.policy.preview_chars));
            let signature = decode_hex("signature", signature_hex)?;
            let expected = match expected_digest {
                Some(digest) => {
                    decode_hex("expected digest", digest)?;
                    Some(digest.trim().to_ascii_lowercase())
                }
                None => None,
            };

            let (hash_time, computed) = timed(|| algorithm.hex_digest(data));
            rec.digest = Some(computed.clone());

            let (verify_time, checked) = timed(|| match expected.as_deref() {
                Some(expected) if expected != computed => {
                    Ok((VerificationOutcome::IntegrityMismatch, None))
                }
                _ if mechanism.supports_recovery() => self
                    .session
                    .verify_recover(key.handle, mechanism, &signature)
                    .map(|recovered| match recovered {
                        None => (VerificationOutcome::SignatureInvalid, None),
                        Some(message) => {
                            let recovered = String::from_utf8_lossy(&message).into_owned();
                            if message == computed.as_bytes() {
                                (VerificationOutcome::Valid, Some(recovered))
                            } else {
                                (VerificationOutcome::IntegrityMismatch, Some(recovered))
                            }
                        }
                    }),
                _ => self
                    .session
                    .verify(key.handle, mechanism, computed.as_bytes(), &signature)
                    .map(|valid| {
                        let outcome = if valid {
                            VerificationOutcome::Valid
                        } else {
                            VerificationOutcome::SignatureInvalid
                        };
                        (outcome, None)
                    }),
            });
            rec.duration = hash_time + verify_time;
            let (outcome, recovered_digest) = checked?;
            rec.outcome = Some(outcome);
            Ok(HashVerifyResult {
                label: key.record.label,
                algorithm,
                mechanism,
                computed_digest: computed,
                recovered_digest,
                outcome,
                valid: outcome.is_valid(),
                hash_time,
                verify_time,
                total_time: hash_time + verify_time,
            })
        })
    }

    fn signing_mechanism(&self, record: &KeyRecord) -> Mechanism {
        match record.key_type {
            KeyType::Rsa if self.policy.signing_mechanism.applies_to(KeyType::Rsa) => {
                self.policy.signing_mechanism
            }
            KeyType::Rsa => Mechanism::RsaPkcs,
            KeyType::Ec => Mechanism::Ecdsa,
        }
    }

    fn require_rsa(record: &KeyRecord) -> HsmResult<()> {
        match record.key_type {
            KeyType::Rsa => Ok(()),
            other => Err(HsmError::UnsupportedAlgorithm(format!(
                "{other} keys cannot encrypt or decrypt"
            ))),
        }
    }

    fn draft(&self, operation: OperationType, selector: &KeySelector, input_size: usize) -> OperationRecord {
        let mut record = OperationRecord::new(operation);
        record.key_label = selector.label().map(str::to_string);
        record.input_size = input_size as u64;
        record
    }

    /// Execute one operation under the serial lock and append exactly one
    /// record for it, whatever the outcome.
    fn run<T>(
        &self,
        mut record: OperationRecord,
        body: impl FnOnce(&mut OperationRecord) -> HsmResult<T>,
    ) -> HsmResult<T> {
        let _serial = self.serial.lock();
        let result = body(&mut record);
        record.timestamp = OffsetDateTime::now_utc();
        match &result {
            Ok(_) => {
                record.success = true;
                debug!(
                    operation = %record.operation,
                    label = ?record.key_label,
                    elapsed_us = record.duration.as_micros() as u64,
                    "operation completed"
                );
                if record.operation != OperationType::KeyGeneration
                    && let Some(label) = record.key_label.as_deref()
                    && let Err(err) = self.registry.touch_usage(label, record.timestamp)
                {
                    warn!(label = %label, error = %err, "failed to update key usage");
                }
            }
            Err(err) => {
                record.success = false;
                record.error = Some(format!("{}: {err}", err.kind().as_str()));
                warn!(
                    operation = %record.operation,
                    label = ?record.key_label,
                    error = %err,
                    "operation failed"
                );
            }
        }
        let operation = record.operation;
        if let Err(err) = self.log.append(record) {
            warn!(operation = %operation, error = %err, "failed to append operation record");
        }
        result
    }
}
