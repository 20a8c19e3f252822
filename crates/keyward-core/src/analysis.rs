//! Read-only aggregation over the operation log.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use p256::ecdsa::{Signature as EcSignature, SigningKey as EcSigningKey, signature::Signer};
use rand::rngs::OsRng;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{
    device::Mechanism,
    dispatcher::CryptoDispatcher,
    error::{HsmError, HsmResult},
    models::{KeyFilter, KeyType, millis},
    oplog::{OperationLog, OperationQuery, OperationRecord, OperationType},
    registry::KeyRegistry,
    resolver::KeySelector,
};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UsageSummary {
    pub total_keys: usize,
    pub active_keys: usize,
    pub total_operations: usize,
    pub successful_operations: usize,
    /// Fraction of successful operations; `None` when nothing has run yet.
    pub success_rate: Option<f64>,
    #[serde(rename = "avg_processing_time_ms", with = "millis")]
    pub mean_duration: Duration,
}

/// One device signature timed against the same signature computed in process
/// with a fresh key of the same type and size.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceComparison {
    pub label: String,
    pub mechanism: Mechanism,
    pub input_size: usize,
    #[serde(rename = "device_time_ms", with = "millis")]
    pub device_time: Duration,
    #[serde(rename = "software_time_ms", with = "millis")]
    pub software_time: Duration,
    /// `device_time / software_time`; `None` if the software side measured zero.
    pub overhead_factor: Option<f64>,
}

/// Exact mean of the given durations; zero for an empty set.
pub fn mean_of<'a>(durations: impl IntoIterator<Item = &'a Duration>) -> Duration {
    let (total, count) = durations
        .into_iter()
        .fold((0u128, 0u128), |(total, count), d| (total + d.as_nanos(), count + 1));
    if count == 0 {
        return Duration::ZERO;
    }
    let mean = total / count;
    Duration::from_nanos(u64::try_from(mean).unwrap_or(u64::MAX))
}

pub struct Analyzer<L: OperationLog + ?Sized> {
    log: Arc<L>,
}

impl<L: OperationLog + ?Sized> Analyzer<L> {
    pub fn new(log: Arc<L>) -> Self {
        Self { log }
    }

    /// Mean duration of the successful records of `operation`. Failed records
    /// carry no primitive timing and are left out.
    pub fn mean_duration(&self, operation: OperationType) -> HsmResult<Duration> {
        let records = self.log.query(&OperationQuery::operation(operation))?;
        Ok(mean_of(records.iter().filter(|r| r.success).map(|r| &r.duration)))
    }

    /// Mean duration of successful `operation` records per algorithm. Records
    /// without an algorithm are grouped under `"unknown"`.
    pub fn mean_duration_by_algorithm(
        &self,
        operation: OperationType,
    ) -> HsmResult<BTreeMap<String, Duration>> {
        let records = self.log.query(&OperationQuery::operation(operation))?;
        let mut groups: BTreeMap<String, Vec<Duration>> = BTreeMap::new();
        for record in records.into_iter().filter(|r| r.success) {
            let algorithm = record.algorithm.unwrap_or_else(|| "unknown".to_string());
            groups.entry(algorithm).or_default().push(record.duration);
        }
        Ok(groups
            .into_iter()
            .map(|(algorithm, durations)| (algorithm, mean_of(&durations)))
            .collect())
    }

    pub fn usage_summary<R: KeyRegistry + ?Sized>(&self, registry: &R) -> HsmResult<UsageSummary> {
        let keys = registry.list(KeyFilter::All)?;
        let active_keys = keys.iter().filter(|k| k.active).count();
        let records = self.log.query(&OperationQuery::default())?;
        let successful = records.iter().filter(|r| r.success).count();
        let success_rate = if records.is_empty() {
            None
        } else {
            Some(successful as f64 / records.len() as f64)
        };
        Ok(UsageSummary {
            total_keys: keys.len(),
            active_keys,
            total_operations: records.len(),
            successful_operations: successful,
            success_rate,
            mean_duration: mean_of(records.iter().filter(|r| r.success).map(|r| &r.duration)),
        })
    }

    /// Latest operations that referenced `label`, newest first.
    pub fn key_operations(&self, label: &str, limit: usize) -> HsmResult<Vec<OperationRecord>> {
        self.log.query(&OperationQuery::key(label).with_limit(limit))
    }
}

/// Sign `payload` through the dispatcher, then sign it again in process with
/// a throwaway key matching the selected key's type, size and mechanism.
/// Software key generation is not part of the measurement.
pub fn compare_device_vs_software<R, L>(
    dispatcher: &CryptoDispatcher<R, L>,
    payload: &[u8],
    selector: &KeySelector,
) -> HsmResult<DeviceComparison>
where
    R: KeyRegistry + ?Sized,
    L: OperationLog + ?Sized,
{
    let signed = dispatcher.sign(payload, selector)?;
    let record = dispatcher.key(&signed.label)?;

    let software_time = match record.key_type {
        KeyType::Rsa => {
            let key = RsaPrivateKey::new(&mut OsRng, record.key_size as usize)
                .map_err(HsmError::crypto)?;
            let started = Instant::now();
            let signature = match signed.mechanism {
                Mechanism::Sha256RsaPkcs => {
                    key.sign(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(payload))
                }
                _ => key.sign(Pkcs1v15Sign::new_unprefixed(), payload),
            };
            let elapsed = started.elapsed();
            signature.map_err(HsmError::crypto)?;
            elapsed
        }
        KeyType::Ec => {
            let key = EcSigningKey::random(&mut OsRng);
            let started = Instant::now();
            let _signature: EcSignature = key.sign(payload);
            started.elapsed()
        }
    };

    let overhead_factor = (!software_time.is_zero())
        .then(|| signed.processing_time.as_secs_f64() / software_time.as_secs_f64());
    debug!(
        label = %signed.label,
        mechanism = %signed.mechanism,
        device_us = signed.processing_time.as_micros() as u64,
        software_us = software_time.as_micros() as u64,
        "device signing compared with software"
    );
    Ok(DeviceComparison {
        label: signed.label,
        mechanism: signed.mechanism,
        input_size: payload.len(),
        device_time: signed.processing_time,
        software_time,
        overhead_factor,
    })
}
