use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{HsmError, HsmResult};

pub type KeyLabel = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyType {
    Rsa,
    Ec,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Rsa => "RSA",
            KeyType::Ec => "EC",
        }
    }

    /// Default bit size for freshly generated keys of this type.
    pub fn default_size(&self) -> u32 {
        match self {
            KeyType::Rsa => 2048,
            KeyType::Ec => 256,
        }
    }

    pub fn validate_size(&self, bits: u32) -> HsmResult<()> {
        match self {
            KeyType::Rsa if (1024..=8192).contains(&bits) && bits % 8 == 0 => Ok(()),
            KeyType::Ec if bits == 256 => Ok(()),
            KeyType::Rsa => Err(HsmError::invalid(format!(
                "RSA key size must be a multiple of 8 between 1024 and 8192, got {bits}"
            ))),
            KeyType::Ec => Err(HsmError::invalid(format!(
                "EC keys are P-256 only, got {bits} bits"
            ))),
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = HsmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RSA" => Ok(KeyType::Rsa),
            "EC" | "ECDSA" | "P256" | "P-256" => Ok(KeyType::Ec),
            other => Err(HsmError::UnsupportedAlgorithm(format!("key type {other}"))),
        }
    }
}

/// Registry entry mirroring one key pair on the device. Private material never
/// appears here; `public_info` is PEM for RSA and a hex SEC1 point for EC.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyRecord {
    pub label: KeyLabel,
    pub key_type: KeyType,
    pub key_size: u32,
    pub public_info: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_used: Option<OffsetDateTime>,
    pub usage_count: u64,
    pub active: bool,
}

impl KeyRecord {
    pub fn new(
        label: impl Into<KeyLabel>,
        key_type: KeyType,
        key_size: u32,
        public_info: impl Into<String>,
        active: bool,
    ) -> Self {
        Self {
            label: label.into(),
            key_type,
            key_size,
            public_info: public_info.into(),
            created_at: OffsetDateTime::now_utc(),
            last_used: None,
            usage_count: 0,
            active,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyFilter {
    #[default]
    All,
    Active,
}

impl KeyFilter {
    pub fn admits(&self, record: &KeyRecord) -> bool {
        match self {
            KeyFilter::All => true,
            KeyFilter::Active => record.active,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyGenerationRequest {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub key_type: Option<KeyType>,
    #[serde(default)]
    pub key_size: Option<u32>,
    #[serde(default)]
    pub active: Option<bool>,
}

impl KeyGenerationRequest {
    pub fn rsa(label: impl Into<String>, bits: u32) -> Self {
        Self {
            label: Some(label.into()),
            key_type: Some(KeyType::Rsa),
            key_size: Some(bits),
            active: None,
        }
    }

    pub fn ec(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            key_type: Some(KeyType::Ec),
            key_size: Some(256),
            active: None,
        }
    }
}

/// Result of a completed verification protocol. Negative outcomes are values,
/// not errors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VerificationOutcome {
    Valid,
    SignatureInvalid,
    IntegrityMismatch,
}

impl VerificationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, VerificationOutcome::Valid)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationOutcome::Valid => "valid",
            VerificationOutcome::SignatureInvalid => "signature_invalid",
            VerificationOutcome::IntegrityMismatch => "integrity_mismatch",
        }
    }
}

impl FromStr for VerificationOutcome {
    type Err = HsmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "valid" => Ok(VerificationOutcome::Valid),
            "signature_invalid" => Ok(VerificationOutcome::SignatureInvalid),
            "integrity_mismatch" => Ok(VerificationOutcome::IntegrityMismatch),
            other => Err(HsmError::storage(format!("unknown verification outcome {other}"))),
        }
    }
}

/// Decrypted payload. UTF-8 payloads come back as text; anything else stays
/// binary and renders as hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plaintext {
    Text(String),
    Binary(Vec<u8>),
}

impl Plaintext {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => Plaintext::Text(text),
            Err(err) => Plaintext::Binary(err.into_bytes()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Plaintext::Text(text) => text.as_bytes(),
            Plaintext::Binary(bytes) => bytes,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Plaintext::Text(_))
    }

    pub fn render(&self) -> String {
        match self {
            Plaintext::Text(text) => text.clone(),
            Plaintext::Binary(bytes) => hex::encode(bytes),
        }
    }
}

impl Serialize for Plaintext {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("Plaintext", 2)?;
        state.serialize_field("encoding", if self.is_text() { "utf8" } else { "hex" })?;
        state.serialize_field("value", &self.render())?;
        state.end()
    }
}

/// Serialises a [`Duration`] as fractional milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64() * 1000.0)
    }
}

/// Serialises a [`Duration`] as whole nanoseconds, lossless for persisted records.
pub(crate) mod nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(super::duration_to_nanos(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = u64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos))
    }
}

pub(crate) fn duration_to_nanos(value: Duration) -> u64 {
    u64::try_from(value.as_nanos()).unwrap_or(u64::MAX)
}

pub(crate) fn timestamp_to_nanos(value: OffsetDateTime) -> i64 {
    i64::try_from(value.unix_timestamp_nanos()).unwrap_or(i64::MAX)
}

pub(crate) fn timestamp_from_nanos(value: i64) -> HsmResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(value)).map_err(HsmError::storage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_type_parses_loosely() {
        assert_eq!("rsa".parse::<KeyType>().expect("rsa"), KeyType::Rsa);
        assert_eq!(" EC ".parse::<KeyType>().expect("ec"), KeyType::Ec);
        assert!(matches!(
            "AES".parse::<KeyType>(),
            Err(HsmError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn rsa_size_bounds() {
        assert!(KeyType::Rsa.validate_size(2048).is_ok());
        assert!(KeyType::Rsa.validate_size(512).is_err());
        assert!(KeyType::Rsa.validate_size(2049).is_err());
        assert!(KeyType::Ec.validate_size(384).is_err());
    }

    #[test]
    fn plaintext_falls_back_to_binary() {
        let text = Plaintext::from_bytes(b"hello".to_vec());
        assert_eq!(text, Plaintext::Text("hello".into()));

        let binary = Plaintext::from_bytes(vec![0xff, 0x00, 0xfe]);
        assert!(!binary.is_text());
        assert_eq!(binary.render(), "ff00fe");
        let json = serde_json::to_value(&binary).expect("serialize");
        assert_eq!(json["encoding"], "hex");
    }

    #[test]
    fn key_record_round_trips_through_json() {
        let record = KeyRecord::new("k1", KeyType::Rsa, 2048, "pem", true);
        let json = serde_json::to_string(&record).expect("serialize");
        let back: KeyRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.label, "k1");
        assert_eq!(back.key_type, KeyType::Rsa);
        assert!(back.last_used.is_none());
    }
}
