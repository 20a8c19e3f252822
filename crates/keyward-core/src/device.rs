//! Driver-facing abstraction over an HSM token. A driver opens authenticated
//! sessions; a session exposes the object lookup and key primitives the
//! dispatcher needs, addressed by opaque object handles.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{HsmResult, models::KeyType};

pub type SessionHandle = u64;
pub type ObjectHandle = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectClass {
    PublicKey,
    PrivateKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mechanism {
    /// Raw PKCS#1 v1.5 over caller-supplied bytes (CKM_RSA_PKCS).
    RsaPkcs,
    /// PKCS#1 v1.5 with SHA-256 computed by the token (CKM_SHA256_RSA_PKCS).
    Sha256RsaPkcs,
    /// ECDSA P-256 over the SHA-256 of the payload.
    Ecdsa,
}

impl Mechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mechanism::RsaPkcs => "RSA-PKCS",
            Mechanism::Sha256RsaPkcs => "SHA256-RSA-PKCS",
            Mechanism::Ecdsa => "ECDSA",
        }
    }

    /// Whether the signed message can be recovered from the signature.
    pub fn supports_recovery(&self) -> bool {
        matches!(self, Mechanism::RsaPkcs)
    }

    pub fn applies_to(&self, key_type: KeyType) -> bool {
        match self {
            Mechanism::RsaPkcs | Mechanism::Sha256RsaPkcs => key_type == KeyType::Rsa,
            Mechanism::Ecdsa => key_type == KeyType::Ec,
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Default)]
pub struct SessionCredentials {
    pub token_label: Option<String>,
    pub pin: String,
}

impl SessionCredentials {
    pub fn new(token_label: Option<String>, pin: impl Into<String>) -> Self {
        Self {
            token_label,
            pin: pin.into(),
        }
    }
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("token_label", &self.token_label)
            .field("pin", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct KeyPairHandles {
    pub public: ObjectHandle,
    pub private: ObjectHandle,
    pub public_info: String,
}

pub trait HsmDriver: Send + Sync {
    fn id(&self) -> &'static str;

    /// Open and log into a session on the configured token.
    fn open_session(&self, credentials: &SessionCredentials) -> HsmResult<Box<dyn DeviceSession>>;
}

pub trait DeviceSession: Send {
    fn handle(&self) -> SessionHandle;

    /// False once the token has dropped the session; the adapter reopens on the next call.
    fn is_open(&self) -> bool;

    /// Objects of `class`, optionally restricted to an exact label, in token enumeration order.
    fn find_objects(
        &mut self,
        class: ObjectClass,
        label: Option<&str>,
    ) -> HsmResult<Vec<ObjectHandle>>;

    fn label_of(&mut self, object: ObjectHandle) -> HsmResult<Option<String>>;

    fn generate_key_pair(
        &mut self,
        key_type: KeyType,
        bits: u32,
        label: &str,
    ) -> HsmResult<KeyPairHandles>;

    fn sign(&mut self, key: ObjectHandle, mechanism: Mechanism, data: &[u8]) -> HsmResult<Vec<u8>>;

    /// `Ok(false)` for a well-formed call whose signature does not verify.
    fn verify(
        &mut self,
        key: ObjectHandle,
        mechanism: Mechanism,
        data: &[u8],
        signature: &[u8],
    ) -> HsmResult<bool>;

    /// Message embedded in the signature, or `None` when it does not decode under the key.
    fn verify_recover(
        &mut self,
        key: ObjectHandle,
        mechanism: Mechanism,
        signature: &[u8],
    ) -> HsmResult<Option<Vec<u8>>>;

    fn encrypt(&mut self, key: ObjectHandle, mechanism: Mechanism, data: &[u8])
    -> HsmResult<Vec<u8>>;

    fn decrypt(
        &mut self,
        key: ObjectHandle,
        mechanism: Mechanism,
        ciphertext: &[u8],
    ) -> HsmResult<Vec<u8>>;

    fn destroy_object(&mut self, object: ObjectHandle) -> HsmResult<()>;
}

/// Strip EMSA-PKCS1-v1_5 type 1 padding (`00 01 FF.. 00 M`) from an encoded block.
pub fn unpad_pkcs1_type1(encoded: &[u8]) -> Option<Vec<u8>> {
    let rest = encoded.strip_prefix(&[0x00, 0x01])?;
    let separator = rest.iter().position(|byte| *byte != 0xff)?;
    if separator < 8 || rest[separator] != 0x00 {
        return None;
    }
    Some(rest[separator + 1..].to_vec())
}

/// Largest payload a raw PKCS#1 v1.5 operation accepts for a modulus of `bits`.
pub fn pkcs1_max_payload(bits: u32) -> usize {
    (bits as usize / 8).saturating_sub(11)
}
