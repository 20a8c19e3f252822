//! In-process software token. Simulates a PKCS#11 device with real RSA and
//! P-256 keys so the dispatcher can run without hardware.

use std::{collections::BTreeMap, sync::Arc};

use p256::ecdsa::{
    Signature as EcSignature, SigningKey as EcSigningKey, VerifyingKey as EcVerifyingKey,
    signature::{Signer, Verifier},
};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rsa::{
    BigUint, Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey,
    pkcs8::{EncodePublicKey, LineEnding},
    traits::PublicKeyParts,
};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{
    HsmError, HsmResult,
    device::{
        DeviceSession, HsmDriver, KeyPairHandles, Mechanism, ObjectClass, ObjectHandle,
        SessionCredentials, SessionHandle, unpad_pkcs1_type1,
    },
    models::KeyType,
};

pub const DEFAULT_TOKEN_LABEL: &str = "keyward-soft";

enum Material {
    RsaPrivate(Box<RsaPrivateKey>),
    RsaPublic(RsaPublicKey),
    EcPrivate(EcSigningKey),
    EcPublic(EcVerifyingKey),
}

struct SoftObject {
    class: ObjectClass,
    label: String,
    material: Material,
}

struct SoftToken {
    label: String,
    pin: String,
    available: bool,
    epoch: u64,
    next_session: SessionHandle,
    next_object: ObjectHandle,
    objects: BTreeMap<ObjectHandle, SoftObject>,
    injected_failure: Option<String>,
}

impl SoftToken {
    fn ensure_live(&self, epoch: u64) -> HsmResult<()> {
        if !self.available {
            return Err(HsmError::device("token removed"));
        }
        if self.epoch != epoch {
            return Err(HsmError::device("session handle invalid"));
        }
        Ok(())
    }

    fn take_failure(&mut self) -> HsmResult<()> {
        match self.injected_failure.take() {
            Some(message) => Err(HsmError::crypto(message)),
            None => Ok(()),
        }
    }

    fn object(&self, handle: ObjectHandle) -> HsmResult<&SoftObject> {
        self.objects
            .get(&handle)
            .ok_or_else(|| HsmError::crypto(format!("object handle {handle} invalid")))
    }

    fn insert(&mut self, class: ObjectClass, label: &str, material: Material) -> ObjectHandle {
        let handle = self.next_object;
        self.next_object += 1;
        self.objects.insert(
            handle,
            SoftObject {
                class,
                label: label.to_string(),
                material,
            },
        );
        handle
    }
}

/// Software token driver. Clones share the same token state.
#[derive(Clone)]
pub struct SoftHsm {
    token: Arc<Mutex<SoftToken>>,
}

impl SoftHsm {
    pub fn new(token_label: impl Into<String>, pin: impl Into<String>) -> Self {
        Self {
            token: Arc::new(Mutex::new(SoftToken {
                label: token_label.into(),
                pin: pin.into(),
                available: true,
                epoch: 1,
                next_session: 1,
                next_object: 1,
                objects: BTreeMap::new(),
                injected_failure: None,
            })),
        }
    }

    /// Simulate token removal or reinsertion.
    pub fn set_available(&self, available: bool) {
        self.token.lock().available = available;
    }

    /// Drop every open session, as a token reset would.
    pub fn invalidate_sessions(&self) {
        self.token.lock().epoch += 1;
    }

    /// Fail the next cryptographic primitive with the given device message.
    pub fn inject_failure(&self, message: impl Into<String>) {
        self.token.lock().injected_failure = Some(message.into());
    }

    pub fn object_count(&self) -> usize {
        self.token.lock().objects.len()
    }
}

impl HsmDriver for SoftHsm {
    fn id(&self) -> &'static str {
        "soft-hsm"
    }

    fn open_session(&self, credentials: &SessionCredentials) -> HsmResult<Box<dyn DeviceSession>> {
        let mut token = self.token.lock();
        if !token.available {
            return Err(HsmError::device("token not present"));
        }
        if let Some(label) = credentials.token_label.as_deref()
            && label != token.label
        {
            return Err(HsmError::device(format!("no token labelled {label}")));
        }
        if credentials.pin != token.pin {
            return Err(HsmError::AuthenticationFailed("PIN incorrect".into()));
        }
        let handle = token.next_session;
        token.next_session += 1;
        debug!(session = handle, "soft token session opened");
        Ok(Box::new(SoftSession {
            handle,
            epoch: token.epoch,
            token: Arc::clone(&self.token),
        }))
    }
}

struct SoftSession {
    handle: SessionHandle,
    epoch: u64,
    token: Arc<Mutex<SoftToken>>,
}

impl SoftSession {
    fn with_token<T>(&self, f: impl FnOnce(&mut SoftToken) -> HsmResult<T>) -> HsmResult<T> {
        let mut token = self.token.lock();
        token.ensure_live(self.epoch)?;
        f(&mut token)
    }
}

fn mechanism_mismatch(mechanism: Mechanism) -> HsmError {
    HsmError::crypto(format!("mechanism {mechanism} invalid for key"))
}

fn rsa_sign(key: &RsaPrivateKey, mechanism: Mechanism, data: &[u8]) -> HsmResult<Vec<u8>> {
    match mechanism {
        Mechanism::RsaPkcs => key
            .sign(Pkcs1v15Sign::new_unprefixed(), data)
            .map_err(HsmError::crypto),
        Mechanism::Sha256RsaPkcs => key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(data))
            .map_err(HsmError::crypto),
        Mechanism::Ecdsa => Err(mechanism_mismatch(mechanism)),
    }
}

fn rsa_verify(
    key: &RsaPublicKey,
    mechanism: Mechanism,
    data: &[u8],
    signature: &[u8],
) -> HsmResult<bool> {
    let outcome = match mechanism {
        Mechanism::RsaPkcs => key.verify(Pkcs1v15Sign::new_unprefixed(), data, signature),
        Mechanism::Sha256RsaPkcs => key.verify(
            Pkcs1v15Sign::new::<Sha256>(),
            &Sha256::digest(data),
            signature,
        ),
        Mechanism::Ecdsa => return Err(mechanism_mismatch(mechanism)),
    };
    Ok(outcome.is_ok())
}

fn rsa_recover(key: &RsaPublicKey, signature: &[u8]) -> Option<Vec<u8>> {
    let size = key.size();
    if signature.len() != size {
        return None;
    }
    let s = BigUint::from_bytes_be(signature);
    if &s >= key.n() {
        return None;
    }
    let m = s.modpow(key.e(), key.n()).to_bytes_be();
    let mut encoded = vec![0u8; size.saturating_sub(m.len())];
    encoded.extend_from_slice(&m);
    unpad_pkcs1_type1(&encoded)
}

impl DeviceSession for SoftSession {
    fn handle(&self) -> SessionHandle {
        self.handle
    }

    fn is_open(&self) -> bool {
        self.token.lock().ensure_live(self.epoch).is_ok()
    }

    fn find_objects(
        &mut self,
        class: ObjectClass,
        label: Option<&str>,
    ) -> HsmResult<Vec<ObjectHandle>> {
        self.with_token(|token| {
            Ok(token
                .objects
                .iter()
                .filter(|(_, object)| object.class == class)
                .filter(|(_, object)| label.is_none_or(|wanted| object.label == wanted))
                .map(|(handle, _)| *handle)
                .collect())
        })
    }

    fn label_of(&mut self, object: ObjectHandle) -> HsmResult<Option<String>> {
        self.with_token(|token| Ok(token.objects.get(&object).map(|o| o.label.clone())))
    }

    fn generate_key_pair(
        &mut self,
        key_type: KeyType,
        bits: u32,
        label: &str,
    ) -> HsmResult<KeyPairHandles> {
        self.with_token(|token| {
            if let Some(message) = token.injected_failure.take() {
                return Err(HsmError::keygen(message));
            }
            let (private, public, public_info) = match key_type {
                KeyType::Rsa => {
                    let private = RsaPrivateKey::new(&mut OsRng, bits as usize)
                        .map_err(HsmError::keygen)?;
                    let public = private.to_public_key();
                    let pem = public
                        .to_public_key_pem(LineEnding::LF)
                        .map_err(HsmError::keygen)?;
                    (
                        Material::RsaPrivate(Box::new(private)),
                        Material::RsaPublic(public),
                        pem,
                    )
                }
                KeyType::Ec => {
                    if bits != 256 {
                        return Err(HsmError::keygen(format!("unsupported EC size {bits}")));
                    }
                    let signing = EcSigningKey::random(&mut OsRng);
                    let verifying = EcVerifyingKey::from(&signing);
                    let point = hex::encode(verifying.to_encoded_point(false).as_bytes());
                    (
                        Material::EcPrivate(signing),
                        Material::EcPublic(verifying),
                        point,
                    )
                }
            };
            let public = token.insert(ObjectClass::PublicKey, label, public);
            let private = token.insert(ObjectClass::PrivateKey, label, private);
            Ok(KeyPairHandles {
                public,
                private,
                public_info,
            })
        })
    }

    fn sign(&mut self, key: ObjectHandle, mechanism: Mechanism, data: &[u8]) -> HsmResult<Vec<u8>> {
        self.with_token(|token| {
            token.take_failure()?;
            match &token.object(key)?.material {
                Material::RsaPrivate(private) => rsa_sign(private, mechanism, data),
                Material::EcPrivate(signing) if mechanism == Mechanism::Ecdsa => {
                    let signature: EcSignature = signing.sign(data);
                    Ok(signature.to_bytes().to_vec())
                }
                Material::EcPrivate(_) => Err(mechanism_mismatch(mechanism)),
                _ => Err(HsmError::crypto("key function not permitted: sign")),
            }
        })
    }

    fn verify(
        &mut self,
        key: ObjectHandle,
        mechanism: Mechanism,
        data: &[u8],
        signature: &[u8],
    ) -> HsmResult<bool> {
        self.with_token(|token| {
            token.take_failure()?;
            match &token.object(key)?.material {
                Material::RsaPublic(public) => rsa_verify(public, mechanism, data, signature),
                Material::EcPublic(verifying) if mechanism == Mechanism::Ecdsa => {
                    Ok(EcSignature::from_slice(signature)
                        .map(|sig| verifying.verify(data, &sig).is_ok())
                        .unwrap_or(false))
                }
                Material::EcPublic(_) => Err(mechanism_mismatch(mechanism)),
                _ => Err(HsmError::crypto("key function not permitted: verify")),
            }
        })
    }

    fn verify_recover(
        &mut self,
        key: ObjectHandle,
        mechanism: Mechanism,
        signature: &[u8],
    ) -> HsmResult<Option<Vec<u8>>> {
        self.with_token(|token| {
            token.take_failure()?;
            match (&token.object(key)?.material, mechanism) {
                (Material::RsaPublic(public), Mechanism::RsaPkcs) => {
                    Ok(rsa_recover(public, signature))
                }
                _ => Err(mechanism_mismatch(mechanism)),
            }
        })
    }

    fn encrypt(
        &mut self,
        key: ObjectHandle,
        mechanism: Mechanism,
        data: &[u8],
    ) -> HsmResult<Vec<u8>> {
        self.with_token(|token| {
            token.take_failure()?;
            match (&token.object(key)?.material, mechanism) {
                (Material::RsaPublic(public), Mechanism::RsaPkcs) => public
                    .encrypt(&mut OsRng, Pkcs1v15Encrypt, data)
                    .map_err(HsmError::crypto),
                _ => Err(mechanism_mismatch(mechanism)),
            }
        })
    }

    fn decrypt(
        &mut self,
        key: ObjectHandle,
        mechanism: Mechanism,
        ciphertext: &[u8],
    ) -> HsmResult<Vec<u8>> {
        self.with_token(|token| {
            token.take_failure()?;
            match (&token.object(key)?.material, mechanism) {
                (Material::RsaPrivate(private), Mechanism::RsaPkcs) => private
                    .decrypt(Pkcs1v15Encrypt, ciphertext)
                    .map_err(HsmError::crypto),
                _ => Err(mechanism_mismatch(mechanism)),
            }
        })
    }

    fn destroy_object(&mut self, object: ObjectHandle) -> HsmResult<()> {
        self.with_token(|token| {
            token
                .objects
                .remove(&object)
                .map(|_| ())
                .ok_or_else(|| HsmError::crypto(format!("object handle {object} invalid")))
        })
    }
}
