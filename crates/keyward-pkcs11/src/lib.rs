//! PKCS#11 driver for keyward.
//!
//! Loads a vendor module through `cryptoki`, selects a token by label (or by
//! slot position) and exposes each logged-in session as a
//! [`keyward_core::DeviceSession`]. Object handles handed to keyward are
//! session-local ids mapped onto the token's own handles.

pub mod mechanism;

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use cryptoki::{
    context::{CInitializeArgs, Pkcs11},
    mechanism::Mechanism as CkMechanism,
    object::{
        Attribute, AttributeType, KeyType as CkKeyType, ObjectClass as CkObjectClass,
        ObjectHandle as CkObjectHandle,
    },
    session::{Session, UserType},
    slot::Slot,
    types::{AuthPin, Ulong},
};
use keyward_core::{
    DeviceConfig, DeviceSession, HsmDriver, HsmError, HsmResult, KeyPairHandles, KeyType,
    Mechanism, ObjectClass, ObjectHandle, SessionCredentials, SessionHandle,
    device::unpad_pkcs1_type1,
};
use parking_lot::Mutex;
use rsa::{
    BigUint, RsaPublicKey,
    pkcs8::{EncodePublicKey, LineEnding},
};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::mechanism::{
    RSA_PUBLIC_EXPONENT, SECP256R1_PARAMS, is_bad_pin, is_device_loss, is_signature_rejection,
    keygen_error, object_class, operation_error, return_value, signing_mechanism,
    unwrap_ec_point,
};

pub struct Pkcs11Driver {
    library_path: PathBuf,
    slot_index: usize,
    context: Mutex<Option<Pkcs11>>,
    next_session: AtomicU64,
}

impl Pkcs11Driver {
    pub fn new<P: AsRef<Path>>(library_path: P, slot_index: usize) -> Self {
        Self {
            library_path: library_path.as_ref().to_path_buf(),
            slot_index,
            context: Mutex::new(None),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &DeviceConfig) -> HsmResult<Self> {
        let path = config
            .library_path
            .as_ref()
            .ok_or_else(|| HsmError::config("device.library_path is required for PKCS#11"))?;
        Ok(Self::new(path, config.slot_index))
    }

    /// Load and initialise the module once; later sessions share the context.
    fn context(&self) -> HsmResult<Pkcs11> {
        let mut guard = self.context.lock();
        if let Some(context) = guard.as_ref() {
            return Ok(context.clone());
        }
        let context = Pkcs11::new(&self.library_path).map_err(|err| {
            HsmError::device(format!(
                "failed to load {}: {err}",
                self.library_path.display()
            ))
        })?;
        context
            .initialize(CInitializeArgs::OsThreads)
            .map_err(HsmError::device)?;
        info!(library = %self.library_path.display(), "PKCS#11 module initialised");
        *guard = Some(context.clone());
        Ok(context)
    }

    fn select_slot(&self, context: &Pkcs11, token_label: Option<&str>) -> HsmResult<Slot> {
        let slots = context.get_slots_with_token().map_err(HsmError::device)?;
        match token_label {
            Some(wanted) => {
                for slot in slots {
                    let info = context.get_token_info(slot).map_err(HsmError::device)?;
                    if info.label().trim() == wanted {
                        return Ok(slot);
                    }
                }
                Err(HsmError::device(format!("no token labelled {wanted}")))
            }
            None => slots
                .get(self.slot_index)
                .copied()
                .ok_or_else(|| HsmError::device(format!("no token in slot {}", self.slot_index))),
        }
    }
}

impl HsmDriver for Pkcs11Driver {
    fn id(&self) -> &'static str {
        "pkcs11"
    }

    fn open_session(&self, credentials: &SessionCredentials) -> HsmResult<Box<dyn DeviceSession>> {
        let context = self.context()?;
        let slot = self.select_slot(&context, credentials.token_label.as_deref())?;
        let session = context.open_rw_session(slot).map_err(HsmError::device)?;

        if let Err(err) = session.login(UserType::User, Some(&AuthPin::new(credentials.pin.clone()))) {
            match return_value(&err) {
                Some(rv) if is_bad_pin(rv) => {
                    return Err(HsmError::AuthenticationFailed(err.to_string()));
                }
                Some(cryptoki::error::RvError::UserAlreadyLoggedIn) => {}
                _ => return Err(HsmError::device(err)),
            }
        }

        let handle = self.next_session.fetch_add(1, Ordering::Relaxed);
        info!(session = handle, slot = ?slot, "PKCS#11 session opened");
        Ok(Box::new(Pkcs11Session {
            session,
            handle,
            objects: HashMap::new(),
            ids: HashMap::new(),
            next_object: 1,
        }))
    }
}

struct Pkcs11Session {
    session: Session,
    handle: SessionHandle,
    objects: HashMap<ObjectHandle, CkObjectHandle>,
    ids: HashMap<CkObjectHandle, ObjectHandle>,
    next_object: ObjectHandle,
}

impl Pkcs11Session {
    fn register(&mut self, object: CkObjectHandle) -> ObjectHandle {
        if let Some(id) = self.ids.get(&object) {
            return *id;
        }
        let id = self.next_object;
        self.next_object += 1;
        self.objects.insert(id, object);
        self.ids.insert(object, id);
        id
    }

    fn object(&self, id: ObjectHandle) -> HsmResult<CkObjectHandle> {
        self.objects
            .get(&id)
            .copied()
            .ok_or_else(|| HsmError::crypto(format!("object handle {id} invalid")))
    }

    fn public_info(&self, key_type: KeyType, public: CkObjectHandle) -> HsmResult<String> {
        match key_type {
            KeyType::Rsa => {
                let attributes = self
                    .session
                    .get_attributes(public, &[AttributeType::Modulus, AttributeType::PublicExponent])
                    .map_err(keygen_error)?;
                let mut modulus = None;
                let mut exponent = None;
                for attribute in attributes {
                    match attribute {
                        Attribute::Modulus(n) => modulus = Some(n),
                        Attribute::PublicExponent(e) => exponent = Some(e),
                        _ => {}
                    }
                }
                let (Some(n), Some(e)) = (modulus, exponent) else {
                    return Err(HsmError::keygen("token did not return the RSA public key"));
                };
                RsaPublicKey::new(BigUint::from_bytes_be(&n), BigUint::from_bytes_be(&e))
                    .map_err(HsmError::keygen)?
                    .to_public_key_pem(LineEnding::LF)
                    .map_err(HsmError::keygen)
            }
            KeyType::Ec => {
                let attributes = self
                    .session
                    .get_attributes(public, &[AttributeType::EcPoint])
                    .map_err(keygen_error)?;
                attributes
                    .into_iter()
                    .find_map(|attribute| match attribute {
                        Attribute::EcPoint(raw) => Some(hex::encode(unwrap_ec_point(&raw))),
                        _ => None,
                    })
                    .ok_or_else(|| HsmError::keygen("token did not return the EC point"))
            }
        }
    }

    fn message_for(mechanism: Mechanism, data: &[u8]) -> Vec<u8> {
        match mechanism {
            Mechanism::Ecdsa => Sha256::digest(data).to_vec(),
            _ => data.to_vec(),
        }
    }
}

impl DeviceSession for Pkcs11Session {
    fn handle(&self) -> SessionHandle {
        self.handle
    }

    fn is_open(&self) -> bool {
        self.session.get_session_info().is_ok()
    }

    fn find_objects(
        &mut self,
        class: ObjectClass,
        label: Option<&str>,
    ) -> HsmResult<Vec<ObjectHandle>> {
        let mut template = vec![Attribute::Class(object_class(class))];
        if let Some(label) = label {
            template.push(Attribute::Label(label.as_bytes().to_vec()));
        }
        let found = self
            .session
            .find_objects(&template)
            .map_err(operation_error)?;
        Ok(found.into_iter().map(|object| self.register(object)).collect())
    }

    fn label_of(&mut self, object: ObjectHandle) -> HsmResult<Option<String>> {
        let target = self.object(object)?;
        let attributes = self
            .session
            .get_attributes(target, &[AttributeType::Label])
            .map_err(operation_error)?;
        Ok(attributes.into_iter().find_map(|attribute| match attribute {
            Attribute::Label(bytes) => String::from_utf8(bytes).ok(),
            _ => None,
        }))
    }

    fn generate_key_pair(
        &mut self,
        key_type: KeyType,
        bits: u32,
        label: &str,
    ) -> HsmResult<KeyPairHandles> {
        let label_bytes = label.as_bytes().to_vec();
        let (mechanism, mut public_template, mut private_template) = match key_type {
            KeyType::Rsa => (
                CkMechanism::RsaPkcsKeyPairGen,
                vec![
                    Attribute::KeyType(CkKeyType::RSA),
                    Attribute::Encrypt(true),
                    Attribute::ModulusBits(Ulong::from(u64::from(bits))),
                    Attribute::PublicExponent(RSA_PUBLIC_EXPONENT.to_vec()),
                ],
                vec![Attribute::KeyType(CkKeyType::RSA), Attribute::Decrypt(true)],
            ),
            KeyType::Ec => (
                CkMechanism::EccKeyPairGen,
                vec![
                    Attribute::KeyType(CkKeyType::EC),
                    Attribute::EcParams(SECP256R1_PARAMS.to_vec()),
                ],
                vec![Attribute::KeyType(CkKeyType::EC)],
            ),
        };
        public_template.extend([
            Attribute::Class(CkObjectClass::PUBLIC_KEY),
            Attribute::Token(true),
            Attribute::Verify(true),
            Attribute::Label(label_bytes.clone()),
        ]);
        private_template.extend([
            Attribute::Class(CkObjectClass::PRIVATE_KEY),
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sensitive(true),
            Attribute::Sign(true),
            Attribute::Label(label_bytes),
        ]);

        let (public, private) = self
            .session
            .generate_key_pair(&mechanism, &public_template, &private_template)
            .map_err(keygen_error)?;
        let public_info = self.public_info(key_type, public)?;
        debug!(label, %key_type, bits, "key pair generated on token");
        Ok(KeyPairHandles {
            public: self.register(public),
            private: self.register(private),
            public_info,
        })
    }

    fn sign(&mut self, key: ObjectHandle, mechanism: Mechanism, data: &[u8]) -> HsmResult<Vec<u8>> {
        let target = self.object(key)?;
        self.session
            .sign(
                &signing_mechanism(mechanism),
                target,
                &Self::message_for(mechanism, data),
            )
            .map_err(operation_error)
    }

    fn verify(
        &mut self,
        key: ObjectHandle,
        mechanism: Mechanism,
        data: &[u8],
        signature: &[u8],
    ) -> HsmResult<bool> {
        let target = self.object(key)?;
        match self.session.verify(
            &signing_mechanism(mechanism),
            target,
            &Self::message_for(mechanism, data),
            signature,
        ) {
            Ok(()) => Ok(true),
            Err(err) if return_value(&err).is_some_and(is_signature_rejection) => Ok(false),
            Err(err) => Err(operation_error(err)),
        }
    }

    /// Raw public-key RSA over the signature, then PKCS#1 type 1 unpadding.
    fn verify_recover(
        &mut self,
        key: ObjectHandle,
        mechanism: Mechanism,
        signature: &[u8],
    ) -> HsmResult<Option<Vec<u8>>> {
        if !mechanism.supports_recovery() {
            return Err(HsmError::crypto(format!(
                "mechanism {mechanism} does not support recovery"
            )));
        }
        let target = self.object(key)?;
        match self.session.encrypt(&CkMechanism::RsaX509, target, signature) {
            Ok(encoded) => Ok(unpad_pkcs1_type1(&encoded)),
            Err(err) => match return_value(&err) {
                Some(rv) if is_device_loss(rv) => Err(operation_error(err)),
                Some(_) => {
                    debug!(error = %err, "signature recovery rejected by token");
                    Ok(None)
                }
                None => Err(operation_error(err)),
            },
        }
    }

    fn encrypt(&mut self, key: ObjectHandle, mechanism: Mechanism, data: &[u8]) -> HsmResult<Vec<u8>> {
        if mechanism != Mechanism::RsaPkcs {
            return Err(HsmError::crypto(format!("mechanism {mechanism} cannot encrypt")));
        }
        let target = self.object(key)?;
        self.session
            .encrypt(&CkMechanism::RsaPkcs, target, data)
            .map_err(operation_error)
    }

    fn decrypt(
        &mut self,
        key: ObjectHandle,
        mechanism: Mechanism,
        ciphertext: &[u8],
    ) -> HsmResult<Vec<u8>> {
        if mechanism != Mechanism::RsaPkcs {
            return Err(HsmError::crypto(format!("mechanism {mechanism} cannot decrypt")));
        }
        let target = self.object(key)?;
        self.session
            .decrypt(&CkMechanism::RsaPkcs, target, ciphertext)
            .map_err(operation_error)
    }

    fn destroy_object(&mut self, object: ObjectHandle) -> HsmResult<()> {
        let target = self.object(object)?;
        self.session
            .destroy_object(target)
            .map_err(operation_error)?;
        self.objects.remove(&object);
        self.ids.remove(&target);
        Ok(())
    }
}
