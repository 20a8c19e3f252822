use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::{HsmError, HsmResult},
    device::{
        DeviceSession, HsmDriver, KeyPairHandles, Mechanism, ObjectClass, ObjectHandle,
        SessionCredentials, SessionHandle,
    },
    models::KeyType,
};

/// Owns the single device session for a dispatcher. The session is opened
/// lazily and reopened after the token reports it closed or unreachable.
pub struct SessionAdapter {
    driver: Arc<dyn HsmDriver>,
    credentials: SessionCredentials,
    session: Mutex<Option<Box<dyn DeviceSession>>>,
}

impl SessionAdapter {
    pub fn new(driver: Arc<dyn HsmDriver>, credentials: SessionCredentials) -> Self {
        Self {
            driver,
            credentials,
            session: Mutex::new(None),
        }
    }

    pub fn driver_id(&self) -> &'static str {
        self.driver.id()
    }

    /// Return the live session handle, opening a session if none is usable.
    pub fn ensure_session(&self) -> HsmResult<SessionHandle> {
        self.with_session(|session| Ok(session.handle()))
    }

    pub fn is_open(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|session| session.is_open())
    }

    pub fn close(&self) {
        if let Some(session) = self.session.lock().take() {
            debug!(session = session.handle(), "device session closed");
        }
    }

    /// Run `f` against the live session. A `DeviceUnavailable` failure drops the
    /// session so the next call starts from a fresh login.
    pub fn with_session<T>(
        &self,
        f: impl FnOnce(&mut dyn DeviceSession) -> HsmResult<T>,
    ) -> HsmResult<T> {
        let mut guard = self.session.lock();
        if guard.as_ref().is_some_and(|session| !session.is_open()) {
            warn!("device session no longer valid; reopening");
            *guard = None;
        }
        if guard.is_none() {
            let opened = self.driver.open_session(&self.credentials)?;
            info!(
                driver = self.driver.id(),
                session = opened.handle(),
                "device session opened"
            );
            *guard = Some(opened);
        }
        let Some(session) = guard.as_mut() else {
            return Err(HsmError::device("no device session"));
        };
        let result = f(session.as_mut());
        if let Err(HsmError::DeviceUnavailable(reason)) = &result {
            warn!(reason = %reason, "device unavailable; dropping session");
            *guard = None;
        }
        result
    }

    pub fn find_objects(
        &self,
        class: ObjectClass,
        label: Option<&str>,
    ) -> HsmResult<Vec<ObjectHandle>> {
        self.with_session(|session| session.find_objects(class, label))
    }

    pub fn label_of(&self, object: ObjectHandle) -> HsmResult<Option<String>> {
        self.with_session(|session| session.label_of(object))
    }

    pub fn generate_key_pair(
        &self,
        key_type: KeyType,
        bits: u32,
        label: &str,
    ) -> HsmResult<KeyPairHandles> {
        self.with_session(|session| session.generate_key_pair(key_type, bits, label))
    }

    pub fn sign(&self, key: ObjectHandle, mechanism: Mechanism, data: &[u8]) -> HsmResult<Vec<u8>> {
        self.with_session(|session| session.sign(key, mechanism, data))
    }

    pub fn verify(
        &self,
        key: ObjectHandle,
        mechanism: Mechanism,
        data: &[u8],
        signature: &[u8],
    ) -> HsmResult<bool> {
        self.with_session(|session| session.verify(key, mechanism, data, signature))
    }

    pub fn verify_recover(
        &self,
        key: ObjectHandle,
        mechanism: Mechanism,
        signature: &[u8],
    ) -> HsmResult<Option<Vec<u8>>> {
        self.with_session(|session| session.verify_recover(key, mechanism, signature))
    }

    pub fn encrypt(
        &self,
        key: ObjectHandle,
        mechanism: Mechanism,
        data: &[u8],
    ) -> HsmResult<Vec<u8>> {
        self.with_session(|session| session.encrypt(key, mechanism, data))
    }

    pub fn decrypt(
        &self,
        key: ObjectHandle,
        mechanism: Mechanism,
        ciphertext: &[u8],
    ) -> HsmResult<Vec<u8>> {
        self.with_session(|session| session.decrypt(key, mechanism, ciphertext))
    }

    pub fn destroy_object(&self, object: ObjectHandle) -> HsmResult<()> {
        self.with_session(|session| session.destroy_object(object))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::{DEFAULT_TOKEN_LABEL, SoftHsm};

    fn adapter(hsm: &SoftHsm, pin: &str) -> SessionAdapter {
        SessionAdapter::new(
            Arc::new(hsm.clone()),
            SessionCredentials::new(Some(DEFAULT_TOKEN_LABEL.into()), pin),
        )
    }

    #[test]
    fn session_is_opened_lazily_and_reused() {
        let hsm = SoftHsm::new(DEFAULT_TOKEN_LABEL, "1234");
        let adapter = adapter(&hsm, "1234");
        assert!(!adapter.is_open());
        let first = adapter.ensure_session().expect("session");
        let second = adapter.ensure_session().expect("session");
        assert_eq!(first, second);
        assert!(adapter.is_open());
    }

    #[test]
    fn invalidated_session_is_reopened() {
        let hsm = SoftHsm::new(DEFAULT_TOKEN_LABEL, "1234");
        let adapter = adapter(&hsm, "1234");
        let first = adapter.ensure_session().expect("session");
        hsm.invalidate_sessions();
        let second = adapter.ensure_session().expect("session");
        assert_ne!(first, second);
    }

    #[test]
    fn unavailable_device_surfaces_and_recovers() {
        let hsm = SoftHsm::new(DEFAULT_TOKEN_LABEL, "1234");
        let adapter = adapter(&hsm, "1234");
        adapter.ensure_session().expect("session");
        hsm.set_available(false);
        assert!(matches!(
            adapter.find_objects(ObjectClass::PrivateKey, None),
            Err(HsmError::DeviceUnavailable(_))
        ));
        assert!(!adapter.is_open());
        hsm.set_available(true);
        assert!(
            adapter
                .find_objects(ObjectClass::PrivateKey, None)
                .expect("find")
                .is_empty()
        );
    }

    #[test]
    fn bad_pin_fails_authentication() {
        let hsm = SoftHsm::new(DEFAULT_TOKEN_LABEL, "1234");
        let adapter = adapter(&hsm, "9999");
        assert!(matches!(
            adapter.ensure_session(),
            Err(HsmError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn close_drops_session() {
        let hsm = SoftHsm::new(DEFAULT_TOKEN_LABEL, "1234");
        let adapter = adapter(&hsm, "1234");
        adapter.ensure_session().expect("session");
        adapter.close();
        assert!(!adapter.is_open());
    }
}
