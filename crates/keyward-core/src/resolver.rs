use std::sync::Arc;

use tracing::debug;

use crate::{
    device::{ObjectClass, ObjectHandle},
    error::{HsmError, HsmResult},
    models::KeyRecord,
    registry::KeyRegistry,
    session::SessionAdapter,
};

/// Which key an operation targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelector {
    Named(String),
    /// The registry's most recently created key.
    MostRecent,
}

impl KeySelector {
    pub fn named(label: impl Into<String>) -> Self {
        KeySelector::Named(label.into())
    }

    /// A missing or blank label selects the most recent key.
    pub fn from_label(label: Option<&str>) -> Self {
        match label.map(str::trim) {
            Some(label) if !label.is_empty() => KeySelector::Named(label.to_string()),
            _ => KeySelector::MostRecent,
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            KeySelector::Named(label) => Some(label),
            KeySelector::MostRecent => None,
        }
    }
}

impl From<&str> for KeySelector {
    fn from(label: &str) -> Self {
        KeySelector::from_label(Some(label))
    }
}

impl From<Option<&str>> for KeySelector {
    fn from(label: Option<&str>) -> Self {
        KeySelector::from_label(label)
    }
}

/// A device object paired with the registry record that cleared the active gate.
#[derive(Debug, Clone)]
pub struct ResolvedKey {
    pub handle: ObjectHandle,
    pub record: KeyRecord,
}

impl ResolvedKey {
    pub fn label(&self) -> &str {
        &self.record.label
    }
}

pub struct KeyResolver<R: KeyRegistry + ?Sized> {
    registry: Arc<R>,
    session: Arc<SessionAdapter>,
}

impl<R: KeyRegistry + ?Sized> KeyResolver<R> {
    pub fn new(registry: Arc<R>, session: Arc<SessionAdapter>) -> Self {
        Self { registry, session }
    }

    pub fn resolve_private(&self, selector: &KeySelector) -> HsmResult<ResolvedKey> {
        self.resolve(selector, ObjectClass::PrivateKey)
    }

    pub fn resolve_public(&self, selector: &KeySelector) -> HsmResult<ResolvedKey> {
        self.resolve(selector, ObjectClass::PublicKey)
    }

    fn resolve(&self, selector: &KeySelector, class: ObjectClass) -> HsmResult<ResolvedKey> {
        let (label, record) = match selector {
            KeySelector::Named(label) => (label.clone(), None),
            KeySelector::MostRecent => {
                let record = self
                    .registry
                    .most_recent()?
                    .ok_or_else(|| HsmError::KeyNotFound("no keys registered".into()))?;
                (record.label.clone(), Some(record))
            }
        };

        let handle = self
            .session
            .find_objects(class, Some(&label))?
            .into_iter()
            .next()
            .ok_or_else(|| HsmError::KeyNotFound(label.clone()))?;

        let record = match record {
            Some(record) => Some(record),
            None => self.registry.get(&label)?,
        };
        match record {
            Some(record) if record.active => {
                debug!(label = %label, handle, ?class, "key resolved");
                Ok(ResolvedKey { handle, record })
            }
            _ => Err(HsmError::KeyInactive(label)),
        }
    }
}
