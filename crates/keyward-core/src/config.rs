use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::{
    device::{Mechanism, SessionCredentials},
    error::{HsmError, HsmResult},
    models::KeyType,
    oplog::{FileOperationLog, MemoryOperationLog, OperationLog, SqliteOperationLog},
    registry::{KeyRegistry, MemoryKeyRegistry, SqliteKeyRegistry},
};

pub const ENV_LIBRARY_PATH: &str = "KEYWARD_LIBRARY_PATH";
pub const ENV_TOKEN_LABEL: &str = "KEYWARD_TOKEN_LABEL";
pub const ENV_PIN: &str = "KEYWARD_PIN";
pub const ENV_KEY_SIZE: &str = "KEYWARD_KEY_SIZE";
pub const ENV_OPERATION_LOG: &str = "KEYWARD_OPERATION_LOG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywardConfig {
    pub device: DeviceConfig,
    pub keys: KeyPolicyConfig,
    pub storage: StorageConfig,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// PKCS#11 module to load; unused by the software token.
    pub library_path: Option<PathBuf>,
    pub token_label: Option<String>,
    pub pin: String,
    /// Fallback slot when no token label is configured.
    pub slot_index: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            library_path: None,
            token_label: None,
            pin: "1234".to_string(),
            slot_index: 0,
        }
    }
}

impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("library_path", &self.library_path)
            .field("token_label", &self.token_label)
            .field("pin", &"<redacted>")
            .field("slot_index", &self.slot_index)
            .finish()
    }
}

impl DeviceConfig {
    pub fn credentials(&self) -> SessionCredentials {
        SessionCredentials::new(self.token_label.clone(), self.pin.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyPolicyConfig {
    pub default_type: KeyType,
    pub default_size: u32,
    /// Whether freshly generated keys pass the active gate immediately.
    pub activate_on_create: bool,
    /// Mechanism RSA keys sign with.
    pub signing_mechanism: Mechanism,
    /// Characters of a signature or ciphertext kept in operation records.
    pub preview_chars: usize,
}

impl Default for KeyPolicyConfig {
    fn default() -> Self {
        Self {
            default_type: KeyType::Rsa,
            default_size: 2048,
            activate_on_create: true,
            signing_mechanism: Mechanism::RsaPkcs,
            preview_chars: 64,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub registry: RegistryBackend,
    pub operation_log: OperationLogBackend,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum RegistryBackend {
    #[default]
    Memory,
    Sqlite { path: PathBuf },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum OperationLogBackend {
    #[default]
    Memory,
    File { path: PathBuf },
    Sqlite { path: PathBuf },
}

impl KeywardConfig {
    /// Load from JSON, TOML or YAML, chosen by file extension (YAML otherwise).
    pub fn from_path<P: AsRef<Path>>(path: P) -> HsmResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(HsmError::config)?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let config: KeywardConfig = match extension.as_deref() {
            Some("json") => serde_json::from_str(&contents).map_err(HsmError::config)?,
            Some("toml") => toml::from_str(&contents).map_err(HsmError::config)?,
            _ => serde_yaml::from_str(&contents).map_err(HsmError::config)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply `KEYWARD_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> HsmResult<Self> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> HsmResult<Self> {
        if let Some(path) = lookup(ENV_LIBRARY_PATH) {
            self.device.library_path = Some(PathBuf::from(path));
        }
        if let Some(label) = lookup(ENV_TOKEN_LABEL) {
            self.device.token_label = Some(label);
        }
        if let Some(pin) = lookup(ENV_PIN) {
            self.device.pin = pin;
        }
        if let Some(size) = lookup(ENV_KEY_SIZE) {
            self.keys.default_size = size
                .trim()
                .parse()
                .map_err(|_| HsmError::config(format!("{ENV_KEY_SIZE} is not a number: {size}")))?;
        }
        if let Some(path) = lookup(ENV_OPERATION_LOG) {
            self.storage.operation_log = OperationLogBackend::File {
                path: PathBuf::from(path),
            };
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> HsmResult<()> {
        self.keys
            .default_type
            .validate_size(self.keys.default_size)
            .map_err(|err| HsmError::config(format!("keys.default_size: {err}")))?;
        if self.keys.default_type == KeyType::Rsa
            && !self.keys.signing_mechanism.applies_to(KeyType::Rsa)
        {
            return Err(HsmError::config(format!(
                "keys.signing_mechanism {} cannot sign with RSA keys",
                self.keys.signing_mechanism
            )));
        }
        if self.device.pin.is_empty() {
            return Err(HsmError::config("device.pin must not be empty"));
        }
        Ok(())
    }

    pub fn open_registry(&self) -> HsmResult<Arc<dyn KeyRegistry>> {
        Ok(match &self.storage.registry {
            RegistryBackend::Memory => Arc::new(MemoryKeyRegistry::new()),
            RegistryBackend::Sqlite { path } => Arc::new(SqliteKeyRegistry::new(path)?),
        })
    }

    pub fn open_operation_log(&self) -> HsmResult<Arc<dyn OperationLog>> {
        Ok(match &self.storage.operation_log {
            OperationLogBackend::Memory => Arc::new(MemoryOperationLog::new()),
            OperationLogBackend::File { path } => Arc::new(FileOperationLog::new(path)?),
            OperationLogBackend::Sqlite { path } => Arc::new(SqliteOperationLog::new(path)?),
        })
    }
}
