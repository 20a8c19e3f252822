//! Keyward core: key lifecycle and operation dispatch on top of a PKCS#11-style
//! token. A [`CryptoDispatcher`] resolves keys through the device and the key
//! registry, enforces the active gate, runs the primitive on the device and
//! appends one [`OperationRecord`] per call. Device drivers plug in through
//! [`HsmDriver`]; [`SoftHsm`] is the in-process token used by tests and demos.

pub mod analysis;
pub mod config;
pub mod device;
pub mod digest;
pub mod dispatcher;
pub mod error;
pub mod fs_utils;
pub mod models;
pub mod oplog;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod soft;

pub use analysis::{
    Analyzer, DeviceComparison, UsageSummary, compare_device_vs_software, mean_of,
};
pub use config::{
    DeviceConfig, KeyPolicyConfig, KeywardConfig, OperationLogBackend, RegistryBackend,
    StorageConfig,
};
pub use device::{
    DeviceSession, HsmDriver, KeyPairHandles, Mechanism, ObjectClass, ObjectHandle,
    SessionCredentials, SessionHandle,
};
pub use digest::{HashAlgorithm, HashBenchmark};
pub use dispatcher::{
    CryptoDispatcher, DecryptResult, DeviceKey, EncryptResult, HashResult, HashSignResult,
    HashVerifyResult, KeyGenerationResult, Response, SignResult, VerifyResult,
};
pub use error::{ErrorKind, HsmError, HsmResult};
pub use models::{
    KeyFilter, KeyGenerationRequest, KeyLabel, KeyRecord, KeyType, Plaintext, VerificationOutcome,
};
pub use oplog::{
    FileOperationLog, MemoryOperationLog, OperationLog, OperationQuery, OperationRecord,
    OperationType, SqliteOperationLog,
};
pub use registry::{KeyRegistry, MemoryKeyRegistry, SqliteKeyRegistry};
pub use resolver::{KeyResolver, KeySelector, ResolvedKey};
pub use session::SessionAdapter;
pub use soft::SoftHsm;
