//! Mapping between keyward mechanisms and cryptoki, plus return-value
//! translation into keyward errors.

use cryptoki::{
    error::{Error as CryptokiError, RvError},
    mechanism::Mechanism as CkMechanism,
    object::ObjectClass as CkObjectClass,
};
use keyward_core::{HsmError, Mechanism, ObjectClass};

/// DER-encoded OID of secp256r1 (1.2.840.10045.3.1.7).
pub const SECP256R1_PARAMS: [u8; 10] = [0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];

pub const RSA_PUBLIC_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];

pub fn object_class(class: ObjectClass) -> CkObjectClass {
    match class {
        ObjectClass::PublicKey => CkObjectClass::PUBLIC_KEY,
        ObjectClass::PrivateKey => CkObjectClass::PRIVATE_KEY,
    }
}

/// Cryptoki mechanism for a signing operation. ECDSA is raw on the token, so
/// callers hash the message first.
pub fn signing_mechanism(mechanism: Mechanism) -> CkMechanism<'static> {
    match mechanism {
        Mechanism::RsaPkcs => CkMechanism::RsaPkcs,
        Mechanism::Sha256RsaPkcs => CkMechanism::Sha256RsaPkcs,
        Mechanism::Ecdsa => CkMechanism::Ecdsa,
    }
}

pub fn is_device_loss(rv: RvError) -> bool {
    matches!(
        rv,
        RvError::DeviceRemoved
            | RvError::DeviceError
            | RvError::TokenNotPresent
            | RvError::TokenNotRecognized
            | RvError::SessionClosed
            | RvError::SessionHandleInvalid
            | RvError::CryptokiNotInitialized
    )
}

pub fn is_bad_pin(rv: RvError) -> bool {
    matches!(
        rv,
        RvError::PinIncorrect | RvError::PinInvalid | RvError::PinLenRange | RvError::PinLocked
    )
}

/// Signature rejections that mean "does not verify" rather than a device fault.
pub fn is_signature_rejection(rv: RvError) -> bool {
    matches!(rv, RvError::SignatureInvalid | RvError::SignatureLenRange)
}

pub fn return_value(err: &CryptokiError) -> Option<RvError> {
    match err {
        CryptokiError::Pkcs11(rv, _) => Some(*rv),
        _ => None,
    }
}

/// Device-level failures become `DeviceUnavailable` so the session adapter
/// reopens; everything else is an operation failure.
pub fn operation_error(err: CryptokiError) -> HsmError {
    match return_value(&err) {
        Some(rv) if is_device_loss(rv) => HsmError::device(err),
        _ => HsmError::crypto(err),
    }
}

pub fn keygen_error(err: CryptokiError) -> HsmError {
    match return_value(&err) {
        Some(rv) if is_device_loss(rv) => HsmError::device(err),
        _ => HsmError::keygen(err),
    }
}

/// Strip the DER OCTET STRING wrapper some tokens put around `CKA_EC_POINT`.
pub fn unwrap_ec_point(raw: &[u8]) -> &[u8] {
    match raw {
        [0x04, len, rest @ ..] if *len as usize == rest.len() && rest.first() == Some(&0x04) => {
            rest
        }
        _ => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn der_wrapped_point_is_unwrapped() {
        let mut point = vec![0x04];
        point.extend_from_slice(&[0xab; 64]);
        let mut wrapped = vec![0x04, 65];
        wrapped.extend_from_slice(&point);

        assert_eq!(unwrap_ec_point(&wrapped), point.as_slice());
        assert_eq!(unwrap_ec_point(&point), point.as_slice());
    }

    #[test]
    fn return_value_classes() {
        assert!(is_device_loss(RvError::DeviceRemoved));
        assert!(!is_device_loss(RvError::SignatureInvalid));
        assert!(is_bad_pin(RvError::PinIncorrect));
        assert!(is_signature_rejection(RvError::SignatureLenRange));
        assert!(!is_signature_rejection(RvError::DataLenRange));
    }

    #[test]
    fn class_mapping() {
        assert_eq!(object_class(ObjectClass::PublicKey), CkObjectClass::PUBLIC_KEY);
        assert_eq!(object_class(ObjectClass::PrivateKey), CkObjectClass::PRIVATE_KEY);
    }
}
