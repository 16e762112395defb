// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

//! Ed25519 signature verification in the signify key format.
//!
//! Keys and signatures travel in a two-line envelope: a comment line
//! followed by one base64 line. The decoded payload starts with the
//! 2-byte algorithm tag `Ed` and an 8-byte key fingerprint; the
//! fingerprint selects the verification key from the candidate set.

use base64::prelude::{Engine, BASE64_STANDARD};
use ed25519_dalek::{Signature, VerifyingKey};
use thiserror::Error;

pub const PUBLIC_KEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;
pub const FINGERPRINT_SIZE: usize = 8;

const ALGORITHM_TAG: &[u8; 2] = b"Ed";

/// A parsed public key with its fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    fingerprint: [u8; FINGERPRINT_SIZE],
    key: [u8; PUBLIC_KEY_SIZE],
}

impl PublicKey {
    pub fn parse(envelope: &[u8]) -> Result<Self, Error> {
        let raw = decode_envelope(envelope, 2 + FINGERPRINT_SIZE + PUBLIC_KEY_SIZE)
            .ok_or(Error::KeyFormat)?;
        if &raw[..2] != ALGORITHM_TAG {
            return Err(Error::KeyUnknown);
        }

        Ok(Self {
            fingerprint: raw[2..2 + FINGERPRINT_SIZE].try_into().expect("sized above"),
            key: raw[2 + FINGERPRINT_SIZE..].try_into().expect("sized above"),
        })
    }
}

/// Verify `data` against a signify signature envelope, selecting the
/// key whose fingerprint matches the signature's.
pub fn verify(data: &[u8], signature: &[u8], keys: &[PublicKey]) -> Result<(), Error> {
    let raw = decode_envelope(signature, 2 + FINGERPRINT_SIZE + SIGNATURE_SIZE)
        .ok_or(Error::SigFormat)?;
    if &raw[..2] != ALGORITHM_TAG {
        return Err(Error::SigUnknown);
    }

    let fingerprint = &raw[2..2 + FINGERPRINT_SIZE];
    let sig_bytes: [u8; SIGNATURE_SIZE] = raw[2 + FINGERPRINT_SIZE..]
        .try_into()
        .expect("sized above");

    let key = keys
        .iter()
        .find(|key| key.fingerprint == fingerprint)
        .ok_or(Error::NoMatchingKey)?;

    let verifying = VerifyingKey::from_bytes(&key.key).map_err(|_| Error::VerifyFailed)?;
    verifying
        .verify_strict(data, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| Error::VerifyFailed)
}

/// Strip the comment line, decode the base64 body and check its size
fn decode_envelope(envelope: &[u8], expected: usize) -> Option<Vec<u8>> {
    let body_start = envelope.iter().position(|b| *b == b'\n')? + 1;
    let body: Vec<u8> = envelope[body_start..]
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();

    let raw = BASE64_STANDARD.decode(&body).ok()?;
    (raw.len() == expected).then_some(raw)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Public key has invalid format")]
    KeyFormat,
    #[error("Signature has invalid format")]
    SigFormat,
    #[error("Public key is invalid or has unknown type")]
    KeyUnknown,
    #[error("Signature is invalid or has unknown type")]
    SigUnknown,
    #[error("No public key with matching signature was provided")]
    NoMatchingKey,
    #[error("Data or signature are corrupted")]
    VerifyFailed,
}

#[cfg(test)]
pub(crate) mod test {
    use ed25519_dalek::{Signer, SigningKey};

    use super::*;

    const FINGERPRINT: [u8; FINGERPRINT_SIZE] = [1, 2, 3, 4, 5, 6, 7, 8];

    fn envelope(comment: &str, payload: &[u8]) -> Vec<u8> {
        format!("{comment}\n{}\n", BASE64_STANDARD.encode(payload)).into_bytes()
    }

    pub(crate) fn test_key() -> SigningKey {
        SigningKey::from_bytes(&[42u8; 32])
    }

    pub(crate) fn public_key_envelope(key: &SigningKey, fingerprint: &[u8; 8]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(ALGORITHM_TAG);
        payload.extend_from_slice(fingerprint);
        payload.extend_from_slice(key.verifying_key().as_bytes());
        envelope("untrusted comment: test public key", &payload)
    }

    pub(crate) fn signature_envelope(key: &SigningKey, fingerprint: &[u8; 8], data: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(ALGORITHM_TAG);
        payload.extend_from_slice(fingerprint);
        payload.extend_from_slice(&key.sign(data).to_bytes());
        envelope("untrusted comment: test signature", &payload)
    }

    #[test]
    fn verifies_valid_signature() {
        let key = test_key();
        let pubkey = PublicKey::parse(&public_key_envelope(&key, &FINGERPRINT)).unwrap();
        let signature = signature_envelope(&key, &FINGERPRINT, b"payload");

        verify(b"payload", &signature, &[pubkey]).unwrap();
    }

    #[test]
    fn rejects_tampered_data() {
        let key = test_key();
        let pubkey = PublicKey::parse(&public_key_envelope(&key, &FINGERPRINT)).unwrap();
        let signature = signature_envelope(&key, &FINGERPRINT, b"payload");

        assert_eq!(
            verify(b"tampered", &signature, &[pubkey]),
            Err(Error::VerifyFailed)
        );
    }

    #[test]
    fn skips_keys_with_other_fingerprints() {
        let key = test_key();
        let other = PublicKey::parse(&public_key_envelope(&key, &[9; 8])).unwrap();
        let matching = PublicKey::parse(&public_key_envelope(&key, &FINGERPRINT)).unwrap();
        let signature = signature_envelope(&key, &FINGERPRINT, b"payload");

        verify(b"payload", &signature, &[other.clone(), matching]).unwrap();
        assert_eq!(
            verify(b"payload", &signature, &[other]),
            Err(Error::NoMatchingKey)
        );
    }

    #[test]
    fn rejects_malformed_envelopes() {
        assert_eq!(
            PublicKey::parse(b"no newline at all"),
            Err(Error::KeyFormat)
        );
        assert_eq!(
            PublicKey::parse(b"comment\nnot base64!!\n"),
            Err(Error::KeyFormat)
        );
        assert_eq!(
            verify(b"x", b"comment\nAAAA\n", &[]),
            Err(Error::SigFormat)
        );

        // Correct size, wrong algorithm tag
        let mut payload = vec![b'X', b'Y'];
        payload.extend_from_slice(&[0; FINGERPRINT_SIZE + PUBLIC_KEY_SIZE]);
        let enveloped = envelope("comment", &payload);
        assert_eq!(PublicKey::parse(&enveloped), Err(Error::KeyUnknown));
    }
}
