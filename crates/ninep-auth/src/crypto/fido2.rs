//! FIDO2 authenticator seam, per spec.md §4.8.
//!
//! Real FIDO2 device I/O (`libfido2`/`fido.h`) has no crate in this
//! workspace's dependency stack, so [`Fido2Authenticator`] is a trait:
//! real device support would implement it; [`MockFido2`] is the
//! implementation actually wired up, grounded on
//! `original_source/auth/fido2_mock.c`'s deterministic mock data. This
//! mirrors the source's own split between `fido2.h` (real signatures)
//! and `fido2_mock.c` (what's actually linked).

use sha2::{Digest, Sha256};

/// The bytes a FIDO2 assertion actually signs: `auth_data ||
/// SHA-256(challenge)`, per spec.md §4.8. A real verifier ECDSA-verifies
/// this against the credential's public key; [`MockFido2`] instead
/// matches the fixed demo signature below, mirroring `fido2_mock.c`.
pub fn signed_data(auth_data: &[u8], challenge: &[u8; 32]) -> Vec<u8> {
    let mut data = auth_data.to_vec();
    data.extend_from_slice(&Sha256::digest(challenge));
    data
}

#[derive(Clone, Debug, Default)]
pub struct Assertion {
    pub auth_data: Vec<u8>,
    pub signature: Vec<u8>,
}

pub trait Fido2Authenticator: Send + Sync {
    fn generate_challenge(&self) -> [u8; 32];

    fn get_assertion(
        &self,
        credential_id: &[u8],
        challenge: &[u8; 32],
    ) -> Result<Assertion, String>;

    fn verify_signature(
        &self,
        challenge: &[u8; 32],
        auth_data: &[u8],
        signature: &[u8],
        public_key: &[u8],
    ) -> Result<(), String>;
}

const MOCK_CREDENTIAL_ID: [u8; 64] = [
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f, 0x10,
    0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x1b, 0x1c, 0x1d, 0x1e, 0x1f, 0x20,
    0x21, 0x22, 0x23, 0x24, 0x25, 0x26, 0x27, 0x28, 0x29, 0x2a, 0x2b, 0x2c, 0x2d, 0x2e, 0x2f, 0x30,
    0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3a, 0x3b, 0x3c, 0x3d, 0x3e, 0x3f, 0x40,
];

const MOCK_PUBLIC_KEY: [u8; 65] = [
    0x04, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7, 0xa8, 0xa9, 0xaa, 0xab, 0xac, 0xad, 0xae, 0xaf,
    0xb0, 0xb1, 0xb2, 0xb3, 0xb4, 0xb5, 0xb6, 0xb7, 0xb8, 0xb9, 0xba, 0xbb, 0xbc, 0xbd, 0xbe, 0xbf,
    0xc0, 0xc1, 0xc2, 0xc3, 0xc4, 0xc5, 0xc6, 0xc7, 0xc8, 0xc9, 0xca, 0xcb, 0xcc, 0xcd, 0xce, 0xcf,
    0xd0, 0xd1, 0xd2, 0xd3, 0xd4, 0xd5, 0xd6, 0xd7, 0xd8, 0xd9, 0xda, 0xdb, 0xdc, 0xdd, 0xde, 0xdf,
    0xe0,
];

const MOCK_AUTH_DATA: [u8; 37] = [
    0x49, 0x96, 0x0d, 0xe5, 0x88, 0x0e, 0x8c, 0x68, 0x74, 0x34, 0x17, 0x0f, 0x64, 0x76, 0x60, 0x5b,
    0x8f, 0xe4, 0xae, 0xb9, 0xa2, 0x86, 0x32, 0xc7, 0x99, 0x5c, 0xf3, 0xba, 0x83, 0x1d, 0x97, 0x63,
    0x01, 0x00, 0x00, 0x00, 0x01,
];

const MOCK_SIGNATURE: [u8; 64] = [
    0xe1, 0xe2, 0xe3, 0xe4, 0xe5, 0xe6, 0xe7, 0xe8, 0xe9, 0xea, 0xeb, 0xec, 0xed, 0xee, 0xef, 0xf0,
    0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8, 0xf9, 0xfa, 0xfb, 0xfc, 0xfd, 0xfe, 0xff, 0x00,
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f, 0x10,
    0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x1b, 0x1c, 0x1d, 0x1e, 0x1f, 0x20,
];

/// Returns the mock credential's well-known public key, for tests and
/// for key-ring registration helpers that want a working demo key.
pub fn mock_credential_id() -> Vec<u8> {
    MOCK_CREDENTIAL_ID.to_vec()
}

pub fn mock_public_key() -> Vec<u8> {
    MOCK_PUBLIC_KEY.to_vec()
}

/// A deterministic stand-in for a real FIDO2 authenticator, grounded on
/// `fido2_mock.c`. Always answers with the same fixed credential id,
/// public key, auth_data and signature; useful for exercising the RPC
/// state machine without hardware.
#[derive(Clone, Copy, Debug, Default)]
pub struct MockFido2;

impl Fido2Authenticator for MockFido2 {
    fn generate_challenge(&self) -> [u8; 32] {
        let mut challenge = [0u8; 32];
        for (i, b) in challenge.iter_mut().enumerate() {
            *b = ((i * 7 + 13) & 0xff) as u8;
        }
        challenge
    }

    fn get_assertion(&self, credential_id: &[u8], _challenge: &[u8; 32]) -> Result<Assertion, String> {
        if credential_id.is_empty() {
            return Err("fido2: credential ID is required".to_owned());
        }
        if credential_id.len() != MOCK_CREDENTIAL_ID.len() {
            return Err("fido2: invalid credential ID length".to_owned());
        }
        if credential_id != MOCK_CREDENTIAL_ID {
            return Err("fido2: credential not found".to_owned());
        }

        Ok(Assertion {
            auth_data: MOCK_AUTH_DATA.to_vec(),
            signature: MOCK_SIGNATURE.to_vec(),
        })
    }

    fn verify_signature(
        &self,
        _challenge: &[u8; 32],
        _auth_data: &[u8],
        signature: &[u8],
        public_key: &[u8],
    ) -> Result<(), String> {
        if signature.is_empty() {
            return Err("fido2: signature is required".to_owned());
        }
        if public_key.is_empty() {
            return Err("fido2: public key is required".to_owned());
        }
        if signature == MOCK_SIGNATURE {
            return Ok(());
        }
        Err("fido2: signature verification failed".to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_challenge_matches_deterministic_formula() {
        let challenge = MockFido2.generate_challenge();
        assert_eq!(challenge[0], 13);
        assert_eq!(challenge[1], 20);
    }

    #[test]
    fn get_assertion_rejects_unknown_credential() {
        let result = MockFido2.get_assertion(&[1, 2, 3], &[0; 32]);
        assert!(result.is_err());
    }

    #[test]
    fn assertion_then_verify_round_trips() {
        let challenge = MockFido2.generate_challenge();
        let assertion = MockFido2.get_assertion(&MOCK_CREDENTIAL_ID, &challenge).unwrap();
        assert!(
            MockFido2
                .verify_signature(&challenge, &assertion.auth_data, &assertion.signature, &MOCK_PUBLIC_KEY)
                .is_ok()
        );
    }
}
