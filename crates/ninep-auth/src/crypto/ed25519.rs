//! Ed25519 sign/verify, per spec.md §4.8.
//!
//! Uses `ed25519-dalek` rather than hand-rolled curve arithmetic — the
//! idiomatic ecosystem choice for this primitive (confirmed by the
//! example pack's own use of the same crate elsewhere for Ed25519).

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

/// Generates a 32-byte challenge. `original_source/auth/fido2_mock.c`
/// derives its mock challenge deterministically; the real Ed25519 path
/// has no such mock and uses the OS RNG.
pub fn generate_challenge() -> [u8; 32] {
    let mut challenge = [0u8; 32];
    use rand::RngCore;
    OsRng.fill_bytes(&mut challenge);
    challenge
}

pub fn generate_keypair() -> ([u8; 32], [u8; 32]) {
    let signing_key = SigningKey::generate(&mut OsRng);
    (signing_key.verifying_key().to_bytes(), signing_key.to_bytes())
}

pub fn sign(private_key: &[u8; 32], challenge: &[u8; 32]) -> [u8; 64] {
    let signing_key = SigningKey::from_bytes(private_key);
    signing_key.sign(challenge).to_bytes()
}

pub fn verify(public_key: &[u8; 32], challenge: &[u8; 32], signature: &[u8; 64]) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let signature = Signature::from_bytes(signature);
    verifying_key.verify(challenge, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let (public_key, private_key) = generate_keypair();
        let challenge = generate_challenge();
        let signature = sign(&private_key, &challenge);
        assert!(verify(&public_key, &challenge, &signature));
    }

    #[test]
    fn verify_rejects_tampered_challenge() {
        let (public_key, private_key) = generate_keypair();
        let challenge = generate_challenge();
        let signature = sign(&private_key, &challenge);
        let mut other = challenge;
        other[0] ^= 0xff;
        assert!(!verify(&public_key, &other, &signature));
    }
}
