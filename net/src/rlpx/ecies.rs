//! One-shot authenticated encryption of handshake payloads (§4.4).
//!
//! This is the pre-EIP-8 envelope: no length prefix, no random padding — the
//! plaintext length is fixed per message kind (194 bytes for auth, 97 for ack)
//! and the ciphertext length follows directly: `65 + 16 + plaintext + 32`.

use super::error::RLPxError;
use super::utils::{ecdh_x, kdf, sha256, sha256_hmac};
use aes::cipher::{KeyIvInit, StreamCipher};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use rand::rngs::OsRng;

type Aes128Ctr64BE = ctr::Ctr64BE<aes::Aes128>;

/// `R(65) || IV(16) || C(data.len()) || tag(32)`.
pub fn encrypt_message(data: &[u8], recipient_static_pub: &PublicKey) -> Vec<u8> {
    let ephemeral_secret = SecretKey::random(&mut OsRng);
    let ephemeral_public = ephemeral_secret.public_key();

    let shared_secret = ecdh_x(recipient_static_pub, &ephemeral_secret);
    let mut derived = [0u8; 32];
    kdf(&shared_secret, &mut derived);
    let (e_key, m_key_preimage) = derived.split_at(16);
    let m_key = sha256(m_key_preimage);

    let mut iv = [0u8; 16];
    rand::RngCore::fill_bytes(&mut OsRng, &mut iv);

    let mut ciphertext = data.to_vec();
    let mut cipher = Aes128Ctr64BE::new_from_slices(e_key, &iv).expect("valid key/iv sizes");
    cipher.apply_keystream(&mut ciphertext);

    let tag = sha256_hmac(&m_key, &[&iv, &ciphertext], &[]);

    let r_bytes = ephemeral_public.to_encoded_point(false);
    let mut out = Vec::with_capacity(65 + 16 + ciphertext.len() + 32);
    out.extend_from_slice(r_bytes.as_bytes());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(&tag);
    out
}

/// Inverse of [`encrypt_message`]; `static_secret` is the recipient's static private key.
pub fn decrypt_message(envelope: &[u8], static_secret: &SecretKey) -> Result<Vec<u8>, RLPxError> {
    if envelope.len() < 65 + 16 + 32 {
        return Err(RLPxError::Authentication("envelope too short".into()));
    }
    let (r_bytes, rest) = envelope.split_at(65);
    let (iv, rest) = rest.split_at(16);
    let (ciphertext, tag) = rest.split_at(rest.len() - 32);

    let ephemeral_public = PublicKey::from_sec1_bytes(r_bytes)
        .map_err(|_| RLPxError::Authentication("invalid ephemeral public key".into()))?;

    let shared_secret = ecdh_x(&ephemeral_public, static_secret);
    let mut derived = [0u8; 32];
    kdf(&shared_secret, &mut derived);
    let (e_key, m_key_preimage) = derived.split_at(16);
    let m_key = sha256(m_key_preimage);

    let expected_tag = sha256_hmac(&m_key, &[iv, ciphertext], &[]);
    if expected_tag != tag {
        return Err(RLPxError::Authentication("ECIES tag mismatch".into()));
    }

    let mut plaintext = ciphertext.to_vec();
    let mut cipher =
        Aes128Ctr64BE::new_from_slices(e_key, iv).expect("valid key/iv sizes");
    cipher.apply_keystream(&mut plaintext);
    Ok(plaintext)
}
