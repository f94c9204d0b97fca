//! Initiator/responder auth-ack exchange (§4.5): `Idle -> SentAuth -> Established`
//! for the initiator, `Idle -> ReceivedAuth -> SentAck -> Established` for the
//! responder. Every fallible step here is unrecoverable: any failure tears the
//! connection down rather than retrying on the same state.

use super::ecies::{decrypt_message, encrypt_message};
use super::error::RLPxError;
use super::frame::FrameState;
use super::mac::MacChain;
use super::utils::{ecdh_x, keccak256, xor};
use ctr::cipher::KeyIvInit;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{
    ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey},
    PublicKey, SecretKey,
};
use rand::{rngs::OsRng, RngCore};

const AUTH_PLAINTEXT_LEN: usize = 194;
const ACK_PLAINTEXT_LEN: usize = 97;

fn random_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn uncompressed_tail(pk: &PublicKey) -> [u8; 64] {
    pk.to_encoded_point(false).as_bytes()[1..].try_into().unwrap()
}

fn pubkey_from_tail(tail: &[u8]) -> Result<PublicKey, RLPxError> {
    let mut sec1 = [0u8; 65];
    sec1[0] = 0x04;
    sec1[1..].copy_from_slice(tail);
    PublicKey::from_sec1_bytes(&sec1)
        .map_err(|_| RLPxError::Authentication("invalid public key encoding".into()))
}

/// Per-connection state carried until the handshake either completes or fails.
pub struct Initiator {
    local_static_key: SecretKey,
    remote_static_pub: PublicKey,
    local_nonce: [u8; 32],
    local_ephemeral_key: SecretKey,
    auth_message: Vec<u8>,
}

impl Initiator {
    pub fn new(local_static_key: SecretKey, remote_static_pub: PublicKey) -> Self {
        Self::with_randomness(
            local_static_key,
            remote_static_pub,
            random_nonce(),
            SecretKey::random(&mut OsRng),
        )
    }

    /// Constructs an initiator with caller-supplied nonce/ephemeral key, for
    /// deterministic interop tests against fixed vectors.
    pub fn with_randomness(
        local_static_key: SecretKey,
        remote_static_pub: PublicKey,
        local_nonce: [u8; 32],
        local_ephemeral_key: SecretKey,
    ) -> Self {
        Self {
            local_static_key,
            remote_static_pub,
            local_nonce,
            local_ephemeral_key,
            auth_message: Vec::new(),
        }
    }

    /// Builds and records the auth envelope (`SentAuth`).
    pub fn encode_auth(&mut self) -> Vec<u8> {
        let static_shared = ecdh_x(&self.remote_static_pub, &self.local_static_key);
        let digest = xor(&static_shared, &self.local_nonce);

        let ephemeral_signer = SigningKey::from(&self.local_ephemeral_key);
        let (signature, recovery_id) = ephemeral_signer
            .sign_prehash_recoverable(&digest)
            .expect("32-byte digest is a valid prehash");

        let mut sig_bytes = [0u8; 65];
        sig_bytes[..64].copy_from_slice(&signature.to_bytes());
        sig_bytes[64] = recovery_id.to_byte();

        let ephemeral_pub_tail = uncompressed_tail(&self.local_ephemeral_key.public_key());
        let heid = keccak256(&[&ephemeral_pub_tail]);
        let own_static_pub_tail = uncompressed_tail(&self.local_static_key.public_key());

        let mut plaintext = Vec::with_capacity(AUTH_PLAINTEXT_LEN);
        plaintext.extend_from_slice(&sig_bytes);
        plaintext.extend_from_slice(&heid);
        plaintext.extend_from_slice(&own_static_pub_tail);
        plaintext.extend_from_slice(&self.local_nonce);
        plaintext.push(0x00);
        debug_assert_eq!(plaintext.len(), AUTH_PLAINTEXT_LEN);

        let envelope = encrypt_message(&plaintext, &self.remote_static_pub);
        self.auth_message = envelope.clone();
        envelope
    }

    /// Consumes the ack envelope and completes the handshake (`Established`).
    pub fn decode_ack(self, ack_envelope: &[u8]) -> Result<FrameState, RLPxError> {
        let plaintext = decrypt_message(ack_envelope, &self.local_static_key)?;
        if plaintext.len() != ACK_PLAINTEXT_LEN || plaintext[ACK_PLAINTEXT_LEN - 1] != 0x00 {
            return Err(RLPxError::Authentication(
                "ack payload has the wrong length or trailing byte".into(),
            ));
        }
        let remote_ephemeral_pub = pubkey_from_tail(&plaintext[..64])?;
        let remote_nonce: [u8; 32] = plaintext[64..96].try_into().unwrap();

        let ephemeral_shared_secret = ecdh_x(&remote_ephemeral_pub, &self.local_ephemeral_key);

        Ok(derive_frame_state(
            ephemeral_shared_secret,
            self.local_nonce,
            remote_nonce,
            self.auth_message,
            ack_envelope.to_vec(),
            true,
        ))
    }
}

/// The responder side, waiting for an auth envelope.
pub struct Receiver {
    local_static_key: SecretKey,
    local_nonce: [u8; 32],
    local_ephemeral_key: SecretKey,
}

impl Receiver {
    pub fn new(local_static_key: SecretKey) -> Self {
        Self::with_randomness(local_static_key, random_nonce(), SecretKey::random(&mut OsRng))
    }

    pub fn with_randomness(
        local_static_key: SecretKey,
        local_nonce: [u8; 32],
        local_ephemeral_key: SecretKey,
    ) -> Self {
        Self {
            local_static_key,
            local_nonce,
            local_ephemeral_key,
        }
    }

    /// Decrypts and validates an auth envelope (`ReceivedAuth`).
    pub fn decode_auth(self, auth_envelope: &[u8]) -> Result<ReceivedAuth, RLPxError> {
        let plaintext = decrypt_message(auth_envelope, &self.local_static_key)?;
        if plaintext.len() != AUTH_PLAINTEXT_LEN || plaintext[AUTH_PLAINTEXT_LEN - 1] != 0x00 {
            return Err(RLPxError::Authentication(
                "auth payload has the wrong length or trailing byte".into(),
            ));
        }

        let sig_bytes = &plaintext[..65];
        let heid: [u8; 32] = plaintext[65..97].try_into().unwrap();
        let remote_static_pub = pubkey_from_tail(&plaintext[97..161])?;
        let remote_nonce: [u8; 32] = plaintext[161..193].try_into().unwrap();

        let static_shared = ecdh_x(&remote_static_pub, &self.local_static_key);
        let digest = xor(&static_shared, &remote_nonce);

        let signature = Signature::from_slice(&sig_bytes[..64])
            .map_err(|_| RLPxError::Authentication("malformed signature".into()))?;
        let recovery_id = RecoveryId::from_byte(sig_bytes[64])
            .ok_or_else(|| RLPxError::Authentication("invalid recovery id".into()))?;
        let remote_ephemeral_pub = PublicKey::from(
            VerifyingKey::recover_from_prehash(&digest, &signature, recovery_id)
                .map_err(|_| RLPxError::Authentication("failed to recover ephemeral key".into()))?,
        );

        let expected_heid = keccak256(&[&uncompressed_tail(&remote_ephemeral_pub)]);
        if expected_heid != heid {
            return Err(RLPxError::Authentication(
                "ephemeral public key hash mismatch".into(),
            ));
        }

        let ephemeral_shared_secret = ecdh_x(&remote_ephemeral_pub, &self.local_ephemeral_key);

        Ok(ReceivedAuth {
            local_static_key: self.local_static_key,
            local_nonce: self.local_nonce,
            local_ephemeral_key: self.local_ephemeral_key,
            remote_static_pub,
            remote_nonce,
            ephemeral_shared_secret,
            remote_init_message: auth_envelope.to_vec(),
        })
    }
}

pub struct ReceivedAuth {
    local_static_key: SecretKey,
    local_nonce: [u8; 32],
    local_ephemeral_key: SecretKey,
    remote_static_pub: PublicKey,
    remote_nonce: [u8; 32],
    ephemeral_shared_secret: [u8; 32],
    remote_init_message: Vec<u8>,
}

impl ReceivedAuth {
    /// Builds the ack envelope and completes the handshake (`SentAck` -> `Established`).
    pub fn encode_ack_and_finish(self) -> (Vec<u8>, FrameState) {
        let _ = &self.local_static_key; // kept for symmetry / future re-keying, unused after auth validation
        let ephemeral_pub_tail = uncompressed_tail(&self.local_ephemeral_key.public_key());

        let mut plaintext = Vec::with_capacity(ACK_PLAINTEXT_LEN);
        plaintext.extend_from_slice(&ephemeral_pub_tail);
        plaintext.extend_from_slice(&self.local_nonce);
        plaintext.push(0x00);
        debug_assert_eq!(plaintext.len(), ACK_PLAINTEXT_LEN);

        let envelope = encrypt_message(&plaintext, &self.remote_static_pub);

        let frame_state = derive_frame_state(
            self.ephemeral_shared_secret,
            self.local_nonce,
            self.remote_nonce,
            envelope.clone(),
            self.remote_init_message,
            false,
        );
        (envelope, frame_state)
    }
}

type Aes256Ctr64BE = ctr::Ctr64BE<aes::Aes256>;

fn derive_frame_state(
    ephemeral_shared_secret: [u8; 32],
    own_nonce: [u8; 32],
    remote_nonce: [u8; 32],
    own_init_message: Vec<u8>,
    remote_init_message: Vec<u8>,
    is_initiator: bool,
) -> FrameState {
    let nonce_material: Vec<u8> = if is_initiator {
        [remote_nonce, own_nonce].concat()
    } else {
        [own_nonce, remote_nonce].concat()
    };
    let h_nonce = keccak256(&[&nonce_material]);
    let shared_secret = keccak256(&[&ephemeral_shared_secret, &h_nonce]);
    let aes_secret = keccak256(&[&ephemeral_shared_secret, &shared_secret]);
    let mac_secret = keccak256(&[&ephemeral_shared_secret, &aes_secret]);

    let mut ingress_mac = MacChain::new(&mac_secret);
    ingress_mac.update(xor(&mac_secret, &own_nonce));
    ingress_mac.update(&remote_init_message);

    let mut egress_mac = MacChain::new(&mac_secret);
    egress_mac.update(xor(&mac_secret, &remote_nonce));
    egress_mac.update(&own_init_message);

    let ingress_aes = Aes256Ctr64BE::new(&aes_secret.into(), &[0u8; 16].into());
    let egress_aes = ingress_aes.clone();

    FrameState::new(ingress_mac, egress_mac, ingress_aes, egress_aes)
}
