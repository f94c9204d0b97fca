use ethereum_types::H512;
use k256::{
    elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint},
    EncodedPoint, PublicKey, SecretKey,
};
use sha3::{Digest, Keccak256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    use k256::sha2::Digest as _;
    k256::sha2::Sha256::digest(data).into()
}

pub fn sha256_hmac(key: &[u8], inputs: &[&[u8]], auth_data: &[u8]) -> [u8; 32] {
    use hmac::Mac;
    use k256::sha2::Sha256;

    let mut hasher = hmac::Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key size");
    for input in inputs {
        hasher.update(input);
    }
    hasher.update(auth_data);
    hasher.finalize().into_bytes().into()
}

/// `keccak256(...parts)`: hashes the concatenation of `parts`.
pub fn keccak256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

pub fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    assert_eq!(a.len(), b.len(), "xor operands must have the same length");
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

/// `ecdhX(pub, priv)`: the 32-byte X coordinate of `pub·priv` on secp256k1.
/// Unvalidated/"unsafe" ECDH, matching the wire behavior this format requires.
pub fn ecdh_x(public_key: &PublicKey, secret_key: &SecretKey) -> [u8; 32] {
    k256::ecdh::diffie_hellman(secret_key.to_nonzero_scalar(), public_key.as_affine())
        .raw_secret_bytes()[..32]
        .try_into()
        .unwrap()
}

/// NIST SP 800-56A §5.8.1 concat-KDF with SHA-256, truncated to `output.len()` bytes.
/// Delegates the iteration count to the `concat-kdf` crate, which computes `ceil(L/32)`
/// rather than the off-by-one formula some reference implementations use.
pub fn kdf(secret: &[u8], output: &mut [u8]) {
    concat_kdf::derive_key_into::<k256::sha2::Sha256>(secret, &[], output)
        .expect("concat-kdf output length must be representable");
}

/// Computes a `NodeId` from an uncompressed public key (drops the `0x04` prefix).
pub fn pubkey2id(pk: &PublicKey) -> H512 {
    let encoded = pk.to_encoded_point(false);
    let bytes = encoded.as_bytes();
    debug_assert_eq!(bytes[0], 4);
    H512::from_slice(&bytes[1..])
}

/// Computes a public key from a `NodeId` (re-adds the `0x04` prefix).
pub fn id2pubkey(id: H512) -> Option<PublicKey> {
    let point = EncodedPoint::from_untagged_bytes(&id.0.into());
    PublicKey::from_encoded_point(&point).into_option()
}
