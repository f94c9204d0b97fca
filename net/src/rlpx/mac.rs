use aes::{
    cipher::{BlockEncrypt, KeyInit},
    Aes256Enc,
};
use sha3::{Digest, Keccak256};

/// A Keccak-256 absorber seeded with a 32-byte `macSecret`, producing 16-byte tags
/// over frame headers and bodies (§4.2). `digest()` reads the current sponge state
/// without finalizing it — snapshot/restore is simulated by cloning the hasher,
/// since `Keccak256` exposes no squeeze-without-finalize method directly.
#[derive(Clone)]
pub struct MacChain {
    state: Keccak256,
    cipher: Aes256Enc,
}

impl MacChain {
    pub fn new(mac_secret: &[u8; 32]) -> Self {
        Self {
            state: Keccak256::new(),
            cipher: Aes256Enc::new_from_slice(mac_secret).expect("32-byte key"),
        }
    }

    /// Absorbs arbitrary bytes into the running digest without the AES-ECB seed step.
    /// Used to seed the chain with `xor(macSecret, nonce) || initMessage` (§4.5).
    pub fn update(&mut self, data: impl AsRef<[u8]>) {
        self.state.update(data);
    }

    fn seed(&self) -> [u8; 16] {
        self.state.clone().finalize()[..16].try_into().unwrap()
    }

    fn aes_seed(&self, input: [u8; 16]) -> [u8; 16] {
        let mut block = input.into();
        self.cipher.encrypt_block(&mut block);
        block.into()
    }

    /// `updateHeader(headerCiphertext16)`.
    pub fn update_header(&mut self, header_ciphertext: &[u8; 16]) {
        let digest = self.seed();
        let aesed = self.aes_seed(digest);
        let seed: Vec<u8> = aesed
            .iter()
            .zip(header_ciphertext)
            .map(|(a, b)| a ^ b)
            .collect();
        self.state.update(seed);
    }

    /// `updateBody(bodyCiphertext)`.
    pub fn update_body(&mut self, body_ciphertext: &[u8]) {
        self.state.update(body_ciphertext);
        let digest = self.seed();
        let aesed = self.aes_seed(digest);
        let seed: Vec<u8> = aesed.iter().zip(digest).map(|(a, b)| a ^ b).collect();
        self.state.update(seed);
    }

    /// Returns the first 16 bytes of the current digest without finalizing the chain.
    pub fn digest(&self) -> [u8; 16] {
        self.seed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_does_not_consume_state() {
        let mut mac = MacChain::new(&[0x11; 32]);
        mac.update(b"hello");
        let d1 = mac.digest();
        let d2 = mac.digest();
        assert_eq!(d1, d2, "repeated digest() calls without mutation must agree");
    }

    #[test]
    fn update_header_then_body_changes_digest() {
        let mut mac = MacChain::new(&[0x22; 32]);
        let before = mac.digest();
        mac.update_header(&[0x01; 16]);
        let after_header = mac.digest();
        assert_ne!(before, after_header);
        mac.update_body(&[0x02; 32]);
        let after_body = mac.digest();
        assert_ne!(after_header, after_body);
    }
}
