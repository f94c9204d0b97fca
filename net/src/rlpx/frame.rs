//! Post-handshake record layer (§4.6): AES-256-CTR encryption plus a running
//! Keccak MAC per direction, framed as `header-ciphertext(16) || header-mac(16)
//! || body-ciphertext(padded to 16) || body-mac(16)`.

use super::error::RLPxError;
use super::mac::MacChain;
use ctr::cipher::StreamCipher;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type Aes256Ctr64BE = ctr::Ctr64BE<aes::Aes256>;

/// `rlp([0, 0])`: the header-data two integers are always zero since this
/// transport does not negotiate sub-protocol capabilities.
const HEADER_DATA: [u8; 3] = [0xc2, 0x80, 0x80];

fn padded_len(size: usize) -> usize {
    size.div_ceil(16) * 16
}

/// Established per-connection secrets: two independent AES-256-CTR streams and
/// two independent MAC chains, one pair per direction.
pub struct FrameState {
    pub ingress_mac: MacChain,
    pub egress_mac: MacChain,
    ingress_aes: Aes256Ctr64BE,
    egress_aes: Aes256Ctr64BE,
    /// Set by `read_header`, cleared by `read_body`. A body read with none
    /// pending means the caller skipped the header read for this frame.
    pending_body_size: Option<usize>,
}

impl FrameState {
    pub fn new(
        ingress_mac: MacChain,
        egress_mac: MacChain,
        ingress_aes: Aes256Ctr64BE,
        egress_aes: Aes256Ctr64BE,
    ) -> Self {
        Self {
            ingress_mac,
            egress_mac,
            ingress_aes,
            egress_aes,
            pending_body_size: None,
        }
    }

    /// Encrypts, MACs, and writes one complete frame for `data`.
    pub async fn write<S: AsyncWrite + Unpin>(
        &mut self,
        stream: &mut S,
        data: &[u8],
    ) -> Result<(), RLPxError> {
        let size = data.len();
        assert!(size <= 0xff_ffff, "frame body exceeds the 24-bit size field");

        let mut header = [0u8; 16];
        header[0] = (size >> 16) as u8;
        header[1] = (size >> 8) as u8;
        header[2] = size as u8;
        header[3..3 + HEADER_DATA.len()].copy_from_slice(&HEADER_DATA);

        let mut header_ciphertext = header;
        self.egress_aes.apply_keystream(&mut header_ciphertext);
        self.egress_mac.update_header(&header_ciphertext);
        let header_mac = self.egress_mac.digest();

        stream.write_all(&header_ciphertext).await?;
        stream.write_all(&header_mac).await?;

        let mut body = vec![0u8; padded_len(size)];
        body[..size].copy_from_slice(data);
        self.egress_aes.apply_keystream(&mut body);
        self.egress_mac.update_body(&body);
        let body_mac = self.egress_mac.digest();

        stream.write_all(&body).await?;
        stream.write_all(&body_mac).await?;
        Ok(())
    }

    /// Reads, MAC-checks, and decrypts the 16-byte header, returning the body size.
    pub async fn read_header<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
    ) -> Result<usize, RLPxError> {
        let mut header_ciphertext = [0u8; 16];
        stream.read_exact(&mut header_ciphertext).await?;
        let mut mac = [0u8; 16];
        stream.read_exact(&mut mac).await?;

        self.ingress_mac.update_header(&header_ciphertext);
        if self.ingress_mac.digest() != mac {
            return Err(RLPxError::Authentication("frame header MAC mismatch".into()));
        }

        let mut header = header_ciphertext;
        self.ingress_aes.apply_keystream(&mut header);
        let size = ((header[0] as usize) << 16) | ((header[1] as usize) << 8) | header[2] as usize;
        self.pending_body_size = Some(size);
        Ok(size)
    }

    /// Reads, MAC-checks, and decrypts the body for the size recorded by the
    /// preceding [`read_header`](Self::read_header). Fails with
    /// [`RLPxError::NoPendingHeader`] if no header has been read yet.
    pub async fn read_body<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
    ) -> Result<Vec<u8>, RLPxError> {
        let size = self.pending_body_size.take().ok_or(RLPxError::NoPendingHeader)?;
        let mut body_ciphertext = vec![0u8; padded_len(size)];
        stream.read_exact(&mut body_ciphertext).await?;
        let mut mac = [0u8; 16];
        stream.read_exact(&mut mac).await?;

        self.ingress_mac.update_body(&body_ciphertext);
        if self.ingress_mac.digest() != mac {
            return Err(RLPxError::Authentication("frame body MAC mismatch".into()));
        }

        let mut body = body_ciphertext;
        self.ingress_aes.apply_keystream(&mut body);
        body.truncate(size);
        Ok(body)
    }

    /// Convenience wrapper over [`read_header`](Self::read_header) and
    /// [`read_body`](Self::read_body) for callers that always want a full frame.
    pub async fn read<S: AsyncRead + Unpin>(&mut self, stream: &mut S) -> Result<Vec<u8>, RLPxError> {
        self.read_header(stream).await?;
        self.read_body(stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctr::cipher::KeyIvInit;

    fn paired_states() -> (FrameState, FrameState) {
        let mac_secret = [0x42u8; 32];
        let aes_secret = [0x24u8; 32];

        let a_to_b_aes = Aes256Ctr64BE::new(&aes_secret.into(), &[0u8; 16].into());
        let b_to_a_aes = Aes256Ctr64BE::new(&aes_secret.into(), &[0u8; 16].into());

        let a = FrameState::new(
            MacChain::new(&mac_secret),
            MacChain::new(&mac_secret),
            b_to_a_aes.clone(),
            a_to_b_aes.clone(),
        );
        let b = FrameState::new(
            MacChain::new(&mac_secret),
            MacChain::new(&mac_secret),
            a_to_b_aes,
            b_to_a_aes,
        );
        (a, b)
    }

    #[tokio::test]
    async fn frame_roundtrip_nonempty() {
        let (mut a, mut b) = paired_states();
        let (mut client, mut server) = tokio::io::duplex(4096);

        let payload = b"hello rlpx".to_vec();
        a.write(&mut client, &payload).await.unwrap();
        let received = b.read(&mut server).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn frame_roundtrip_empty_and_exact_multiple_of_16() {
        let (mut a, mut b) = paired_states();
        let (mut client, mut server) = tokio::io::duplex(4096);

        a.write(&mut client, &[]).await.unwrap();
        assert_eq!(b.read(&mut server).await.unwrap(), Vec::<u8>::new());

        let exact = vec![0x7au8; 32];
        a.write(&mut client, &exact).await.unwrap();
        assert_eq!(b.read(&mut server).await.unwrap(), exact);
    }

    #[tokio::test]
    async fn body_read_without_header_fails() {
        let (mut a, mut b) = paired_states();
        let (mut client, mut _server) = tokio::io::duplex(4096);

        a.write(&mut client, b"unread header").await.unwrap();
        let err = b.read_body(&mut _server).await.unwrap_err();
        assert!(matches!(err, RLPxError::NoPendingHeader));
    }

    /// Scenario 5: a bit-flip in the ciphertext is caught by the body MAC.
    #[tokio::test]
    async fn tampered_body_fails_mac() {
        let (mut a, mut b) = paired_states();
        let (mut client, mut server) = tokio::io::duplex(4096);

        a.write(&mut client, b"0123456789abcdef").await.unwrap();

        // header(16) + header-mac(16) + body(16, already a multiple of 16) + body-mac(16)
        let mut raw = vec![0u8; 64];
        server.read_exact(&mut raw).await.unwrap();
        raw[20] ^= 0xff;

        let (mut relay_in, mut relay_out) = tokio::io::duplex(4096);
        relay_in.write_all(&raw).await.unwrap();
        drop(relay_in);

        let err = b.read(&mut relay_out).await.unwrap_err();
        assert!(matches!(err, RLPxError::Authentication(_)));
    }
}
