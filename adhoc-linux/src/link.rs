//! Datagram envelope for the UDP radio emulation and per-link encryption.
//!
//! ```text
//! +-------+--------+--------+---------+-------+--------------------------+
//! | magic |  src   |  dst   | channel | flags | body                     |
//! |  2B   |   6B   |   6B   |   1B    |  1B   | frame, or nonce(12)+AEAD |
//! +-------+--------+--------+---------+-------+--------------------------+
//! ```

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use adhoc_core::{MacAddr, SecretKey};

const MAGIC: [u8; 2] = *b"AH";
pub const ENVELOPE_HEADER_LEN: usize = 2 + 6 + 6 + 1 + 1;
const NONCE_LEN: usize = 12;
const FLAG_SEALED: u8 = 0x01;

/// Parsed envelope header plus body (still sealed if `sealed`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub src: MacAddr,
    pub dst: MacAddr,
    pub channel: u8,
    pub sealed: bool,
    pub body: Vec<u8>,
}

impl Envelope {
    fn header(src: MacAddr, dst: MacAddr, channel: u8, sealed: bool) -> [u8; ENVELOPE_HEADER_LEN] {
        let mut h = [0u8; ENVELOPE_HEADER_LEN];
        h[..2].copy_from_slice(&MAGIC);
        h[2..8].copy_from_slice(src.as_bytes());
        h[8..14].copy_from_slice(dst.as_bytes());
        h[14] = channel;
        h[15] = if sealed { FLAG_SEALED } else { 0 };
        h
    }

    /// Plaintext datagram.
    pub fn plain(src: MacAddr, dst: MacAddr, channel: u8, frame: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_HEADER_LEN + frame.len());
        out.extend_from_slice(&Self::header(src, dst, channel, false));
        out.extend_from_slice(frame);
        out
    }

    /// Datagram sealed for `cipher`; the header is authenticated too.
    pub fn sealed(
        src: MacAddr,
        dst: MacAddr,
        channel: u8,
        frame: &[u8],
        cipher: &LinkCipher,
    ) -> Result<Vec<u8>, LinkError> {
        let header = Self::header(src, dst, channel, true);
        let body = cipher.seal(&header, frame)?;
        let mut out = Vec::with_capacity(ENVELOPE_HEADER_LEN + body.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, LinkError> {
        if datagram.len() < ENVELOPE_HEADER_LEN || datagram[..2] != MAGIC {
            return Err(LinkError::NotOurs);
        }
        let mut src = [0u8; 6];
        src.copy_from_slice(&datagram[2..8]);
        let mut dst = [0u8; 6];
        dst.copy_from_slice(&datagram[8..14]);
        Ok(Envelope {
            src: MacAddr::new(src),
            dst: MacAddr::new(dst),
            channel: datagram[14],
            sealed: datagram[15] & FLAG_SEALED != 0,
            body: datagram[ENVELOPE_HEADER_LEN..].to_vec(),
        })
    }

    /// Decrypt a sealed body in place.
    pub fn open(&mut self, cipher: &LinkCipher) -> Result<(), LinkError> {
        let header = Self::header(self.src, self.dst, self.channel, true);
        self.body = cipher.open(&header, &self.body)?;
        self.sealed = false;
        Ok(())
    }
}

/// ChaCha20-Poly1305 keyed from the network and link keys. Fresh random nonce per frame.
#[derive(Clone)]
pub struct LinkCipher {
    key: [u8; 32],
}

impl LinkCipher {
    pub fn new(network_key: &SecretKey, link_key: &SecretKey) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"adhoc-link-v1");
        hasher.update(network_key.as_bytes());
        hasher.update(link_key.as_bytes());
        LinkCipher {
            key: hasher.finalize().into(),
        }
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305, LinkError> {
        ChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| LinkError::Key)
    }

    fn seal(&self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, LinkError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = self
            .cipher()?
            .encrypt(
                chacha20poly1305::Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| LinkError::Seal)?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn open(&self, aad: &[u8], body: &[u8]) -> Result<Vec<u8>, LinkError> {
        if body.len() < NONCE_LEN {
            return Err(LinkError::Open);
        }
        let (nonce, sealed) = body.split_at(NONCE_LEN);
        self.cipher()?
            .decrypt(
                chacha20poly1305::Nonce::from_slice(nonce),
                Payload { msg: sealed, aad },
            )
            .map_err(|_| LinkError::Open)
    }
}

impl std::fmt::Debug for LinkCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LinkCipher(..)")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("not an envelope")]
    NotOurs,
    #[error("invalid key")]
    Key,
    #[error("sealing failed")]
    Seal,
    #[error("authentication failed")]
    Open,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(n: u8) -> MacAddr {
        MacAddr::new([0x02, 0, 0, 0, 0, n])
    }

    fn cipher(lmk: &str) -> LinkCipher {
        LinkCipher::new(
            &SecretKey::from_passphrase("pmk").unwrap(),
            &SecretKey::from_passphrase(lmk).unwrap(),
        )
    }

    #[test]
    fn plain_envelope_decodes() {
        let d = Envelope::plain(mac(1), MacAddr::BROADCAST, 4, b"frame");
        let env = Envelope::decode(&d).unwrap();
        assert_eq!(env.src, mac(1));
        assert!(env.dst.is_broadcast());
        assert_eq!(env.channel, 4);
        assert!(!env.sealed);
        assert_eq!(env.body, b"frame");
    }

    #[test]
    fn sealed_envelope_opens_with_same_keys_only() {
        let d = Envelope::sealed(mac(1), mac(2), 4, b"secret frame", &cipher("lmk")).unwrap();
        assert!(!d.windows(12).any(|w| w == b"secret frame"));

        let mut env = Envelope::decode(&d).unwrap();
        assert!(env.sealed);
        assert!(matches!(env.clone().open(&cipher("other")), Err(LinkError::Open)));
        env.open(&cipher("lmk")).unwrap();
        assert_eq!(env.body, b"secret frame");
    }

    #[test]
    fn tampered_header_fails_authentication() {
        let mut d = Envelope::sealed(mac(1), mac(2), 4, b"frame", &cipher("lmk")).unwrap();
        d[14] = 5;
        let mut env = Envelope::decode(&d).unwrap();
        assert!(env.open(&cipher("lmk")).is_err());
    }

    #[test]
    fn foreign_datagrams_rejected() {
        assert!(matches!(Envelope::decode(b"hello"), Err(LinkError::NotOurs)));
        assert!(matches!(
            Envelope::decode(&[0u8; 32]),
            Err(LinkError::NotOurs)
        ));
    }
}
