use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes128;
use ctr::Ctr128BE;
use shared::error::{Error, Result};
use shared::wrap::FrameId;

type Aes128Ctr = Ctr128BE<Aes128>;

pub const AES_KEY_SIZE: usize = 16;

/// Optional AES-128-CTR encryption of whole frames.
///
/// The counter is re-seeded per frame with `iv_mask XOR frame_id`, so both
/// ends stay in sync without extra wire bytes.
pub struct FrameCrypto {
    key: [u8; AES_KEY_SIZE],
    iv_mask: [u8; AES_KEY_SIZE],
}

impl FrameCrypto {
    /// Returns `None` when no crypto is configured (both inputs empty). A
    /// key without a mask, or a length other than 16 bytes, is a
    /// configuration error.
    pub fn from_config(aes_key: &[u8], aes_iv_mask: &[u8]) -> Result<Option<FrameCrypto>> {
        match (aes_key.len(), aes_iv_mask.len()) {
            (0, 0) => Ok(None),
            (AES_KEY_SIZE, AES_KEY_SIZE) => {
                let mut key = [0u8; AES_KEY_SIZE];
                key.copy_from_slice(aes_key);
                let mut iv_mask = [0u8; AES_KEY_SIZE];
                iv_mask.copy_from_slice(aes_iv_mask);
                Ok(Some(FrameCrypto { key, iv_mask }))
            }
            (AES_KEY_SIZE, _) | (0, _) => Err(Error::ErrAesIvMaskLength),
            _ => Err(Error::ErrAesKeyLength),
        }
    }

    /// `iv_mask XOR frame_id`, frame id big-endian in the low four bytes.
    fn aes_nonce(&self, frame_id: FrameId) -> [u8; AES_KEY_SIZE] {
        let mut nonce = self.iv_mask;
        let id = (frame_id.0 as u32).to_be_bytes();
        for i in 0..4 {
            nonce[AES_KEY_SIZE - 4 + i] ^= id[i];
        }
        nonce
    }

    pub fn encrypt(&self, frame_id: FrameId, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        let mut cipher = Aes128Ctr::new(&self.key.into(), &self.aes_nonce(frame_id).into());
        cipher.apply_keystream(&mut out);
        out
    }

    /// CTR decryption is the same keystream application; the `Result` keeps
    /// the drop-the-frame contract in one place.
    pub fn decrypt(&self, frame_id: FrameId, data: &[u8]) -> Result<Vec<u8>> {
        Ok(self.encrypt(frame_id, data))
    }
}
