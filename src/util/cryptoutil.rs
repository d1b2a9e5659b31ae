use aes::cipher::crypto_common;
use anyhow::Result;

pub type Aes128Ccm = ccm::Ccm<aes::Aes128, ccm::consts::U16, ccm::consts::U13>;
pub type SessionKey = crypto_common::Key<Aes128Ccm>;

/// Length of the AES-CCM nonce used by secure sessions.
pub const NONCE_LEN: usize = 13;

pub fn aes128_ccm_encrypt(key: &SessionKey, nonce: &[u8], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        anyhow::bail!("nonce must be {} bytes, got {}", NONCE_LEN, nonce.len());
    }
    let cipher = <Aes128Ccm as ccm::KeyInit>::new(key);
    ccm::aead::Aead::encrypt(
        &cipher,
        crypto_common::generic_array::GenericArray::from_slice(nonce),
        ccm::aead::Payload { msg, aad },
    )
    .map_err(|e| anyhow::anyhow!("encrypt error {:?}", e))
}

pub fn aes128_ccm_decrypt(key: &SessionKey, nonce: &[u8], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        anyhow::bail!("nonce must be {} bytes, got {}", NONCE_LEN, nonce.len());
    }
    let cipher = <Aes128Ccm as ccm::KeyInit>::new(key);
    ccm::aead::Aead::decrypt(
        &cipher,
        crypto_common::generic_array::GenericArray::from_slice(nonce),
        ccm::aead::Payload { msg, aad },
    )
    .map_err(|e| anyhow::anyhow!("decrypt error {:?}", e))
}
