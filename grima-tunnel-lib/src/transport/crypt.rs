//! Whole-datagram ciphers for the reliable layer.
//!
//! Block ciphers run in CFB mode with a fresh random IV prepended to every
//! datagram; salsa20 prepends its nonce the same way. The cipher is pure
//! obfuscation for middleboxes — both ends share one passphrase-derived key
//! and there is no authentication, mirroring the transport it replaces.

use std::sync::Arc;

use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use salsa20::cipher::StreamCipher;
use sha2::Sha256;
use tracing::warn;

use crate::error::{Result, TunnelError};

const KDF_SALT: &[u8] = b"grima-tunnel-kdf";
const KDF_ROUNDS: u32 = 4096;

pub(crate) trait BlockCrypt: Send + Sync {
    fn encrypt(&self, data: &[u8]) -> Vec<u8>;
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Resolve the configured cipher selector. Unrecognised values (including
/// ciphers with no maintained pure-Rust implementation) carry no cipher.
pub(crate) fn new_block(block: &str, key: &str) -> Arc<dyn BlockCrypt> {
    match block {
        "none" => Arc::new(Noop),
        "aes" => Arc::new(Cfb::<aes::Aes256>::new(derive_key(key, 32), 16)),
        "blowfish" => Arc::new(Cfb::<blowfish::Blowfish>::new(derive_key(key, 56), 8)),
        "cast5" => Arc::new(Cfb::<cast5::Cast5>::new(derive_key(key, 16), 8)),
        "sm4" => Arc::new(Cfb::<sm4::Sm4>::new(derive_key(key, 16), 16)),
        "tripledes" => Arc::new(Cfb::<des::TdesEde3>::new(derive_key(key, 24), 8)),
        "twofish" => Arc::new(Cfb::<twofish::Twofish>::new(derive_key(key, 32), 16)),
        "salsa20" => Arc::new(Salsa::new(derive_key(key, 32))),
        "simplexor" => Arc::new(SimpleXor::new(derive_key(key, 32))),
        other => {
            warn!(block = other, "unrecognised cipher selector, carrying no cipher");
            Arc::new(Noop)
        }
    }
}

fn derive_key(pass: &str, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    pbkdf2_hmac::<Sha256>(pass.as_bytes(), KDF_SALT, KDF_ROUNDS, &mut out);
    out
}

struct Noop;

impl BlockCrypt for Noop {
    fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// CFB-mode wrapper over any RustCrypto block cipher.
struct Cfb<C> {
    key: Vec<u8>,
    iv_len: usize,
    _cipher: std::marker::PhantomData<fn() -> C>,
}

impl<C> Cfb<C> {
    fn new(key: Vec<u8>, iv_len: usize) -> Self {
        Self { key, iv_len, _cipher: std::marker::PhantomData }
    }
}

impl<C> BlockCrypt for Cfb<C>
where
    C: cipher::BlockCipher + cipher::BlockEncryptMut + cipher::BlockDecryptMut + cipher::KeyInit,
{
    fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        let mut iv = vec![0u8; self.iv_len];
        rand::rng().fill_bytes(&mut iv);
        let mut out = Vec::with_capacity(self.iv_len + data.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(data);
        match cfb_mode::Encryptor::<C>::new_from_slices(&self.key, &iv) {
            Ok(enc) => enc.encrypt(&mut out[self.iv_len..]),
            Err(_) => return data.to_vec(),
        }
        out
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < self.iv_len {
            return Err(TunnelError::Protocol("datagram shorter than cipher IV".into()));
        }
        let (iv, body) = data.split_at(self.iv_len);
        let mut out = body.to_vec();
        cfb_mode::Decryptor::<C>::new_from_slices(&self.key, iv)
            .map_err(|e| TunnelError::Transport(format!("cipher init failed: {e}")))?
            .decrypt(&mut out);
        Ok(out)
    }
}

struct Salsa {
    key: Vec<u8>,
}

impl Salsa {
    fn new(key: Vec<u8>) -> Self {
        Self { key }
    }
}

impl BlockCrypt for Salsa {
    fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        let mut nonce = [0u8; 8];
        rand::rng().fill_bytes(&mut nonce);
        let mut out = Vec::with_capacity(8 + data.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(data);
        if let Ok(mut cipher) = salsa20::Salsa20::new_from_slices(&self.key, &nonce) {
            cipher.apply_keystream(&mut out[8..]);
        }
        out
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < 8 {
            return Err(TunnelError::Protocol("datagram shorter than cipher nonce".into()));
        }
        let (nonce, body) = data.split_at(8);
        let mut out = body.to_vec();
        let mut cipher = salsa20::Salsa20::new_from_slices(&self.key, nonce)
            .map_err(|e| TunnelError::Transport(format!("cipher init failed: {e}")))?;
        cipher.apply_keystream(&mut out);
        Ok(out)
    }
}

/// Cycling XOR pad; the cheapest selector on offer.
struct SimpleXor {
    pad: Vec<u8>,
}

impl SimpleXor {
    fn new(pad: Vec<u8>) -> Self {
        Self { pad }
    }

    fn apply(&self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .enumerate()
            .map(|(i, b)| b ^ self.pad[i % self.pad.len()])
            .collect()
    }
}

impl BlockCrypt for SimpleXor {
    fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        self.apply(data)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(self.apply(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SELECTORS: &[&str] = &[
        "none",
        "aes",
        "blowfish",
        "cast5",
        "sm4",
        "salsa20",
        "simplexor",
        "tripledes",
        "twofish",
    ];

    #[test]
    fn every_selector_round_trips() {
        for block in SELECTORS {
            let crypt = new_block(block, "sekrit");
            let plain = b"the quick brown fox".as_slice();
            let wire = crypt.encrypt(plain);
            let back = crypt.decrypt(&wire).unwrap();
            assert_eq!(back, plain, "cipher {block} did not round-trip");
        }
    }

    #[test]
    fn real_ciphers_change_the_wire_bytes() {
        for block in SELECTORS.iter().filter(|b| **b != "none") {
            let crypt = new_block(block, "sekrit");
            let plain = vec![0u8; 64];
            let wire = crypt.encrypt(&plain);
            assert_ne!(&wire[wire.len() - 64..], plain.as_slice(), "cipher {block} left plaintext");
        }
    }

    #[test]
    fn unknown_selector_degrades_to_noop() {
        let crypt = new_block("xtea", "sekrit");
        let plain = b"plain".as_slice();
        assert_eq!(crypt.encrypt(plain), plain);
    }

    #[test]
    fn wrong_key_does_not_round_trip() {
        let a = new_block("aes", "key-one");
        let b = new_block("aes", "key-two");
        let plain = b"confidential bytes".as_slice();
        let wire = a.encrypt(plain);
        assert_ne!(b.decrypt(&wire).unwrap(), plain);
    }
}
