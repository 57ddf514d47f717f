//! The cryptographic primitives underlying the age format.

use chacha20poly1305::{
    aead::{self, generic_array::typenum::Unsigned, Aead, AeadCore, KeyInit},
    ChaCha20Poly1305,
};
use hkdf::Hkdf;
use hmac::{digest::MacError, Hmac, Mac};
use scrypt::{errors::InvalidParams, Params as ScryptParams};
use sha2::Sha256;
use std::io::{self, Write};

pub mod stream;

/// `encrypt[key](plaintext)` - one-shot ChaCha20-Poly1305 with a zero nonce.
///
/// The nonce may be fixed because every key passed here is single-use.
pub(crate) fn aead_encrypt(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let c = ChaCha20Poly1305::new(key.into());
    c.encrypt(&[0; 12].into(), plaintext)
        .expect("plaintext is far below the ChaCha20 block limit")
}

/// `decrypt[key](ciphertext)` - opens a message of a known fixed size.
///
/// Requiring the expected size up front limits the reach of multi-key attacks against
/// the non-committing AEAD: a ciphertext this short can be crafted to open under at
/// most two keys.
pub(crate) fn aead_decrypt(
    key: &[u8; 32],
    size: usize,
    ciphertext: &[u8],
) -> Result<Vec<u8>, aead::Error> {
    if ciphertext.len() != size + <ChaCha20Poly1305 as AeadCore>::TagSize::to_usize() {
        return Err(aead::Error);
    }

    let c = ChaCha20Poly1305::new(key.into());
    c.decrypt(&[0; 12].into(), ciphertext)
}

/// `HKDF[salt, label](ikm, 32)` - HKDF from RFC 5869 with SHA-256.
pub(crate) fn hkdf(salt: &[u8], label: &[u8], ikm: &[u8]) -> [u8; 32] {
    let mut okm = [0; 32];
    Hkdf::<Sha256>::new(Some(salt), ikm)
        .expand(label, &mut okm)
        .expect("okm is the correct length");
    okm
}

/// `scrypt[salt, N](password)` - scrypt from RFC 7914 with r = 8, p = 1.
pub(crate) fn scrypt(salt: &[u8], log_n: u8, password: &str) -> Result<[u8; 32], InvalidParams> {
    let params = ScryptParams::new(log_n, 8, 1, 32)?;

    let mut output = [0; 32];
    scrypt::scrypt(password.as_bytes(), salt, &params, &mut output)
        .expect("output is the correct length");
    Ok(output)
}

/// A [`Write`] adapter that feeds everything written to it into HMAC-SHA256.
///
/// Lets the header serializer compute or verify the header MAC without materialising
/// the covered bytes separately.
pub(crate) struct HmacWriter {
    inner: Hmac<Sha256>,
}

impl HmacWriter {
    pub(crate) fn new(key: &[u8; 32]) -> Self {
        HmacWriter {
            inner: Mac::new_from_slice(key).expect("HMAC accepts any key length"),
        }
    }

    pub(crate) fn finalize(self) -> [u8; 32] {
        self.inner.finalize().into_bytes().into()
    }

    /// Constant-time comparison against a claimed MAC.
    pub(crate) fn verify(self, mac: &[u8]) -> Result<(), MacError> {
        self.inner.verify_slice(mac)
    }
}

impl Write for HmacWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.inner.update(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{aead_decrypt, aead_encrypt, hkdf, HmacWriter};
    use std::io::Write;

    #[test]
    fn aead_round_trip() {
        let key = [14; 32];
        let plaintext = b"12345678";
        let encrypted = aead_encrypt(&key, plaintext);
        let decrypted = aead_decrypt(&key, plaintext.len(), &encrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn aead_decrypt_wrong_size() {
        let key = [14; 32];
        let encrypted = aead_encrypt(&key, b"12345678");
        assert!(aead_decrypt(&key, 7, &encrypted).is_err());
        assert!(aead_decrypt(&key, 9, &encrypted).is_err());
    }

    #[test]
    fn hkdf_labels_are_distinct() {
        let ikm = [7; 16];
        assert_ne!(hkdf(&[], b"header", &ikm), hkdf(&[], b"payload", &ikm));
    }

    #[test]
    fn hmac_writer_matches_incremental_input() {
        let key = [3; 32];

        let mut whole = HmacWriter::new(&key);
        whole.write_all(b"age-encryption.org/v1\n---").unwrap();

        let mut split = HmacWriter::new(&key);
        split.write_all(b"age-encryption.org/").unwrap();
        split.write_all(b"v1\n").unwrap();
        split.write_all(b"---").unwrap();

        assert_eq!(whole.finalize(), split.finalize());
    }
}
