//! The file key and the keys derived from it.

use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, Secret};

use crate::{
    error::DecryptError,
    format::HeaderV1,
    primitives::hkdf,
};

/// The length of an age file key.
pub(crate) const FILE_KEY_BYTES: usize = 16;

const MAC_KEY_LABEL: &[u8] = b"header";
const PAYLOAD_KEY_LABEL: &[u8] = b"payload";

/// The symmetric key protecting a single age file.
///
/// Generated once per file by the encryptor, wrapped by every recipient, and expanded
/// via HKDF into the header-MAC key and the payload stream key. Never exposed outside
/// the wrap/unwrap boundary; the backing bytes are zeroized on drop.
pub struct FileKey(Secret<[u8; FILE_KEY_BYTES]>);

impl From<[u8; FILE_KEY_BYTES]> for FileKey {
    fn from(file_key: [u8; FILE_KEY_BYTES]) -> Self {
        FileKey(Secret::new(file_key))
    }
}

impl FileKey {
    /// Samples a fresh file key from the OS CSPRNG.
    pub(crate) fn generate() -> Self {
        let mut file_key = [0; FILE_KEY_BYTES];
        OsRng.fill_bytes(&mut file_key);
        file_key.into()
    }

    pub(crate) fn expose_secret(&self) -> &[u8; FILE_KEY_BYTES] {
        self.0.expose_secret()
    }

    /// `HKDF-SHA256(ikm = file key, salt = empty, info = "header")`
    pub(crate) fn mac_key(&self) -> Secret<[u8; 32]> {
        Secret::new(hkdf(&[], MAC_KEY_LABEL, self.0.expose_secret()))
    }

    /// Derives the payload stream key, after verifying the header MAC.
    ///
    /// The MAC check gates the derivation so that no payload bytes are ever processed
    /// under a header that fails authentication.
    pub(crate) fn payload_key(
        &self,
        header: &HeaderV1,
        nonce: &[u8; 16],
    ) -> Result<Secret<[u8; 32]>, DecryptError> {
        header
            .verify_mac(self.mac_key().expose_secret())
            .map_err(|_| DecryptError::HeaderAuthentication)?;

        Ok(Secret::new(hkdf(
            nonce,
            PAYLOAD_KEY_LABEL,
            self.0.expose_secret(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::FileKey;
    use crate::format::{HeaderV1, Stanza};

    fn test_header(file_key: &FileKey) -> HeaderV1 {
        let stanzas = vec![Stanza {
            tag: "test".to_string(),
            args: vec![],
            body: vec![0; 32],
        }];
        HeaderV1::new(stanzas, file_key.mac_key().expose_secret())
    }

    #[test]
    fn payload_key_requires_valid_mac() {
        let file_key = FileKey::from(*b"YELLOW SUBMARINE");
        let mut header = test_header(&file_key);

        assert!(file_key.payload_key(&header, &[0; 16]).is_ok());

        header.mac[0] ^= 0x01;
        assert!(file_key.payload_key(&header, &[0; 16]).is_err());
    }

    #[test]
    fn payload_key_depends_on_nonce() {
        let file_key = FileKey::from(*b"YELLOW SUBMARINE");
        let header = test_header(&file_key);

        let a = file_key.payload_key(&header, &[0; 16]).unwrap();
        let b = file_key.payload_key(&header, &[1; 16]).unwrap();
        assert_ne!(a.expose_secret(), b.expose_secret());
    }
}
