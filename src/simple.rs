//! Single-call encryption and decryption for in-memory data.

use secrecy::SecretString;
use std::io::{Read, Write};
use std::iter;

use crate::{
    error::{DecryptError, EncryptError},
    Decryptor, Encryptor, Identity, Recipient,
};

/// Encrypts `plaintext` to a single recipient, returning the age file bytes.
///
/// To encrypt to more than one recipient, use [`Encryptor::with_recipients`].
pub fn encrypt(
    recipient: impl Recipient + 'static,
    plaintext: &[u8],
) -> Result<Vec<u8>, EncryptError> {
    let encryptor = Encryptor::with_recipients(vec![Box::new(recipient)])?;

    let mut ciphertext = Vec::with_capacity(plaintext.len());
    let mut writer = encryptor.wrap_output(&mut ciphertext)?;
    writer.write_all(plaintext)?;
    writer.finish()?;

    Ok(ciphertext)
}

/// Decrypts an age file with a single identity, returning the plaintext.
///
/// To try several identities, use [`Decryptor`]. Passphrase-protected files need
/// [`decrypt_with_passphrase`].
pub fn decrypt(identity: &impl Identity, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptError> {
    match Decryptor::new(ciphertext)? {
        Decryptor::Recipients(d) => {
            read_all(d.decrypt(iter::once(identity as &dyn Identity))?)
        }
        Decryptor::Passphrase(_) => Err(DecryptError::NoIdentityMatch),
    }
}

/// Decrypts a passphrase-protected age file, returning the plaintext.
pub fn decrypt_with_passphrase(
    passphrase: &SecretString,
    ciphertext: &[u8],
) -> Result<Vec<u8>, DecryptError> {
    match Decryptor::new(ciphertext)? {
        Decryptor::Passphrase(d) => read_all(d.decrypt(passphrase)?),
        Decryptor::Recipients(_) => Err(DecryptError::NoIdentityMatch),
    }
}

fn read_all(mut reader: impl Read) -> Result<Vec<u8>, DecryptError> {
    let mut plaintext = vec![];
    reader
        .read_to_end(&mut plaintext)
        .map_err(DecryptError::from_payload_io)?;
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::{decrypt, decrypt_with_passphrase, encrypt};
    use crate::{scrypt, x25519, DecryptError};

    #[test]
    fn x25519_one_shot_round_trip() {
        let id = x25519::Identity::generate();
        let encrypted = encrypt(id.to_public(), b"one-shot message").unwrap();
        assert_eq!(decrypt(&id, &encrypted).unwrap(), b"one-shot message");
    }

    #[test]
    fn passphrase_one_shot_round_trip() {
        let passphrase = SecretString::new("kilimanjaro".to_string());
        let mut recipient = scrypt::Recipient::new(passphrase.clone());
        recipient.set_work_factor(2);

        let encrypted = encrypt(recipient, b"A").unwrap();
        assert_eq!(
            decrypt_with_passphrase(&passphrase, &encrypted).unwrap(),
            b"A"
        );

        // The key-based entry point refuses passphrase files rather than prompting.
        let id = x25519::Identity::generate();
        assert!(matches!(
            decrypt(&id, &encrypted),
            Err(DecryptError::NoIdentityMatch)
        ));
    }

    #[test]
    fn payload_corruption_is_classified() {
        let id = x25519::Identity::generate();
        let mut encrypted = encrypt(id.to_public(), b"to be corrupted").unwrap();

        let last = encrypted.len() - 1;
        encrypted[last] ^= 0x01;
        assert!(matches!(
            decrypt(&id, &encrypted),
            Err(DecryptError::PayloadAuthentication)
        ));

        encrypted[last] ^= 0x01;
        let truncated = &encrypted[..encrypted.len() - 17];
        assert!(matches!(
            decrypt(&id, truncated),
            Err(DecryptError::PayloadAuthentication)
        ));
    }

    #[test]
    fn missing_final_chunk_is_truncated() {
        let id = x25519::Identity::generate();
        let encrypted = encrypt(id.to_public(), b"").unwrap();
        // Drop the entire (empty) final chunk, leaving header and nonce intact.
        let truncated = &encrypted[..encrypted.len() - 16];
        assert!(matches!(
            decrypt(&id, truncated),
            Err(DecryptError::TruncatedPayload)
        ));
    }

    #[test]
    fn trailing_data_is_malformed() {
        let id = x25519::Identity::generate();
        // A full final chunk, so the trailing garbage lands in its own read.
        let mut encrypted = encrypt(id.to_public(), &vec![7; 64 * 1024]).unwrap();
        encrypted.extend_from_slice(b"garbage");
        assert!(matches!(
            decrypt(&id, &encrypted),
            Err(DecryptError::Malformed(_))
        ));
    }

    #[test]
    fn header_mac_flip_fails_authentication() {
        let id = x25519::Identity::generate();
        let mut encrypted = encrypt(id.to_public(), b"payload").unwrap();

        // Change one symbol of the encoded MAC. The stanza is untouched, so the
        // identity still unwraps the file key, and the MAC check must catch it.
        let footer = encrypted
            .windows(4)
            .position(|w| w == b"--- ")
            .unwrap();
        let target = footer + 4;
        encrypted[target] = if encrypted[target] == b'A' { b'B' } else { b'A' };

        assert!(matches!(
            decrypt(&id, &encrypted),
            Err(DecryptError::HeaderAuthentication)
        ));
    }
}
