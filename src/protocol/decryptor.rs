//! Decryptors for the two ways an age file key can be protected.

use secrecy::SecretString;
use std::io::Read;

use crate::{
    error::DecryptError,
    format::HeaderV1,
    keys::FileKey,
    primitives::stream::{Stream, StreamReader},
    protocol::PayloadNonce,
    scrypt, Identity,
};

struct BaseDecryptor<R: Read> {
    /// The age file, positioned at the payload nonce.
    input: R,
    header: HeaderV1,
}

impl<R: Read> BaseDecryptor<R> {
    /// Runs the identity trial, then authenticates the header and keys the payload
    /// stream.
    ///
    /// The trial visits identities in the caller's order, so any plugin prompts occur
    /// predictably. A `None` from an identity is local to that identity; any error is
    /// surfaced immediately.
    fn unseal<F>(mut self, trial: F) -> Result<StreamReader<R>, DecryptError>
    where
        F: FnOnce(&[crate::Stanza]) -> Option<Result<FileKey, DecryptError>>,
    {
        let file_key = trial(&self.header.stanzas)
            .unwrap_or(Err(DecryptError::NoIdentityMatch))?;

        let nonce = PayloadNonce::read(&mut self.input)?;
        let payload_key = file_key.payload_key(&self.header, &nonce.0)?;
        Ok(Stream::decrypt(&payload_key, self.input))
    }
}

/// Decryptor for an age file encrypted to a list of recipients.
pub struct RecipientsDecryptor<R: Read>(BaseDecryptor<R>);

impl<R: Read> RecipientsDecryptor<R> {
    pub(crate) fn new(input: R, header: HeaderV1) -> Self {
        RecipientsDecryptor(BaseDecryptor { input, header })
    }

    /// Attempts to decrypt the file with the given identities, in order.
    ///
    /// On success, returns a reader yielding the plaintext. The reader authenticates
    /// every chunk; errors it returns can be classified with
    /// [`PayloadError::unwrap_from`].
    ///
    /// [`PayloadError::unwrap_from`]: crate::stream::PayloadError::unwrap_from
    pub fn decrypt<'a>(
        self,
        identities: impl Iterator<Item = &'a dyn Identity>,
    ) -> Result<StreamReader<R>, DecryptError> {
        self.0
            .unseal(|stanzas| identities.into_iter().find_map(|id| id.unwrap_stanzas(stanzas)))
    }
}

/// Decryptor for an age file encrypted to a passphrase.
pub struct PassphraseDecryptor<R: Read>(BaseDecryptor<R>);

impl<R: Read> PassphraseDecryptor<R> {
    pub(crate) fn new(input: R, header: HeaderV1) -> Self {
        PassphraseDecryptor(BaseDecryptor { input, header })
    }

    /// Attempts to decrypt the file with a passphrase.
    ///
    /// Decryption performs at most one scrypt derivation, bounded at work factor 22.
    pub fn decrypt(self, passphrase: &SecretString) -> Result<StreamReader<R>, DecryptError> {
        let identity = scrypt::Identity::new(passphrase.clone());
        self.0.unseal(|stanzas| identity.unwrap_stanzas(stanzas))
    }
}
