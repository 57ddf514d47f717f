//! Encryption and decryption drivers.

use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, Secret, SecretString};
use std::io::{self, Read, Write};

use crate::{
    error::{DecryptError, EncryptError},
    format::{Header, HeaderV1},
    keys::FileKey,
    primitives::stream::{Stream, StreamWriter},
    scrypt, Recipient,
};

pub mod decryptor;

/// The 16-byte random value written between the header and the first payload chunk,
/// from which the payload stream key is derived.
pub(crate) struct PayloadNonce([u8; 16]);

impl PayloadNonce {
    fn random() -> Self {
        let mut nonce = [0; 16];
        OsRng.fill_bytes(&mut nonce);
        PayloadNonce(nonce)
    }

    fn read<R: Read>(input: &mut R) -> Result<Self, DecryptError> {
        let mut nonce = [0; 16];
        input.read_exact(&mut nonce).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                DecryptError::TruncatedPayload
            } else {
                DecryptError::Io(e)
            }
        })?;
        Ok(PayloadNonce(nonce))
    }
}

/// Encryptor for an age file.
pub struct Encryptor {
    recipients: Vec<Box<dyn Recipient>>,
}

impl Encryptor {
    /// Returns an `Encryptor` that will encrypt to every recipient in the list.
    ///
    /// Fails if the list is empty, or if a passphrase recipient is mixed with any
    /// other recipient: a passphrase must be the sole protection of a file.
    pub fn with_recipients(recipients: Vec<Box<dyn Recipient>>) -> Result<Self, EncryptError> {
        if recipients.is_empty() {
            return Err(EncryptError::InvalidArgument("no recipients"));
        }
        if recipients.len() > 1 && recipients.iter().any(|r| r.requires_sole_recipient()) {
            return Err(EncryptError::InvalidArgument(
                "a passphrase recipient cannot be combined with other recipients",
            ));
        }
        Ok(Encryptor { recipients })
    }

    /// Returns an `Encryptor` that will encrypt to a passphrase.
    ///
    /// Only use this with a passphrase provided by (or generated for) a human. For
    /// automated workflows, generate an [`x25519::Identity`] instead.
    ///
    /// [`x25519::Identity`]: crate::x25519::Identity
    pub fn with_user_passphrase(passphrase: SecretString) -> Self {
        Encryptor {
            recipients: vec![Box::new(scrypt::Recipient::new(passphrase))],
        }
    }

    fn prepare_header(self) -> Result<(Header, PayloadNonce, Secret<[u8; 32]>), EncryptError> {
        let file_key = FileKey::generate();

        let mut stanzas = vec![];
        for recipient in &self.recipients {
            stanzas.extend(recipient.wrap_file_key(&file_key)?);
        }

        let header = HeaderV1::new(stanzas, file_key.mac_key().expose_secret());
        let nonce = PayloadNonce::random();
        let payload_key = file_key
            .payload_key(&header, &nonce.0)
            .expect("a freshly computed MAC verifies");

        Ok((Header::V1(header), nonce, payload_key))
    }

    /// Wraps `output` in a writer that encrypts its input.
    ///
    /// The header (stanzas then MAC) and the payload nonce are written before this
    /// returns; payload chunks follow as data is written. You **must** call
    /// [`StreamWriter::finish`] when done, or the file will be truncated and fail to
    /// decrypt.
    pub fn wrap_output<W: Write>(self, mut output: W) -> Result<StreamWriter<W>, EncryptError> {
        let (header, nonce, payload_key) = self.prepare_header()?;
        header.write(&mut output)?;
        output.write_all(&nonce.0)?;
        Ok(Stream::encrypt(&payload_key, output))
    }
}

/// Decryptor for an age file, split by how the file key is protected.
pub enum Decryptor<R: Read> {
    /// The file is encrypted to a list of recipients, and needs identities.
    Recipients(decryptor::RecipientsDecryptor<R>),
    /// The file is encrypted to a passphrase.
    Passphrase(decryptor::PassphraseDecryptor<R>),
}

impl<R: Read> Decryptor<R> {
    /// Reads the header of an age file and prepares to decrypt it.
    pub fn new(mut input: R) -> Result<Self, DecryptError> {
        match Header::read(&mut input)? {
            Header::V1(header) => {
                let any_scrypt = header
                    .stanzas
                    .iter()
                    .any(|s| s.tag == scrypt::STANZA_TAG);

                if any_scrypt && header.stanzas.len() == 1 {
                    Ok(Decryptor::Passphrase(decryptor::PassphraseDecryptor::new(
                        input, header,
                    )))
                } else if !any_scrypt {
                    Ok(Decryptor::Recipients(decryptor::RecipientsDecryptor::new(
                        input, header,
                    )))
                } else {
                    // A passphrase-protected file has exactly one stanza.
                    Err(DecryptError::Malformed(
                        "an scrypt stanza must be the only stanza in the header",
                    ))
                }
            }
            Header::Unknown(version) => Err(DecryptError::UnsupportedVersion(version)),
        }
    }
}
