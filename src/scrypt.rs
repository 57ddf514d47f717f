//! The passphrase-based recipient scheme.

use base64::{prelude::BASE64_STANDARD_NO_PAD, Engine};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroize;

use crate::{
    error::{DecryptError, EncryptError},
    format::Stanza,
    keys::{FileKey, FILE_KEY_BYTES},
    primitives::{aead_decrypt, aead_encrypt, scrypt},
};

pub(crate) const STANZA_TAG: &str = "scrypt";
const SALT_LABEL: &[u8] = b"age-encryption.org/v1/scrypt";

const SALT_BYTES: usize = 16;
const WRAPPED_FILE_KEY_BYTES: usize = FILE_KEY_BYTES + 16;

/// The largest base-2 logarithm of the scrypt work parameter that decryption will
/// perform. Matches the encrypt-side bound, so every file we produce is decryptable.
const MAX_WORK_FACTOR: u8 = 22;

/// The default work factor for new files, around one second on current hardware.
const DEFAULT_WORK_FACTOR: u8 = 18;

/// Wraps the file key under a passphrase with a fresh 16-byte salt.
///
/// A passphrase recipient is incompatible with every other recipient type: an age file
/// protected by a passphrase contains exactly one stanza.
pub struct Recipient {
    passphrase: SecretString,
    work_factor: u8,
}

impl Recipient {
    /// Creates a recipient wrapping to the given passphrase.
    ///
    /// This scheme is for passphrases provided by (or generated for) a human. For
    /// machine-to-machine use, generate an [`x25519::Identity`] instead.
    ///
    /// [`x25519::Identity`]: crate::x25519::Identity
    pub fn new(passphrase: SecretString) -> Self {
        Recipient {
            passphrase,
            work_factor: DEFAULT_WORK_FACTOR,
        }
    }

    /// Overrides the work factor (the base-2 logarithm of scrypt's N).
    pub fn set_work_factor(&mut self, log_n: u8) {
        self.work_factor = log_n;
    }
}

impl crate::Recipient for Recipient {
    fn wrap_file_key(&self, file_key: &FileKey) -> Result<Vec<Stanza>, EncryptError> {
        if !(1..=MAX_WORK_FACTOR).contains(&self.work_factor) {
            return Err(EncryptError::InvalidArgument(
                "scrypt work factor out of range",
            ));
        }

        let mut salt = [0; SALT_BYTES];
        OsRng.fill_bytes(&mut salt);

        let mut labelled_salt = [0; SALT_LABEL.len() + SALT_BYTES];
        labelled_salt[..SALT_LABEL.len()].copy_from_slice(SALT_LABEL);
        labelled_salt[SALT_LABEL.len()..].copy_from_slice(&salt);

        let mut wrap_key = scrypt(
            &labelled_salt,
            self.work_factor,
            self.passphrase.expose_secret(),
        )
        .expect("work factor is in range");
        let wrapped = aead_encrypt(&wrap_key, file_key.expose_secret());
        wrap_key.zeroize();

        Ok(vec![Stanza {
            tag: STANZA_TAG.to_string(),
            args: vec![
                BASE64_STANDARD_NO_PAD.encode(salt),
                format!("{}", self.work_factor),
            ],
            body: wrapped,
        }])
    }

    fn requires_sole_recipient(&self) -> bool {
        true
    }
}

/// Unwraps a file key wrapped to a passphrase.
pub struct Identity {
    passphrase: SecretString,
}

impl Identity {
    /// Creates an identity for the given passphrase.
    pub fn new(passphrase: SecretString) -> Self {
        Identity { passphrase }
    }
}

/// Parses the work-factor argument: plain decimal, no signs, no leading zeros.
fn parse_work_factor(arg: &str) -> Option<u8> {
    if arg.is_empty() || arg.starts_with('0') || !arg.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    arg.parse().ok()
}

impl crate::Identity for Identity {
    fn unwrap_stanza(&self, stanza: &Stanza) -> Option<Result<FileKey, DecryptError>> {
        if stanza.tag != STANZA_TAG {
            return None;
        }
        if stanza.args.len() != 2 {
            return Some(Err(DecryptError::Malformed(
                "scrypt stanza takes exactly two arguments",
            )));
        }
        let salt = match crate::util::base64_arg::<_, SALT_BYTES>(&stanza.args[0]) {
            Some(salt) => salt,
            None => return Some(Err(DecryptError::Malformed("invalid scrypt salt"))),
        };
        // Bounds are enforced before any key derivation happens.
        let log_n = match parse_work_factor(&stanza.args[1]) {
            Some(n) if (1..=MAX_WORK_FACTOR).contains(&n) => n,
            _ => {
                return Some(Err(DecryptError::Malformed(
                    "invalid scrypt work factor",
                )))
            }
        };
        if stanza.body.len() != WRAPPED_FILE_KEY_BYTES {
            return Some(Err(DecryptError::Malformed(
                "invalid scrypt stanza body length",
            )));
        }

        let mut labelled_salt = [0; SALT_LABEL.len() + SALT_BYTES];
        labelled_salt[..SALT_LABEL.len()].copy_from_slice(SALT_LABEL);
        labelled_salt[SALT_LABEL.len()..].copy_from_slice(&salt);

        let mut wrap_key = scrypt(&labelled_salt, log_n, self.passphrase.expose_secret())
            .expect("work factor is in range");
        let result = aead_decrypt(&wrap_key, FILE_KEY_BYTES, &stanza.body);
        wrap_key.zeroize();

        // The AEAD is not key-committing, so a failure here reveals only that the
        // passphrase does not open this stanza.
        result.ok().map(|mut pt| {
            let file_key: [u8; FILE_KEY_BYTES] = pt[..].try_into().unwrap();
            pt.zeroize();
            Ok(file_key.into())
        })
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::{parse_work_factor, Identity, Recipient};
    use crate::{error::DecryptError, Identity as _, Recipient as _};

    fn passphrase() -> SecretString {
        SecretString::new("correct horse".to_string())
    }

    #[test]
    fn round_trip() {
        let file_key = [7; 16].into();
        let mut recipient = Recipient::new(passphrase());
        recipient.set_work_factor(2);

        let stanzas = recipient.wrap_file_key(&file_key).unwrap();
        assert_eq!(stanzas.len(), 1);
        assert_eq!(stanzas[0].tag, "scrypt");
        assert_eq!(stanzas[0].args[1], "2");

        assert!(Identity::new(passphrase())
            .unwrap_stanzas(&stanzas)
            .unwrap()
            .is_ok());
    }

    #[test]
    fn wrong_passphrase_is_no_match() {
        let mut recipient = Recipient::new(passphrase());
        recipient.set_work_factor(2);
        let stanzas = recipient.wrap_file_key(&[7; 16].into()).unwrap();

        let wrong = Identity::new(SecretString::new("incorrect horse".to_string()));
        assert!(wrong.unwrap_stanzas(&stanzas).is_none());
    }

    #[test]
    fn work_factor_syntax() {
        assert_eq!(parse_work_factor("1"), Some(1));
        assert_eq!(parse_work_factor("22"), Some(22));
        // Leading zeros, signs, hex, and garbage are all rejected.
        for arg in ["02", "0", "00", "+2", "-2", "0x2", "2 ", " 2", "2a", ""] {
            assert_eq!(parse_work_factor(arg), None, "{:?}", arg);
        }
    }

    #[test]
    fn out_of_range_work_factor_is_malformed() {
        let mut recipient = Recipient::new(passphrase());
        recipient.set_work_factor(2);
        let mut stanza = recipient.wrap_file_key(&[7; 16].into()).unwrap().remove(0);

        let id = Identity::new(passphrase());
        for arg in ["23", "64", "0", "02", "255"] {
            stanza.args[1] = arg.to_string();
            assert!(
                matches!(
                    id.unwrap_stanza(&stanza),
                    Some(Err(DecryptError::Malformed(_)))
                ),
                "{:?}",
                arg
            );
        }
    }

    #[test]
    fn encrypt_side_work_factor_bound() {
        let mut recipient = Recipient::new(passphrase());
        recipient.set_work_factor(23);
        assert!(recipient.wrap_file_key(&[7; 16].into()).is_err());
    }
}
