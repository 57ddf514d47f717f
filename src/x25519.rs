//! The native X25519 recipient scheme.

use base64::{prelude::BASE64_STANDARD_NO_PAD, Engine};
use bech32::{ToBase32, Variant};
use rand::rngs::OsRng;
use secrecy::SecretString;
use std::fmt;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::{
    error::{DecryptError, EncryptError},
    format::Stanza,
    keys::{FileKey, FILE_KEY_BYTES},
    primitives::{aead_decrypt, aead_encrypt, hkdf},
    util::{base64_arg, parse_bech32},
};

// Lower-case for encoding; the identity is presented upper-case per the age spec.
const IDENTITY_HRP: &str = "age-secret-key-";
const RECIPIENT_HRP: &str = "age";

const STANZA_TAG: &str = "X25519";
const WRAP_KEY_LABEL: &[u8] = b"age-encryption.org/v1/X25519";

const SHARE_BYTES: usize = 32;
const WRAPPED_FILE_KEY_BYTES: usize = FILE_KEY_BYTES + 16;

/// An X25519 secret key, able to decrypt files encrypted to its [`Recipient`].
///
/// Encoded as Bech32 with the HRP `AGE-SECRET-KEY-`, in upper case.
#[derive(Clone)]
pub struct Identity(StaticSecret);

impl std::str::FromStr for Identity {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hrp, bytes) = parse_bech32(s).ok_or("invalid Bech32 encoding")?;
        if hrp != IDENTITY_HRP {
            return Err("incorrect HRP");
        }
        <[u8; 32]>::try_from(&bytes[..])
            .map_err(|_| "incorrect identity length")
            .map(StaticSecret::from)
            .map(Identity)
    }
}

impl Identity {
    /// Generates a fresh identity from the OS CSPRNG.
    pub fn generate() -> Self {
        Identity(StaticSecret::random_from_rng(OsRng))
    }

    /// Serializes this identity in its Bech32 presentation.
    pub fn to_encoded(&self) -> SecretString {
        let mut sk_bytes = self.0.to_bytes();
        let mut encoded = bech32::encode(IDENTITY_HRP, sk_bytes.to_base32(), Variant::Bech32)
            .expect("HRP is valid");
        let ret = SecretString::new(encoded.to_uppercase());

        sk_bytes.zeroize();
        encoded.zeroize();

        ret
    }

    /// Returns the recipient this identity can decrypt for.
    pub fn to_public(&self) -> Recipient {
        Recipient((&self.0).into())
    }
}

impl crate::Identity for Identity {
    fn unwrap_stanza(&self, stanza: &Stanza) -> Option<Result<FileKey, DecryptError>> {
        if stanza.tag != STANZA_TAG {
            return None;
        }
        if stanza.args.len() != 1 {
            return Some(Err(DecryptError::Malformed(
                "X25519 stanza takes exactly one argument",
            )));
        }
        let share: PublicKey = match base64_arg::<_, SHARE_BYTES>(&stanza.args[0]) {
            Some(bytes) => bytes.into(),
            None => {
                return Some(Err(DecryptError::Malformed(
                    "invalid X25519 ephemeral share",
                )))
            }
        };
        if stanza.body.len() != WRAPPED_FILE_KEY_BYTES {
            return Some(Err(DecryptError::Malformed(
                "invalid X25519 stanza body length",
            )));
        }

        let shared_secret = self.0.diffie_hellman(&share);
        if shared_secret.as_bytes().iter().all(|&b| b == 0) {
            // A low-order share produces an all-zero secret independent of our key.
            return Some(Err(DecryptError::Malformed("unusable X25519 share")));
        }

        let pk: PublicKey = (&self.0).into();
        let mut salt = [0; 64];
        salt[..32].copy_from_slice(share.as_bytes());
        salt[32..].copy_from_slice(pk.as_bytes());

        let mut wrap_key = hkdf(&salt, WRAP_KEY_LABEL, shared_secret.as_bytes());
        let result = aead_decrypt(&wrap_key, FILE_KEY_BYTES, &stanza.body);
        wrap_key.zeroize();

        // An AEAD failure means the stanza was wrapped to some other key; it is
        // indistinguishable from random and therefore not an error.
        result.ok().map(|mut pt| {
            let file_key: [u8; FILE_KEY_BYTES] = pt[..].try_into().unwrap();
            pt.zeroize();
            Ok(file_key.into())
        })
    }
}

/// An X25519 public key that files can be encrypted to.
///
/// Encoded as Bech32 with the HRP `age`, in lower case. The encrypted file does not
/// reveal which recipient it was encrypted to.
#[derive(Clone)]
pub struct Recipient(PublicKey);

impl std::str::FromStr for Recipient {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hrp, bytes) = parse_bech32(s).ok_or("invalid Bech32 encoding")?;
        if hrp != RECIPIENT_HRP {
            return Err("incorrect HRP");
        }
        <[u8; 32]>::try_from(&bytes[..])
            .map_err(|_| "incorrect recipient length")
            .map(PublicKey::from)
            .map(Recipient)
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(
            &bech32::encode(RECIPIENT_HRP, self.0.as_bytes().to_base32(), Variant::Bech32)
                .expect("HRP is valid"),
        )
    }
}

impl crate::Recipient for Recipient {
    fn wrap_file_key(&self, file_key: &FileKey) -> Result<Vec<Stanza>, EncryptError> {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let share = PublicKey::from(&ephemeral);
        let shared_secret = ephemeral.diffie_hellman(&self.0);
        if shared_secret.as_bytes().iter().all(|&b| b == 0) {
            // Only reachable if the recipient key itself is low-order.
            return Err(EncryptError::InvalidArgument("unusable X25519 recipient"));
        }

        let mut salt = [0; 64];
        salt[..32].copy_from_slice(share.as_bytes());
        salt[32..].copy_from_slice(self.0.as_bytes());

        let mut wrap_key = hkdf(&salt, WRAP_KEY_LABEL, shared_secret.as_bytes());
        let wrapped = aead_encrypt(&wrap_key, file_key.expose_secret());
        wrap_key.zeroize();

        Ok(vec![Stanza {
            tag: STANZA_TAG.to_string(),
            args: vec![BASE64_STANDARD_NO_PAD.encode(share.as_bytes())],
            body: wrapped,
        }])
    }
}
