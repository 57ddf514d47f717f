//! *Library for encrypting and decrypting age files*
//!
//! This crate implements file encryption according to the [age-encryption.org/v1]
//! specification: the textual header with its authenticated stanza list, the chunked
//! ChaCha20-Poly1305 payload, the native X25519 and passphrase recipient schemes, and
//! the client side of the plugin protocol.
//!
//! - For most uses, encrypt with [`x25519::Recipient`] and decrypt with
//!   [`x25519::Identity`]. The [`encrypt`] and [`decrypt`] functions cover in-memory
//!   data; [`Encryptor`] and [`Decryptor`] stream through any reader or writer.
//! - Passphrase protection ([`scrypt`]) is for passphrases provided by, or generated
//!   for, a human.
//! - Hardware tokens and other external schemes are reached through `age-plugin-*`
//!   binaries via the [`plugin`] module.
//!
//! [age-encryption.org/v1]: https://age-encryption.org/v1
//!
//! # Examples
//!
//! ```
//! let key = vintage::x25519::Identity::generate();
//!
//! let ciphertext = vintage::encrypt(key.to_public(), b"Hello world!")?;
//! let plaintext = vintage::decrypt(&key, &ciphertext)?;
//!
//! assert_eq!(plaintext, b"Hello world!");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

mod error;
mod format;
mod keys;
mod primitives;
mod protocol;
mod simple;
mod util;

pub mod plugin;
pub mod scrypt;
pub mod testkit;
pub mod x25519;

pub use error::{DecryptError, EncryptError, PluginFailure};
pub use format::Stanza;
pub use keys::FileKey;
pub use primitives::stream;
pub use protocol::{decryptor, Decryptor, Encryptor};
pub use simple::{decrypt, decrypt_with_passphrase, encrypt};

/// A value that can wrap a file key to itself, producing header stanzas.
///
/// The age format dispatches on stanzas, not recipients, so one recipient may emit
/// several stanzas. The file key is the [one joint] of the format: everything a
/// recipient scheme does happens inside `wrap_file_key`.
///
/// [one joint]: https://www.imperialviolet.org/2016/05/16/agility.html
pub trait Recipient {
    /// Wraps `file_key`, returning the stanzas to place in the header.
    fn wrap_file_key(&self, file_key: &FileKey) -> Result<Vec<Stanza>, EncryptError>;

    /// Whether this recipient type must be the only one a file is encrypted to.
    ///
    /// Passphrase recipients return true: mixing them with anything else silently
    /// downgrades the file to the weakest protection, so the encryptor refuses.
    fn requires_sole_recipient(&self) -> bool {
        false
    }
}

/// A value that can recover the file key from the stanzas that wrap it.
pub trait Identity {
    /// Attempts to unwrap a single stanza.
    ///
    /// Returns:
    /// - `Some(Ok(file_key))` if this identity unwrapped the stanza.
    /// - `Some(Err(e))` if the stanza is for this identity but unusable; this aborts
    ///   the whole trial.
    /// - `None` if the stanza does not match this identity.
    fn unwrap_stanza(&self, stanza: &Stanza) -> Option<Result<FileKey, DecryptError>>;

    /// Attempts to unwrap any of the file's stanzas.
    ///
    /// Implementations that pay per attempt (such as plugins) override this to see
    /// the whole header at once.
    fn unwrap_stanzas(&self, stanzas: &[Stanza]) -> Option<Result<FileKey, DecryptError>> {
        stanzas.iter().find_map(|stanza| self.unwrap_stanza(stanza))
    }
}
