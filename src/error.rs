//! Error types.

use std::fmt;
use std::io;

use crate::primitives::stream::PayloadError;

/// Details of a plugin that failed while wrapping or unwrapping a file key.
///
/// Produced when a plugin sends an `error` stanza, or exits with a non-zero status.
#[derive(Clone, Debug)]
pub struct PluginFailure {
    /// The plugin binary name (`age-plugin-<name>`).
    pub binary_name: String,
    /// The error text reported over the protocol, if any.
    pub message: String,
    /// Captured standard error of the plugin process, when it exited non-zero.
    pub stderr: Option<String>,
}

impl fmt::Display for PluginFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.binary_name, self.message)?;
        if let Some(stderr) = self.stderr.as_deref().filter(|s| !s.is_empty()) {
            write!(f, "\nplugin stderr:\n{}", stderr)?;
        }
        Ok(())
    }
}

/// The errors that can occur while creating an age file.
#[derive(Debug)]
pub enum EncryptError {
    /// The caller-supplied configuration was unusable: an empty recipient list, or a
    /// passphrase recipient mixed with other recipient types.
    InvalidArgument(&'static str),
    /// An I/O error occurred during encryption.
    Io(io::Error),
    /// A required plugin binary could not be found in `$PATH`.
    MissingPlugin {
        /// The plugin's binary name.
        binary_name: String,
    },
    /// A plugin reported an error or exited unsuccessfully.
    Plugin(PluginFailure),
    /// A plugin completed the wrapping conversation without producing any stanzas.
    EmptyPluginResponse {
        /// The plugin's binary name.
        binary_name: String,
    },
    /// A required user callback was absent or declined.
    ///
    /// Plugin prompts never produce this: a refused prompt is answered with `fail`
    /// and the session continues. The kind exists for callers that layer their own
    /// interaction on top of these APIs.
    CallbackRefused,
}

impl From<io::Error> for EncryptError {
    fn from(e: io::Error) -> Self {
        EncryptError::Io(e)
    }
}

impl fmt::Display for EncryptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncryptError::InvalidArgument(detail) => write!(f, "invalid argument: {}", detail),
            EncryptError::Io(e) => e.fmt(f),
            EncryptError::MissingPlugin { binary_name } => {
                write!(f, "could not find {} in $PATH", binary_name)
            }
            EncryptError::Plugin(failure) => failure.fmt(f),
            EncryptError::EmptyPluginResponse { binary_name } => {
                write!(f, "{} returned no recipient stanzas", binary_name)
            }
            EncryptError::CallbackRefused => {
                f.write_str("a required callback was absent or declined")
            }
        }
    }
}

/// The errors that can occur while decrypting an age file.
#[derive(Debug)]
pub enum DecryptError {
    /// A syntactic failure in the header, a stanza, Base64, or Bech32.
    Malformed(&'static str),
    /// The version line names a format we do not implement.
    UnsupportedVersion(String),
    /// The header MAC did not verify.
    HeaderAuthentication,
    /// Every supplied identity refused every stanza in the header.
    NoIdentityMatch,
    /// A plugin completed its conversation without producing a file key.
    IncorrectIdentity,
    /// A payload chunk failed to authenticate.
    PayloadAuthentication,
    /// The payload ended before its final chunk.
    TruncatedPayload,
    /// A required plugin binary could not be found in `$PATH`.
    MissingPlugin {
        /// The plugin's binary name.
        binary_name: String,
    },
    /// A plugin reported an error or exited unsuccessfully.
    Plugin(PluginFailure),
    /// A required user callback was absent or declined.
    ///
    /// Plugin prompts never produce this: a refused prompt is answered with `fail`
    /// and the session continues. The kind exists for callers that layer their own
    /// interaction on top of these APIs.
    CallbackRefused,
    /// An I/O error occurred during decryption.
    Io(io::Error),
}

impl From<io::Error> for DecryptError {
    fn from(e: io::Error) -> Self {
        DecryptError::Io(e)
    }
}

impl DecryptError {
    /// Converts an error returned while reading the payload into its decryption
    /// meaning.
    pub(crate) fn from_payload_io(e: io::Error) -> Self {
        match PayloadError::unwrap_from(&e) {
            Some(PayloadError::Authentication) => DecryptError::PayloadAuthentication,
            Some(PayloadError::Truncated) => DecryptError::TruncatedPayload,
            Some(PayloadError::TrailingData) => {
                DecryptError::Malformed("trailing data after the final payload chunk")
            }
            None => DecryptError::Io(e),
        }
    }
}

impl fmt::Display for DecryptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecryptError::Malformed(detail) => write!(f, "malformed age file: {}", detail),
            DecryptError::UnsupportedVersion(v) => {
                write!(f, "unsupported age format version {:?}", v)
            }
            DecryptError::HeaderAuthentication => f.write_str("header MAC did not verify"),
            DecryptError::NoIdentityMatch => {
                f.write_str("no identity matched any of the recipients")
            }
            DecryptError::IncorrectIdentity => f.write_str("incorrect identity for this file"),
            DecryptError::PayloadAuthentication => {
                f.write_str("payload chunk failed to authenticate")
            }
            DecryptError::TruncatedPayload => f.write_str("payload is truncated"),
            DecryptError::MissingPlugin { binary_name } => {
                write!(f, "could not find {} in $PATH", binary_name)
            }
            DecryptError::Plugin(failure) => failure.fmt(f),
            DecryptError::CallbackRefused => {
                f.write_str("a required callback was absent or declined")
            }
            DecryptError::Io(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for DecryptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecryptError::Io(inner) => Some(inner),
            _ => None,
        }
    }
}

impl std::error::Error for EncryptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EncryptError::Io(inner) => Some(inner),
            _ => None,
        }
    }
}
