//! Delegation of wrapping and unwrapping to external plugin binaries.
//!
//! A plugin is a binary named `age-plugin-<name>` speaking the `recipient-v1` or
//! `identity-v1` protocol over its standard streams. Set `AGEDEBUG=plugin` to tee the
//! whole conversation to stderr.

use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use crate::{
    error::{DecryptError, EncryptError, PluginFailure},
    format::Stanza,
    keys::FileKey,
    plugin::connection::{Connection, SessionReport},
    util::parse_bech32,
};

pub(crate) mod connection;

// Plugin encodings use the HRPs age1<name> and AGE-PLUGIN-<NAME>-.
const RECIPIENT_HRP_PREFIX: &str = "age1";
const IDENTITY_HRP_PREFIX: &str = "age-plugin-";

const RECIPIENT_V1: &str = "recipient-v1";
const IDENTITY_V1: &str = "identity-v1";

const CMD_ADD_RECIPIENT: &str = "add-recipient";
const CMD_ADD_IDENTITY: &str = "add-identity";
const CMD_WRAP_FILE_KEY: &str = "wrap-file-key";
const CMD_RECIPIENT_STANZA: &str = "recipient-stanza";
const CMD_FILE_KEY: &str = "file-key";
const CMD_MSG: &str = "msg";
const CMD_REQUEST_PUBLIC: &str = "request-public";
const CMD_REQUEST_SECRET: &str = "request-secret";
const CMD_ERROR: &str = "error";
const CMD_DONE: &str = "done";

const REPLY_OK: &str = "ok";
const REPLY_FAIL: &str = "fail";
const REPLY_UNSUPPORTED: &str = "unsupported";

fn binary_name(plugin_name: &str) -> String {
    format!("age-plugin-{}", plugin_name)
}

/// User-interaction hooks a plugin may invoke during a session.
///
/// Both hooks are optional. When a plugin asks for one that is absent, the client
/// replies `fail` to that request and the session continues; it never blocks.
#[derive(Clone, Default)]
pub struct Callbacks {
    /// Shows a message from the plugin to the user.
    pub display_message: Option<Arc<dyn Fn(&str) -> Result<(), ()> + Send + Sync>>,
    /// Obtains a value from the user; `secret` is true for values that must not be
    /// echoed (passphrases, PINs).
    pub request_value: Option<Arc<dyn Fn(&str, bool) -> Result<SecretString, ()> + Send + Sync>>,
}

impl Callbacks {
    /// Answers one interaction stanza, replying `fail` when the matching hook is
    /// absent or declines.
    fn answer<R: Read, W: Write>(
        &self,
        conn: &mut Connection<R, W>,
        stanza: &Stanza,
    ) -> std::io::Result<()> {
        let message = String::from_utf8_lossy(&stanza.body);
        match stanza.tag.as_str() {
            CMD_MSG => match &self.display_message {
                Some(cb) if cb(&message).is_ok() => conn.send_command(REPLY_OK, &[], &[]),
                _ => conn.send_command(REPLY_FAIL, &[], &[]),
            },
            _ => {
                let secret = stanza.tag == CMD_REQUEST_SECRET;
                match self.request_value.as_ref().and_then(|cb| cb(&message, secret).ok()) {
                    Some(value) => {
                        conn.send_command(REPLY_OK, &[], value.expose_secret().as_bytes())
                    }
                    None => conn.send_command(REPLY_FAIL, &[], &[]),
                }
            }
        }
    }
}

/// Locates `age-plugin-<name>` in `$PATH`.
///
/// On failure, returns the binary name that could not be found.
fn find_binary(plugin_name: &str) -> Result<PathBuf, String> {
    let binary = binary_name(plugin_name);
    which::which(&binary).map_err(|_| binary)
}

/// A recipient handled by a plugin.
///
/// Parsed from a Bech32 string with the HRP `age1<name>`.
#[derive(Clone)]
pub struct Recipient {
    name: String,
    encoding: String,
    /// Set when `encoding` is an identity string: the plugin is then asked to encrypt
    /// to the identity itself via `add-identity`.
    as_identity: bool,
    /// Interaction hooks used during wrapping.
    pub callbacks: Callbacks,
}

impl std::str::FromStr for Recipient {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hrp, _) = parse_bech32(s).ok_or("invalid Bech32 encoding")?;
        if hrp.len() > RECIPIENT_HRP_PREFIX.len() && hrp.starts_with(RECIPIENT_HRP_PREFIX) {
            Ok(Recipient {
                name: hrp[RECIPIENT_HRP_PREFIX.len()..].to_string(),
                encoding: s.to_string(),
                as_identity: false,
                callbacks: Callbacks::default(),
            })
        } else {
            Err("not a plugin recipient")
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoding)
    }
}

impl Recipient {
    /// The plugin name this recipient is handled by.
    pub fn plugin(&self) -> &str {
        &self.name
    }

    fn failure(&self, message: impl Into<String>) -> PluginFailure {
        PluginFailure {
            binary_name: binary_name(&self.name),
            message: message.into(),
            stderr: None,
        }
    }

    fn run_wrap<R: Read, W: Write>(
        &self,
        conn: &mut Connection<R, W>,
        file_key: &FileKey,
    ) -> Result<Vec<Stanza>, EncryptError> {
        // Phase 1: hand over the target and the file key.
        let add_command = if self.as_identity {
            CMD_ADD_IDENTITY
        } else {
            CMD_ADD_RECIPIENT
        };
        conn.send_command(add_command, &[&self.encoding], &[])?;
        conn.send_command(CMD_WRAP_FILE_KEY, &[], file_key.expose_secret())?;
        conn.send_command(CMD_DONE, &[], &[])?;

        // Phase 2: the plugin drives until it says done.
        let mut stanzas = vec![];
        loop {
            let mut stanza = conn.receive()?;
            match stanza.tag.as_str() {
                CMD_MSG | CMD_REQUEST_PUBLIC | CMD_REQUEST_SECRET => {
                    self.callbacks.answer(conn, &stanza)?;
                }
                CMD_RECIPIENT_STANZA => {
                    // We wrapped a single file key, so the index must be 0.
                    if stanza.args.len() < 2 || stanza.args[0].parse::<usize>() != Ok(0) {
                        return Err(EncryptError::Plugin(
                            self.failure("malformed recipient-stanza response"),
                        ));
                    }
                    stanza.args.remove(0);
                    stanza.tag = stanza.args.remove(0);
                    stanzas.push(stanza);
                    conn.send_command(REPLY_OK, &[], &[])?;
                }
                CMD_ERROR => {
                    conn.send_command(REPLY_OK, &[], &[])?;
                    return Err(EncryptError::Plugin(
                        self.failure(String::from_utf8_lossy(&stanza.body).into_owned()),
                    ));
                }
                CMD_DONE => break,
                _ => conn.send_command(REPLY_UNSUPPORTED, &[], &[])?,
            }
        }

        Ok(stanzas)
    }

    fn finish_wrap(
        &self,
        result: Result<Vec<Stanza>, EncryptError>,
        report: std::io::Result<SessionReport>,
    ) -> Result<Vec<Stanza>, EncryptError> {
        let report = report.unwrap_or(SessionReport {
            success: false,
            stderr: String::new(),
        });

        match result {
            Ok(stanzas) => {
                if !report.success {
                    let mut failure = self.failure("plugin exited unsuccessfully");
                    failure.stderr = Some(report.stderr);
                    return Err(EncryptError::Plugin(failure));
                }
                if stanzas.is_empty() {
                    // Unconditional: a refused prompt only fails that request, it
                    // does not change the post-condition.
                    Err(EncryptError::EmptyPluginResponse {
                        binary_name: binary_name(&self.name),
                    })
                } else {
                    Ok(stanzas)
                }
            }
            Err(mut e) => {
                if let EncryptError::Plugin(failure) = &mut e {
                    if failure.stderr.is_none() && !report.stderr.is_empty() {
                        failure.stderr = Some(report.stderr);
                    }
                }
                Err(e)
            }
        }
    }
}

impl crate::Recipient for Recipient {
    fn wrap_file_key(&self, file_key: &FileKey) -> Result<Vec<Stanza>, EncryptError> {
        let binary = find_binary(&self.name)
            .map_err(|binary_name| EncryptError::MissingPlugin { binary_name })?;
        let mut conn = Connection::open(&binary, RECIPIENT_V1)?;

        let result = self.run_wrap(&mut conn, file_key);
        let report = conn.shutdown();
        self.finish_wrap(result, report)
    }
}

/// An identity handled by a plugin.
///
/// Parsed from a Bech32 string with the HRP `AGE-PLUGIN-<NAME>-`.
#[derive(Clone)]
pub struct Identity {
    name: String,
    encoding: String,
    /// Interaction hooks used during unwrapping.
    pub callbacks: Callbacks,
}

impl std::str::FromStr for Identity {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hrp, _) = parse_bech32(s).ok_or("invalid Bech32 encoding")?;
        if hrp.len() > IDENTITY_HRP_PREFIX.len() + 1
            && hrp.starts_with(IDENTITY_HRP_PREFIX)
            && hrp.ends_with('-')
        {
            Ok(Identity {
                name: hrp[IDENTITY_HRP_PREFIX.len()..hrp.len() - 1].to_string(),
                encoding: s.to_string(),
                callbacks: Callbacks::default(),
            })
        } else {
            Err("not a plugin identity")
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoding)
    }
}

impl Identity {
    /// The plugin name this identity is handled by.
    pub fn plugin(&self) -> &str {
        &self.name
    }

    /// Derives a recipient that encrypts to this identity.
    ///
    /// The recipient captures the identity encoding and callbacks by value, and hands
    /// the encoding to the plugin via `add-identity` when wrapping.
    pub fn to_recipient(&self) -> Recipient {
        Recipient {
            name: self.name.clone(),
            encoding: self.encoding.clone(),
            as_identity: true,
            callbacks: self.callbacks.clone(),
        }
    }

    fn failure(&self, message: impl Into<String>) -> PluginFailure {
        PluginFailure {
            binary_name: binary_name(&self.name),
            message: message.into(),
            stderr: None,
        }
    }

    fn run_unwrap<R: Read, W: Write>(
        &self,
        conn: &mut Connection<R, W>,
        stanzas: &[Stanza],
    ) -> Result<FileKey, DecryptError> {
        // Phase 1: hand over the identity and every header stanza.
        conn.send_command(CMD_ADD_IDENTITY, &[&self.encoding], &[])?;
        for stanza in stanzas {
            let mut args = Vec::with_capacity(stanza.args.len() + 2);
            args.push("0");
            args.push(&stanza.tag);
            args.extend(stanza.args.iter().map(|s| s.as_str()));
            conn.send_command(CMD_RECIPIENT_STANZA, &args, &stanza.body)?;
        }
        conn.send_command(CMD_DONE, &[], &[])?;

        // Phase 2: the plugin drives until it says done.
        let mut file_key: Option<FileKey> = None;
        loop {
            let stanza = conn.receive()?;
            match stanza.tag.as_str() {
                CMD_MSG | CMD_REQUEST_PUBLIC | CMD_REQUEST_SECRET => {
                    self.callbacks.answer(conn, &stanza)?;
                }
                CMD_FILE_KEY => {
                    // We sent stanzas for a single file, so the index must be 0, and
                    // only one file key can come back.
                    if stanza.args.len() != 1 || stanza.args[0].parse::<usize>() != Ok(0) {
                        return Err(DecryptError::Malformed("malformed file-key response"));
                    }
                    if file_key.is_some() {
                        return Err(DecryptError::Malformed("duplicate file-key response"));
                    }
                    let bytes: [u8; 16] = stanza.body[..]
                        .try_into()
                        .map_err(|_| DecryptError::Malformed("file key must be 16 bytes"))?;
                    file_key = Some(bytes.into());
                    conn.send_command(REPLY_OK, &[], &[])?;
                }
                CMD_ERROR => {
                    conn.send_command(REPLY_OK, &[], &[])?;
                    return Err(DecryptError::Plugin(
                        self.failure(String::from_utf8_lossy(&stanza.body).into_owned()),
                    ));
                }
                CMD_DONE => break,
                _ => conn.send_command(REPLY_UNSUPPORTED, &[], &[])?,
            }
        }

        // Unconditional: the plugin finishing without a file key means this identity
        // does not open the file, whether or not a prompt was refused on the way.
        file_key.ok_or(DecryptError::IncorrectIdentity)
    }

    fn unwrap(&self, stanzas: &[Stanza]) -> Result<FileKey, DecryptError> {
        let binary = find_binary(&self.name)
            .map_err(|binary_name| DecryptError::MissingPlugin { binary_name })?;
        let mut conn = Connection::open(&binary, IDENTITY_V1)?;

        let result = self.run_unwrap(&mut conn, stanzas);
        let report = conn.shutdown();

        match (result, report) {
            (Ok(file_key), _) => Ok(file_key),
            (Err(mut e), report) => {
                let report = report.unwrap_or(SessionReport {
                    success: false,
                    stderr: String::new(),
                });
                if let DecryptError::Plugin(failure) = &mut e {
                    if failure.stderr.is_none() && !report.stderr.is_empty() {
                        failure.stderr = Some(report.stderr);
                    }
                }
                Err(e)
            }
        }
    }
}

impl crate::Identity for Identity {
    fn unwrap_stanza(&self, stanza: &Stanza) -> Option<Result<FileKey, DecryptError>> {
        self.unwrap_stanzas(std::slice::from_ref(stanza))
    }

    fn unwrap_stanzas(&self, stanzas: &[Stanza]) -> Option<Result<FileKey, DecryptError>> {
        match self.unwrap(stanzas) {
            Ok(file_key) => Some(Ok(file_key)),
            // The plugin finished cleanly without a file key: this identity does not
            // match, and others may still be tried.
            Err(DecryptError::IncorrectIdentity) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use bech32::{ToBase32, Variant};
    use secrecy::{ExposeSecret, SecretString};
    use std::sync::Arc;

    use super::{Callbacks, Connection, Identity, Recipient};
    use crate::error::{DecryptError, EncryptError};

    fn test_recipient() -> Recipient {
        bech32::encode("age1test", [1; 8].to_base32(), Variant::Bech32)
            .unwrap()
            .parse()
            .unwrap()
    }

    fn test_identity() -> Identity {
        bech32::encode("age-plugin-test-", [1; 8].to_base32(), Variant::Bech32)
            .unwrap()
            .to_uppercase()
            .parse()
            .unwrap()
    }

    #[test]
    fn encoding_parsing() {
        assert_eq!(test_recipient().plugin(), "test");
        assert_eq!(test_identity().plugin(), "test");
        assert_eq!(test_identity().to_recipient().plugin(), "test");

        // An X25519 recipient is not a plugin recipient (empty plugin name).
        let x25519 = crate::x25519::Identity::generate().to_public().to_string();
        assert!(x25519.parse::<Recipient>().is_err());
    }

    /// Runs the wrap protocol against canned plugin responses, returning the result
    /// and what the client said.
    fn drive_wrap(
        recipient: &Recipient,
        responses: &[u8],
    ) -> (Result<Vec<crate::Stanza>, EncryptError>, String) {
        let mut sent = vec![];
        let result = {
            let mut conn = Connection::from_parts(responses, &mut sent);
            let result = recipient.run_wrap(&mut conn, &[7; 16].into());
            let report = conn.shutdown();
            recipient.finish_wrap(result, report)
        };
        (result, String::from_utf8(sent).unwrap())
    }

    #[test]
    fn wrap_collects_stanzas() {
        let responses = b"-> msg\naGVsbG8\n-> recipient-stanza 0 test YQ\nAAAA\n-> done\n\n";

        let mut recipient = test_recipient();
        recipient.callbacks.display_message = Some(Arc::new(|msg| {
            assert_eq!(msg, "hello");
            Ok(())
        }));

        let (result, sent) = drive_wrap(&recipient, responses);
        let stanzas = result.unwrap();
        assert_eq!(stanzas.len(), 1);
        assert_eq!(stanzas[0].tag, "test");
        assert_eq!(stanzas[0].args, &["YQ"]);
        assert_eq!(stanzas[0].body, [0, 0, 0]);

        // Phase 1 plus one `ok` per handled command.
        assert!(sent.starts_with(&format!(
            "-> add-recipient {}\n\n-> wrap-file-key\n",
            recipient.encoding
        )));
        assert_eq!(sent.matches("-> ok\n").count(), 2);
    }

    #[test]
    fn wrap_without_callback_replies_fail() {
        let responses = b"-> msg\naGVsbG8\n-> recipient-stanza 0 test\nAAAA\n-> done\n\n";
        let (result, sent) = drive_wrap(&test_recipient(), responses);
        // The stanza still arrives; the refused prompt only failed that request.
        assert_eq!(result.unwrap().len(), 1);
        assert!(sent.contains("-> fail\n"));
    }

    #[test]
    fn wrap_with_no_stanzas_is_empty_response() {
        let (result, _) = drive_wrap(&test_recipient(), b"-> done\n\n");
        assert!(matches!(
            result,
            Err(EncryptError::EmptyPluginResponse { .. })
        ));
    }

    #[test]
    fn wrap_refused_prompt_is_still_empty_response() {
        // A refused prompt fails that request only; a plugin that then produces no
        // stanzas gets the same post-condition error as one that never asked.
        let responses = b"-> request-secret\ncGlu\n-> done\n\n";
        let (result, sent) = drive_wrap(&test_recipient(), responses);
        assert!(matches!(
            result,
            Err(EncryptError::EmptyPluginResponse { .. })
        ));
        assert!(sent.contains("-> fail\n"));
    }

    #[test]
    fn wrap_error_stanza_is_acknowledged_and_surfaced() {
        let responses = b"-> error\nc29tZXRoaW5nIGJyb2tl\n";
        let (result, sent) = drive_wrap(&test_recipient(), responses);
        match result {
            Err(EncryptError::Plugin(failure)) => {
                assert_eq!(failure.binary_name, "age-plugin-test");
                assert_eq!(failure.message, "something broke");
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert!(sent.ends_with("-> ok\n\n"));
    }

    #[test]
    fn wrap_rejects_nonzero_index() {
        let responses = b"-> recipient-stanza 1 test\nAAAA\n-> done\n\n";
        let (result, _) = drive_wrap(&test_recipient(), responses);
        assert!(matches!(result, Err(EncryptError::Plugin(_))));
    }

    #[test]
    fn wrap_ignores_unknown_commands() {
        let responses = b"-> extension-thing\n\n-> recipient-stanza 0 test\nAAAA\n-> done\n\n";
        let (result, sent) = drive_wrap(&test_recipient(), responses);
        assert_eq!(result.unwrap().len(), 1);
        assert!(sent.contains("-> unsupported\n"));
    }

    fn drive_unwrap(
        identity: &Identity,
        stanzas: &[crate::Stanza],
        responses: &[u8],
    ) -> (Result<(), DecryptError>, String) {
        let mut sent = vec![];
        let result = {
            let mut conn = Connection::from_parts(responses, &mut sent);
            identity.run_unwrap(&mut conn, stanzas).map(|file_key| {
                assert_eq!(file_key.expose_secret(), b"YELLOW SUBMARINE");
            })
        };
        (result, String::from_utf8(sent).unwrap())
    }

    fn header_stanza() -> crate::Stanza {
        crate::Stanza {
            tag: "test".to_string(),
            args: vec!["YQ".to_string()],
            body: vec![0; 3],
        }
    }

    #[test]
    fn unwrap_returns_file_key() {
        let responses = b"-> file-key 0\nWUVMTE9XIFNVQk1BUklORQ\n-> done\n\n";
        let identity = test_identity();
        let (result, sent) = drive_unwrap(&identity, &[header_stanza()], responses);
        result.unwrap();

        assert!(sent.starts_with(&format!("-> add-identity {}\n\n", identity.encoding)));
        assert!(sent.contains("-> recipient-stanza 0 test YQ\nAAAA\n"));
        assert!(sent.contains("-> done\n\n"));
        assert!(sent.ends_with("-> ok\n\n"));
    }

    #[test]
    fn unwrap_without_file_key_is_incorrect_identity() {
        let (result, _) = drive_unwrap(&test_identity(), &[header_stanza()], b"-> done\n\n");
        assert!(matches!(result, Err(DecryptError::IncorrectIdentity)));
    }

    #[test]
    fn unwrap_duplicate_file_key_is_malformed() {
        let responses = b"-> file-key 0\nWUVMTE9XIFNVQk1BUklORQ\n-> file-key 0\nWUVMTE9XIFNVQk1BUklORQ\n-> done\n\n";
        let (result, _) = drive_unwrap(&test_identity(), &[header_stanza()], responses);
        assert!(matches!(result, Err(DecryptError::Malformed(_))));
    }

    #[test]
    fn unwrap_refused_prompt_is_still_incorrect_identity() {
        // The plugin asks for a secret, gets `fail`, and gives up without a file key;
        // the outcome is the ordinary no-file-key result, so other identities are
        // still tried.
        let responses = b"-> request-secret\ncGlu\n-> done\n\n";
        let (result, sent) = drive_unwrap(&test_identity(), &[header_stanza()], responses);
        assert!(matches!(result, Err(DecryptError::IncorrectIdentity)));
        assert!(sent.contains("-> fail\n"));
    }

    #[test]
    fn unwrap_request_secret_uses_callback() {
        let responses = b"-> request-secret\ncGlu\n-> file-key 0\nWUVMTE9XIFNVQk1BUklORQ\n-> done\n\n";
        let mut identity = test_identity();
        identity.callbacks.request_value = Some(Arc::new(|msg, secret| {
            assert_eq!(msg, "pin");
            assert!(secret);
            Ok(SecretString::new("1234".to_string()))
        }));
        let (result, sent) = drive_unwrap(&identity, &[header_stanza()], responses);
        result.unwrap();
        assert!(sent.contains("-> ok\nMTIzNA\n"));
    }

    #[test]
    fn callbacks_are_cloneable_without_cycles() {
        let mut identity = test_identity();
        identity.callbacks = Callbacks {
            display_message: Some(Arc::new(|_| Ok(()))),
            request_value: None,
        };
        let recipient = identity.to_recipient();
        assert!(recipient.callbacks.display_message.is_some());
        assert_eq!(recipient.plugin(), identity.plugin());
    }
}
