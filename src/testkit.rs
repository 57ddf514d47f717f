//! Deterministic generator of age test vectors.
//!
//! [`VectorBuilder`] assembles age files piece by piece, from raw text lines up to
//! whole recipient stanzas and sealed payload chunks, recording what a decryptor
//! should make of the result. All randomness comes from a fixed ChaCha20 keystream,
//! so generated files are byte-for-byte reproducible; nothing here touches the OS
//! CSPRNG.
//!
//! A vector is a textual expectation header, a blank line, and the raw age file:
//!
//! ```text
//! expect: success
//! payload: 9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08
//! file key: 59454c4c4f57205355424d4152494e45
//! identity: AGE-SECRET-KEY-1...
//!
//! age-encryption.org/v1
//! ...
//! ```
//!
//! [`Vector::parse`] reads that format back for consumption by test harnesses.

use base64::{prelude::BASE64_STANDARD_NO_PAD, Engine};
use chacha20::{
    cipher::{KeyIvInit, StreamCipher},
    ChaCha20,
};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305,
};
use sha2::{Digest, Sha256};
use x25519_dalek::{x25519, X25519_BASEPOINT_BYTES};

use crate::primitives::{hkdf, scrypt};
use crate::util::parse_bech32;

/// The file key used by generated files unless overridden.
pub const TEST_FILE_KEY: &[u8; 16] = b"YELLOW SUBMARINE";

/// The ChaCha20 key behind [`VectorBuilder::rand`].
pub const TEST_RNG_KEY: &[u8; 32] = b"TEST RANDOMNESS TEST RANDOMNESS!";

/// The standard test identity, as a Bech32 string.
pub const TEST_X25519_IDENTITY: &str =
    "AGE-SECRET-KEY-1EGTZVFFV20835NWYV6270LXYVK2VKNX2MMDKWYKLMGR48UAWX40Q2P2LM0";

/// The scalar bytes of [`TEST_X25519_IDENTITY`].
pub fn test_identity_bytes() -> [u8; 32] {
    let (_, bytes) = parse_bech32(TEST_X25519_IDENTITY).expect("test identity is valid");
    bytes[..].try_into().expect("test identity is 32 bytes")
}

/// What a decryptor holding the right key material should make of a vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expect {
    /// Decryption succeeds and yields the recorded payload.
    Success,
    /// The header is rejected (before any payload byte is processed).
    HeaderFailure,
    /// The header is accepted but the payload fails.
    PayloadFailure,
}

impl Expect {
    fn as_str(&self) -> &'static str {
        match self {
            Expect::Success => "success",
            Expect::HeaderFailure => "header failure",
            Expect::PayloadFailure => "payload failure",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Expect::Success),
            "header failure" => Some(Expect::HeaderFailure),
            "payload failure" => Some(Expect::PayloadFailure),
            _ => None,
        }
    }
}

/// Rewrites the final symbol of an unpadded Base64 string to the next symbol in the
/// alphabet.
///
/// Canonical encodings leave their trailing bits zero, so the next symbol encodes the
/// same bytes with a trailing bit set: a non-canonical encoding of the same value.
pub fn not_canonical(s: &str) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let last = *s.as_bytes().last().expect("encoding is non-empty");
    let idx = ALPHABET.iter().position(|&c| c == last).expect("is Base64");
    format!("{}{}", &s[..s.len() - 1], ALPHABET[idx + 1] as char)
}

fn b64(data: &[u8]) -> String {
    BASE64_STANDARD_NO_PAD.encode(data)
}

fn seal(key: &[u8; 32], nonce: &[u8; 12], plaintext: &[u8]) -> Vec<u8> {
    ChaCha20Poly1305::new(key.into())
        .encrypt(nonce.into(), plaintext)
        .expect("sealing cannot fail")
}

/// Assembles one age file and the expectations that go with it.
pub struct VectorBuilder {
    buf: Vec<u8>,
    rng: ChaCha20,
    file_key: Vec<u8>,
    stream_key: [u8; 32],
    nonce: [u8; 12],
    payload: Vec<u8>,
    expect: Expect,
    comment: Option<String>,
    identities: Vec<String>,
    passphrases: Vec<String>,
}

impl Default for VectorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorBuilder {
    /// A builder with the fixed keystream, the standard file key, and a success
    /// expectation.
    pub fn new() -> Self {
        VectorBuilder {
            buf: vec![],
            rng: ChaCha20::new(TEST_RNG_KEY.into(), &[0; 12].into()),
            file_key: TEST_FILE_KEY.to_vec(),
            stream_key: [0; 32],
            nonce: [0; 12],
            payload: vec![],
            expect: Expect::Success,
            comment: None,
            identities: vec![],
            passphrases: vec![],
        }
    }

    /// The next `n` bytes of the deterministic keystream.
    pub fn rand(&mut self, n: usize) -> Vec<u8> {
        let mut out = vec![0; n];
        self.rng.apply_keystream(&mut out);
        out
    }

    /// Overrides the file key (which may be deliberately the wrong length).
    pub fn file_key(&mut self, key: &[u8]) {
        self.file_key = key.to_vec();
    }

    /// Appends a raw text line.
    pub fn text_line(&mut self, line: &str) {
        self.buf.extend_from_slice(line.as_bytes());
        self.buf.push(b'\n');
    }

    /// Removes the last line from the file and returns it (without its newline), so
    /// it can be reissued in mutated form.
    pub fn unread_line(&mut self) -> String {
        debug_assert_eq!(self.buf.last(), Some(&b'\n'));
        let start = self.buf[..self.buf.len() - 1]
            .iter()
            .rposition(|&b| b == b'\n')
            .map(|i| i + 1)
            .unwrap_or(0);
        let line = self.buf.split_off(start);
        String::from_utf8(line).expect("header lines are UTF-8")
            .trim_end_matches('\n')
            .to_string()
    }

    /// The `age-encryption.org/<v>` version line.
    pub fn version_line(&mut self, v: &str) {
        self.text_line(&format!("age-encryption.org/{}", v));
    }

    /// A `-> args...` stanza introduction line.
    pub fn args_line(&mut self, args: &[&str]) {
        if args.is_empty() {
            self.text_line("->");
        } else {
            self.text_line(&format!("-> {}", args.join(" ")));
        }
    }

    /// Appends raw bytes to the file, bypassing the line discipline.
    pub fn raw_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Flips the lowest bit of the byte `offset` positions from the end of the file.
    pub fn corrupt_from_end(&mut self, offset: usize) {
        let i = self.buf.len() - 1 - offset;
        self.buf[i] ^= 1;
    }

    /// A stanza body: Base64 in lines of 48 input bytes, short (possibly empty) line
    /// last.
    pub fn body(&mut self, data: &[u8]) {
        let mut rest = data;
        loop {
            let line = &rest[..rest.len().min(48)];
            self.text_line(&b64(line));
            rest = &rest[line.len()..];
            if line.len() < 48 {
                break;
            }
        }
    }

    /// A whole stanza.
    pub fn stanza(&mut self, args: &[&str], body: &[u8]) {
        self.args_line(args);
        self.body(body);
    }

    /// A stanza body sealing `plaintext` under `key` with a zero nonce.
    pub fn aead_body(&mut self, key: &[u8; 32], plaintext: &[u8]) {
        let sealed = seal(key, &[0; 12], plaintext);
        self.body(&sealed);
    }

    /// An X25519 stanza for `identity`, recording the identity for the decryptor.
    pub fn x25519(&mut self, identity: &[u8; 32]) {
        self.x25519_record_identity(identity);
        self.x25519_no_record_identity(identity);
    }

    /// Records the Bech32 identity string without writing a stanza.
    pub fn x25519_record_identity(&mut self, identity: &[u8; 32]) {
        use bech32::{ToBase32, Variant};
        let encoded = bech32::encode("age-secret-key-", identity.to_base32(), Variant::Bech32)
            .expect("HRP is valid");
        self.identities.push(encoded.to_uppercase());
    }

    /// Writes an X25519 stanza without recording the identity.
    pub fn x25519_no_record_identity(&mut self, identity: &[u8; 32]) {
        let recipient = x25519(*identity, X25519_BASEPOINT_BYTES);
        let ephemeral: [u8; 32] = self.rand(32)[..].try_into().unwrap();
        let share = x25519(ephemeral, X25519_BASEPOINT_BYTES);
        self.args_line(&["X25519", &b64(&share)]);

        let secret = x25519(ephemeral, recipient);
        let mut salt = [0; 64];
        salt[..32].copy_from_slice(&share);
        salt[32..].copy_from_slice(&recipient);
        let key = hkdf(&salt, b"age-encryption.org/v1/X25519", &secret);
        let file_key = self.file_key.clone();
        self.aead_body(&key, &file_key);
    }

    /// An scrypt stanza for `passphrase`, recording the passphrase.
    pub fn scrypt(&mut self, passphrase: &str, work_factor: u8) {
        self.scrypt_record_passphrase(passphrase);
        self.scrypt_no_record_passphrase(passphrase, work_factor);
    }

    /// Records a passphrase without writing a stanza.
    pub fn scrypt_record_passphrase(&mut self, passphrase: &str) {
        self.passphrases.push(passphrase.to_string());
    }

    /// Writes an scrypt stanza without recording the passphrase.
    pub fn scrypt_no_record_passphrase(&mut self, passphrase: &str, work_factor: u8) {
        let arg = work_factor.to_string();
        self.scrypt_with_work_factor_arg(passphrase, &arg, work_factor);
    }

    /// Writes an scrypt stanza whose work-factor argument is the literal `arg`, with
    /// the body sealed under `derive_with`.
    ///
    /// Lets out-of-range or misspelt work factors be generated cheaply: a decryptor
    /// must reject them before deriving anything, so the body never matters.
    pub fn scrypt_with_work_factor_arg(&mut self, passphrase: &str, arg: &str, derive_with: u8) {
        let salt = self.rand(16);
        self.args_line(&["scrypt", &b64(&salt), arg]);

        let mut labelled_salt = b"age-encryption.org/v1/scrypt".to_vec();
        labelled_salt.extend_from_slice(&salt);
        let key = scrypt(&labelled_salt, derive_with, passphrase).expect("work factor is valid");
        let file_key = self.file_key.clone();
        self.aead_body(&key, &file_key);
    }

    /// The `--- <base64(mac)>` footer line with an arbitrary MAC value.
    pub fn hmac_line(&mut self, mac: &[u8]) {
        self.text_line(&format!("--- {}", b64(mac)));
    }

    /// The footer line with the correct MAC over the file so far plus `---`.
    pub fn hmac(&mut self) {
        use hmac::{Hmac, Mac};
        let key = hkdf(&[], b"header", &self.file_key);
        let mut mac: Hmac<Sha256> = Mac::new_from_slice(&key).expect("any key length works");
        mac.update(&self.buf);
        mac.update(b"---");
        let mac = mac.finalize().into_bytes();
        self.hmac_line(&mac);
    }

    /// The raw payload nonce; derives the stream key from it.
    pub fn nonce(&mut self, nonce: &[u8]) {
        self.stream_key = hkdf(nonce, b"payload", &self.file_key);
        self.buf.extend_from_slice(nonce);
    }

    /// Seals a non-final payload chunk and advances the chunk counter.
    pub fn payload_chunk(&mut self, plaintext: &[u8]) {
        self.payload.extend_from_slice(plaintext);
        let sealed = seal(&self.stream_key, &self.nonce, plaintext);
        self.buf.extend_from_slice(&sealed);
        self.nonce[10] += 1;
    }

    /// Seals a final-flagged payload chunk.
    pub fn payload_chunk_final(&mut self, plaintext: &[u8]) {
        self.payload.extend_from_slice(plaintext);
        self.nonce[11] = 1;
        let sealed = seal(&self.stream_key, &self.nonce, plaintext);
        self.buf.extend_from_slice(&sealed);
    }

    /// A complete single-chunk payload with a keystream nonce.
    pub fn payload(&mut self, plaintext: &[u8]) {
        let nonce = self.rand(16);
        self.nonce(&nonce);
        self.payload_chunk_final(plaintext);
    }

    /// Marks the vector as failing during header processing.
    pub fn expect_header_failure(&mut self) {
        self.expect = Expect::HeaderFailure;
    }

    /// Marks the vector as failing during payload processing.
    pub fn expect_payload_failure(&mut self) {
        self.expect = Expect::PayloadFailure;
    }

    /// Attaches a free-form comment.
    pub fn comment(&mut self, c: &str) {
        self.comment = Some(c.to_string());
    }

    /// Emits the vector: the expectation header, a blank line, and the age file.
    pub fn build(self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(&format!("expect: {}\n", self.expect.as_str()));
        if let Expect::Success = self.expect {
            out.push_str(&format!(
                "payload: {}\n",
                hex::encode(Sha256::digest(&self.payload))
            ));
        }
        out.push_str(&format!("file key: {}\n", hex::encode(&self.file_key)));
        for identity in &self.identities {
            out.push_str(&format!("identity: {}\n", identity));
        }
        for passphrase in &self.passphrases {
            out.push_str(&format!("passphrase: {}\n", passphrase));
        }
        if let Some(comment) = &self.comment {
            out.push_str(&format!("comment: {}\n", comment));
        }
        out.push('\n');

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.buf);
        bytes
    }
}

/// A parsed test vector.
pub struct Vector {
    /// The expected decryption outcome.
    pub expect: Expect,
    /// SHA-256 of the plaintext, present on success vectors.
    pub payload_digest: Option<[u8; 32]>,
    /// The file key the generator used.
    pub file_key: Option<Vec<u8>>,
    /// Identities (Bech32) that should be offered to the decryptor.
    pub identities: Vec<String>,
    /// Passphrases that should be offered to the decryptor.
    pub passphrases: Vec<String>,
    /// Free-form commentary.
    pub comment: Option<String>,
    /// The raw age file.
    pub age_file: Vec<u8>,
}

impl Vector {
    /// Parses the vector format emitted by [`VectorBuilder::build`].
    pub fn parse(data: &[u8]) -> Option<Self> {
        let split = data.windows(2).position(|w| w == b"\n\n")?;
        let (header, age_file) = (&data[..split], &data[split + 2..]);

        let mut vector = Vector {
            expect: Expect::Success,
            payload_digest: None,
            file_key: None,
            identities: vec![],
            passphrases: vec![],
            comment: None,
            age_file: age_file.to_vec(),
        };

        let mut saw_expect = false;
        for line in std::str::from_utf8(header).ok()?.lines() {
            let (key, value) = line.split_once(": ")?;
            match key {
                "expect" => {
                    vector.expect = Expect::from_str(value)?;
                    saw_expect = true;
                }
                "payload" => {
                    let digest = hex::decode(value).ok()?;
                    vector.payload_digest = Some(digest[..].try_into().ok()?);
                }
                "file key" => vector.file_key = Some(hex::decode(value).ok()?),
                "identity" => vector.identities.push(value.to_string()),
                "passphrase" => vector.passphrases.push(value.to_string()),
                "comment" => vector.comment = Some(value.to_string()),
                _ => return None,
            }
        }

        saw_expect.then_some(vector)
    }
}
