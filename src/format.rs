//! The age file format: stanzas and the v1 header.

use std::io::{self, Read, Write};

use crate::error::DecryptError;
use crate::primitives::HmacWriter;

const VERSION_PREFIX: &[u8] = b"age-encryption.org/";
const V1_VERSION: &[u8] = b"v1";
const STANZA_PREFIX: &str = "-> ";
const MAC_PREFIX: &[u8] = b"---";

/// Upper bound on the number of header bytes buffered during parsing.
///
/// Headers are parsed to completion before the payload is touched, so an attacker must
/// not be able to make us buffer without limit.
const MAX_HEADER_LEN: usize = 128 * 1024;

/// One unit of the age header: a type tag, zero or more arguments, and a binary body
/// wrapped in canonical unpadded Base64 on the wire.
///
/// Two stanzas with equal fields always serialize to identical bytes.
#[derive(Debug, PartialEq, Eq)]
pub struct Stanza {
    /// The type of this stanza.
    pub tag: String,
    /// Zero or more arguments.
    pub args: Vec<String>,
    /// The binary body, typically a wrapped file key.
    pub body: Vec<u8>,
}

/// The parsed v1 header: the stanza list and the MAC that authenticates it.
pub(crate) struct HeaderV1 {
    pub(crate) stanzas: Vec<Stanza>,
    pub(crate) mac: [u8; 32],
}

impl HeaderV1 {
    /// Assembles a header for the given stanzas, computing the MAC over the covered
    /// bytes (everything from the version line through the literal `---`).
    pub(crate) fn new(stanzas: Vec<Stanza>, mac_key: &[u8; 32]) -> Self {
        let mut header = HeaderV1 {
            stanzas,
            mac: [0; 32],
        };

        let mut mac = HmacWriter::new(mac_key);
        cookie_factory::gen(write::header_v1_covered(&header), &mut mac)
            .expect("can serialize header into HmacWriter");
        header.mac = mac.finalize();

        header
    }

    /// Recomputes the MAC under `mac_key` and compares in constant time.
    pub(crate) fn verify_mac(&self, mac_key: &[u8; 32]) -> Result<(), hmac::digest::MacError> {
        let mut mac = HmacWriter::new(mac_key);
        cookie_factory::gen(write::header_v1_covered(self), &mut mac)
            .expect("can serialize header into HmacWriter");
        mac.verify(&self.mac)
    }
}

pub(crate) enum Header {
    V1(HeaderV1),
    /// A well-formed version line we do not recognise. Nothing past the version line is
    /// parsed; other versions may change everything after it.
    Unknown(String),
}

impl Header {
    /// Reads a header from `input`, consuming exactly the header bytes.
    ///
    /// The buffer is grown only by the amounts the parser reports missing, so the first
    /// payload byte is left unread in `input`.
    pub(crate) fn read<R: Read>(mut input: R) -> Result<Self, DecryptError> {
        let mut data = vec![];
        loop {
            match read::header(&data) {
                Ok((_, header)) => break Ok(header),
                Err(nom::Err::Incomplete(needed)) => {
                    if data.len() >= MAX_HEADER_LEN {
                        break Err(DecryptError::Malformed("header exceeds size bound"));
                    }
                    let n = match needed {
                        nom::Needed::Size(n) => n.get(),
                        nom::Needed::Unknown => 1,
                    };
                    let m = data.len();
                    data.resize(m + n, 0);
                    input.read_exact(&mut data[m..]).map_err(|e| {
                        if e.kind() == io::ErrorKind::UnexpectedEof {
                            DecryptError::Malformed("incomplete header")
                        } else {
                            DecryptError::Io(e)
                        }
                    })?;
                }
                Err(_) => break Err(DecryptError::Malformed("invalid header")),
            }
        }
    }

    pub(crate) fn write<W: Write>(&self, mut output: W) -> io::Result<()> {
        match self {
            Header::V1(v1) => cookie_factory::gen(write::header_v1(v1), &mut output)
                .map(|_| ())
                .map_err(|e| match e {
                    cookie_factory::GenError::IoError(e) => e,
                    e => io::Error::new(io::ErrorKind::Other, format!("{:?}", e)),
                }),
            Header::Unknown(_) => unreachable!("only v1 headers are written"),
        }
    }
}

/// Decoding operations for the age header.
pub(crate) mod read {
    use base64::{prelude::BASE64_STANDARD_NO_PAD, Engine};
    use nom::{
        branch::alt,
        bytes::streaming::{tag, take, take_while1, take_while_m_n},
        character::streaming::newline,
        combinator::{map, map_opt, map_res, verify},
        multi::{many_till, separated_list1},
        sequence::{pair, preceded, terminated},
        IResult,
    };

    use super::{Header, HeaderV1, Stanza, MAC_PREFIX, STANZA_PREFIX, VERSION_PREFIX, V1_VERSION};
    use crate::util::base64_arg;

    /// The value of a standard Base64 alphabet symbol, or `None` for any other byte.
    fn sextet(c: u8) -> Option<u8> {
        match c {
            b'A'..=b'Z' => Some(c - b'A'),
            b'a'..=b'z' => Some(c - b'a' + 26),
            b'0'..=b'9' => Some(c - b'0' + 52),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }

    fn is_base64_char(c: u8) -> bool {
        sextet(c).is_some()
    }

    /// Whether a terminal body line is a canonical unpadded Base64 ending: the length
    /// must not be 1 mod 4, and the final symbol must leave no trailing bits set.
    fn is_canonical_end(line: &[u8]) -> bool {
        let unused_bits = match line.len() % 4 {
            0 => return true,
            1 => return false,
            2 => 4,
            _ => 2,
        };
        line.last()
            .and_then(|&c| sextet(c))
            .map_or(false, |bits| bits & ((1 << unused_bits) - 1) == 0)
    }

    /// A stanza-line token: the type tag or an argument.
    fn token(input: &[u8]) -> IResult<&[u8], &str> {
        map_res(
            take_while1(|c: u8| {
                c.is_ascii_alphanumeric() || matches!(c, b'+' | b'/' | b'.' | b'_' | b'-')
            }),
            std::str::from_utf8,
        )(input)
    }

    /// An arbitrary version string (VCHAR per the age ABNF).
    fn version(input: &[u8]) -> IResult<&[u8], &str> {
        map_res(
            take_while1(|c: u8| (33..=126).contains(&c)),
            std::str::from_utf8,
        )(input)
    }

    /// A stanza body: full 64-column lines terminated by a single short line (which is
    /// empty when the body length is a multiple of 48 bytes).
    fn body(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
        map_res(
            many_till(
                terminated(take_while_m_n(64, 64, is_base64_char), newline),
                verify(
                    terminated(take_while_m_n(0, 63, is_base64_char), newline),
                    |line: &[u8]| is_canonical_end(line),
                ),
            ),
            |(full_lines, last_line): (Vec<&[u8]>, &[u8])| {
                let mut encoded = Vec::with_capacity(full_lines.len() * 64 + last_line.len());
                for line in &full_lines {
                    encoded.extend_from_slice(line);
                }
                encoded.extend_from_slice(last_line);
                BASE64_STANDARD_NO_PAD.decode(&encoded)
            },
        )(input)
    }

    /// Reads one stanza, consuming its trailing newline.
    pub(crate) fn stanza(input: &[u8]) -> IResult<&[u8], Stanza> {
        map(
            pair(
                preceded(
                    tag(STANZA_PREFIX),
                    terminated(separated_list1(tag(" "), token), newline),
                ),
                body,
            ),
            |(mut tokens, body)| {
                let tag = tokens.remove(0).to_string();
                Stanza {
                    tag,
                    args: tokens.into_iter().map(String::from).collect(),
                    body,
                }
            },
        )(input)
    }

    /// The `--- <base64(mac)>` footer line.
    fn mac_line(input: &[u8]) -> IResult<&[u8], [u8; 32]> {
        preceded(
            pair(tag(MAC_PREFIX), tag(" ")),
            terminated(
                map_opt(take(43usize), |arg: &[u8]| base64_arg::<_, 32>(&arg)),
                newline,
            ),
        )(input)
    }

    fn header_v1(input: &[u8]) -> IResult<&[u8], HeaderV1> {
        preceded(
            pair(tag(V1_VERSION), newline),
            map_opt(many_till(stanza, mac_line), |(stanzas, mac)| {
                // A v1 header carries at least one stanza.
                if stanzas.is_empty() {
                    None
                } else {
                    Some(HeaderV1 { stanzas, mac })
                }
            }),
        )(input)
    }

    pub(super) fn header(input: &[u8]) -> IResult<&[u8], Header> {
        preceded(
            tag(VERSION_PREFIX),
            alt((
                map(header_v1, Header::V1),
                // Guarded so a malformed v1 header is not misread as a version we
                // don't support.
                map(
                    verify(terminated(version, newline), |v: &str| {
                        v.as_bytes() != V1_VERSION
                    }),
                    |v| Header::Unknown(v.to_string()),
                ),
            )),
        )(input)
    }
}

/// Encoding operations for the age header.
pub(crate) mod write {
    use base64::{prelude::BASE64_STANDARD_NO_PAD, Engine};
    use cookie_factory::{
        combinator::{slice, string},
        multi::all,
        sequence::{pair, tuple},
        SerializeFn, WriteContext,
    };
    use std::io::Write;

    use super::{HeaderV1, Stanza, MAC_PREFIX, STANZA_PREFIX, VERSION_PREFIX, V1_VERSION};

    /// Writes a body as Base64 wrapped at 64 columns, always ending in a short line.
    fn body<'a, W: 'a + Write>(data: &[u8]) -> impl SerializeFn<W> + 'a {
        let encoded = BASE64_STANDARD_NO_PAD.encode(data);

        move |mut w: WriteContext<W>| {
            let mut rest = encoded.as_str();
            while rest.len() >= 64 {
                let (line, tail) = rest.split_at(64);
                w = pair(string(line), string("\n"))(w)?;
                rest = tail;
            }
            pair(string(rest), string("\n"))(w)
        }
    }

    /// Writes one stanza, including its trailing newline.
    pub(crate) fn stanza<'a, W: 'a + Write>(s: &'a Stanza) -> impl SerializeFn<W> + 'a {
        pair(
            tuple((
                string(STANZA_PREFIX),
                string(&s.tag),
                all(s.args.iter().map(|arg| pair(string(" "), string(arg)))),
                string("\n"),
            )),
            body(&s.body),
        )
    }

    /// The bytes covered by the header MAC: everything up to and including the literal
    /// `---` of the footer line.
    pub(super) fn header_v1_covered<'a, W: 'a + Write>(
        h: &'a HeaderV1,
    ) -> impl SerializeFn<W> + 'a {
        tuple((
            slice(VERSION_PREFIX),
            slice(V1_VERSION),
            string("\n"),
            all(h.stanzas.iter().map(stanza)),
            slice(MAC_PREFIX),
        ))
    }

    pub(super) fn header_v1<'a, W: 'a + Write>(h: &'a HeaderV1) -> impl SerializeFn<W> + 'a {
        tuple((
            header_v1_covered(h),
            string(" "),
            string(BASE64_STANDARD_NO_PAD.encode(h.mac)),
            string("\n"),
        ))
    }
}
