use base64::{prelude::BASE64_STANDARD_NO_PAD, Engine};
use bech32::{FromBase32, Variant};

/// Decodes a Bech32 string, returning the (lowercased) human-readable prefix and the
/// data payload.
///
/// Only the original Bech32 checksum variant is accepted; Bech32m strings are not part
/// of any age encoding.
pub(crate) fn parse_bech32(s: &str) -> Option<(String, Vec<u8>)> {
    bech32::decode(s).ok().and_then(|(hrp, data, variant)| {
        if let Variant::Bech32 = variant {
            Vec::from_base32(&data).ok().map(|d| (hrp, d))
        } else {
            None
        }
    })
}

/// Decodes a stanza argument as canonical unpadded Base64 of exactly `N` bytes.
///
/// Returns `None` if the argument has the wrong length, contains invalid characters,
/// uses padding, or leaves trailing bits set (a non-canonical encoding of the value).
pub(crate) fn base64_arg<A: AsRef<[u8]>, const N: usize>(arg: &A) -> Option<[u8; N]> {
    // Unpadded Base64 length for N bytes.
    if arg.as_ref().len() != (4 * N + 2) / 3 {
        return None;
    }

    let mut buf = [0; N];
    match BASE64_STANDARD_NO_PAD.decode_slice(arg.as_ref(), &mut buf) {
        Ok(n) if n == N => Some(buf),
        _ => None,
    }
}
