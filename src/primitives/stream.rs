//! The STREAM construction carrying the age payload.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305,
};
use secrecy::{ExposeSecret, Secret, SecretVec};
use std::fmt;
use std::io::{self, Read, Write};

/// The ways a payload can fail to decrypt, carried inside the [`io::Error`]s returned
/// by [`StreamReader`] so callers can classify them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadError {
    /// A chunk tag did not verify.
    Authentication,
    /// The stream ended before a final-flagged chunk.
    Truncated,
    /// Data followed the final-flagged chunk.
    TrailingData,
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadError::Authentication => f.write_str("payload chunk failed to authenticate"),
            PayloadError::Truncated => f.write_str("payload is truncated"),
            PayloadError::TrailingData => {
                f.write_str("trailing data after the final payload chunk")
            }
        }
    }
}

impl std::error::Error for PayloadError {}

impl PayloadError {
    fn wrap(self) -> io::Error {
        let kind = match self {
            PayloadError::Truncated => io::ErrorKind::UnexpectedEof,
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, self)
    }

    /// Recovers the payload error carried by an [`io::Error`], if any.
    pub fn unwrap_from(e: &io::Error) -> Option<PayloadError> {
        e.get_ref()
            .and_then(|inner| inner.downcast_ref::<PayloadError>())
            .copied()
    }
}

/// Plaintext bytes per payload chunk.
pub(crate) const CHUNK_SIZE: usize = 64 * 1024;
const TAG_SIZE: usize = 16;
const SEALED_CHUNK_SIZE: usize = CHUNK_SIZE + TAG_SIZE;

/// The per-chunk nonce: an 11-byte big-endian counter followed by one byte that is
/// `0x01` on the final chunk and `0x00` everywhere else.
struct ChunkNonce([u8; 12]);

impl ChunkNonce {
    fn new() -> Self {
        ChunkNonce([0; 12])
    }

    /// Increments the counter. The counter space is 2^88 chunks; running it out is not
    /// reachable from any input this library can be fed.
    fn advance(&mut self) {
        for byte in self.0[..11].iter_mut().rev() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                return;
            }
        }
        panic!("payload chunk counter overflowed");
    }

    fn is_last(&self) -> bool {
        self.0[11] != 0
    }

    /// Records whether the chunk about to be processed is the final one. Fails if the
    /// final chunk has already been processed.
    fn set_last(&mut self, last: bool) -> Result<(), ()> {
        if self.is_last() {
            Err(())
        } else {
            self.0[11] = last as u8;
            Ok(())
        }
    }
}

/// `STREAM[key](chunks)`: ChaCha20-Poly1305 in 64 KiB chunks with the nonce layout
/// above. The key must never be reused across streams; age guarantees this by deriving
/// it from the file key and a fresh 16-byte nonce.
pub(crate) struct Stream {
    aead: ChaCha20Poly1305,
    nonce: ChunkNonce,
}

impl Stream {
    fn new(key: &Secret<[u8; 32]>) -> Self {
        Stream {
            aead: ChaCha20Poly1305::new(key.expose_secret().into()),
            nonce: ChunkNonce::new(),
        }
    }

    /// Wraps `inner` in a writer that seals everything written to it.
    pub(crate) fn encrypt<W: Write>(key: &Secret<[u8; 32]>, inner: W) -> StreamWriter<W> {
        StreamWriter {
            stream: Self::new(key),
            inner,
            chunk: Vec::with_capacity(CHUNK_SIZE),
        }
    }

    /// Wraps `inner` in a reader that opens and authenticates each chunk.
    pub(crate) fn decrypt<R: Read>(key: &Secret<[u8; 32]>, inner: R) -> StreamReader<R> {
        StreamReader {
            stream: Self::new(key),
            inner,
            sealed: vec![0; SEALED_CHUNK_SIZE],
            sealed_len: 0,
            chunk: None,
        }
    }

    fn seal_chunk(&mut self, chunk: &[u8], last: bool) -> io::Result<Vec<u8>> {
        debug_assert!(chunk.len() <= CHUNK_SIZE);

        self.nonce.set_last(last).map_err(|_| {
            io::Error::new(io::ErrorKind::WriteZero, "final chunk already sealed")
        })?;

        let sealed = self
            .aead
            .encrypt(&self.nonce.0.into(), chunk)
            .expect("chunk is within the ChaCha20 message bound");
        self.nonce.advance();

        Ok(sealed)
    }

    fn open_chunk(&mut self, sealed: &[u8], last: bool) -> io::Result<SecretVec<u8>> {
        debug_assert!(sealed.len() <= SEALED_CHUNK_SIZE);

        self.nonce
            .set_last(last)
            .map_err(|_| PayloadError::TrailingData.wrap())?;

        let chunk = self
            .aead
            .decrypt(&self.nonce.0.into(), sealed)
            .map(SecretVec::new)
            .map_err(|_| PayloadError::Authentication.wrap())?;
        self.nonce.advance();

        Ok(chunk)
    }

    fn is_complete(&self) -> bool {
        self.nonce.is_last()
    }
}

/// Seals its input into an age payload.
pub struct StreamWriter<W: Write> {
    stream: Stream,
    inner: W,
    chunk: Vec<u8>,
}

impl<W: Write> StreamWriter<W> {
    /// Seals the final chunk (empty if no data is pending) and returns the inner
    /// writer.
    ///
    /// This **must** be called once writing is done. A stream that is never finished
    /// has no final-flagged chunk and will fail to decrypt as truncated.
    pub fn finish(mut self) -> io::Result<W> {
        let sealed = self.stream.seal_chunk(&self.chunk, true)?;
        self.inner.write_all(&sealed)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for StreamWriter<W> {
    fn write(&mut self, mut buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;

        while !buf.is_empty() {
            let take = (CHUNK_SIZE - self.chunk.len()).min(buf.len());
            self.chunk.extend_from_slice(&buf[..take]);
            written += take;
            buf = &buf[take..];

            // A full buffered chunk is only sealed once more input arrives, because
            // the final chunk must be sealed by finish() with the last flag set.
            if !buf.is_empty() {
                debug_assert_eq!(self.chunk.len(), CHUNK_SIZE);
                let sealed = self.stream.seal_chunk(&self.chunk, false)?;
                self.inner.write_all(&sealed)?;
                self.chunk.clear();
            }
        }

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Opens an age payload, yielding the plaintext.
pub struct StreamReader<R: Read> {
    stream: Stream,
    inner: R,
    sealed: Vec<u8>,
    sealed_len: usize,
    /// The current plaintext chunk and the read offset into it.
    chunk: Option<(SecretVec<u8>, usize)>,
}

impl<R: Read> StreamReader<R> {
    /// Pulls bytes from `inner` until a whole sealed chunk is buffered or the stream
    /// ends. Tolerates arbitrarily short reads.
    fn fill_sealed(&mut self) -> io::Result<()> {
        while self.sealed_len < SEALED_CHUNK_SIZE {
            match self.inner.read(&mut self.sealed[self.sealed_len..]) {
                Ok(0) => break,
                Ok(n) => self.sealed_len += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn open_buffered_chunk(&mut self) -> io::Result<()> {
        let sealed = &self.sealed[..self.sealed_len];

        if sealed.is_empty() {
            if !self.stream.is_complete() {
                // EOF before a final-flagged chunk.
                return Err(PayloadError::Truncated.wrap());
            }
        } else if self.stream.is_complete() {
            return Err(PayloadError::TrailingData.wrap());
        } else {
            // A short chunk must be the last one. A full-size chunk usually is not,
            // except when the plaintext length is an exact multiple of the chunk size;
            // that case is only distinguishable by the tag, so retry with the final
            // flag before giving up.
            let last = sealed.len() < SEALED_CHUNK_SIZE;
            let chunk = match (self.stream.open_chunk(sealed, last), last) {
                (Ok(chunk), _) => chunk,
                (Err(_), false) => self.stream.open_chunk(sealed, true)?,
                (Err(e), true) => return Err(e),
            };
            self.chunk = Some((chunk, 0));
        }

        self.sealed_len = 0;
        Ok(())
    }
}

impl<R: Read> Read for StreamReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.chunk.is_none() {
            self.fill_sealed()?;
            self.open_buffered_chunk()?;
        }

        match &mut self.chunk {
            None => Ok(0),
            Some((chunk, offset)) => {
                let plaintext = chunk.expose_secret();
                let to_read = (plaintext.len() - *offset).min(buf.len());
                buf[..to_read].copy_from_slice(&plaintext[*offset..*offset + to_read]);
                *offset += to_read;
                if *offset == plaintext.len() {
                    self.chunk = None;
                }
                Ok(to_read)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use secrecy::Secret;
    use std::io::{self, Read, Write};

    use super::{Stream, CHUNK_SIZE, TAG_SIZE};

    fn key() -> Secret<[u8; 32]> {
        Secret::new([7; 32])
    }

    fn seal(data: &[u8]) -> Vec<u8> {
        let mut sealed = vec![];
        let mut w = Stream::encrypt(&key(), &mut sealed);
        w.write_all(data).unwrap();
        w.finish().unwrap();
        sealed
    }

    fn open(sealed: &[u8]) -> io::Result<Vec<u8>> {
        let mut buf = vec![];
        Stream::decrypt(&key(), sealed).read_to_end(&mut buf).map(|_| buf)
    }

    #[test]
    fn round_trip_various_lengths() {
        for len in [0, 1, 1024, CHUNK_SIZE - 1, CHUNK_SIZE, CHUNK_SIZE + 1, 3 * CHUNK_SIZE] {
            let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
            assert_eq!(open(&seal(&data)).unwrap(), data, "length {}", len);
        }
    }

    #[test]
    fn empty_stream_is_one_tag() {
        assert_eq!(seal(&[]).len(), TAG_SIZE);
    }

    #[test]
    fn chunk_multiple_emits_trailing_empty_chunk() {
        // One full chunk plus an empty final chunk.
        assert_eq!(seal(&[42; CHUNK_SIZE]).len(), CHUNK_SIZE + 2 * TAG_SIZE);
    }

    #[test]
    fn unfinished_stream_is_truncated() {
        let mut sealed = vec![];
        {
            let mut w = Stream::encrypt(&key(), &mut sealed);
            w.write_all(&[42; 2 * CHUNK_SIZE]).unwrap();
            // finish() deliberately not called.
        }
        assert_eq!(open(&sealed).unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn truncated_chunk_fails_authentication() {
        let sealed = seal(&[42; 1024]);
        assert_eq!(
            open(&sealed[..sealed.len() - 1]).unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
    }

    #[test]
    fn bit_flips_fail_authentication() {
        let mut sealed = seal(b"attack at dawn");
        for i in [0, 7, sealed.len() - 1] {
            sealed[i] ^= 0x40;
            assert_eq!(open(&sealed).unwrap_err().kind(), io::ErrorKind::InvalidData);
            sealed[i] ^= 0x40;
        }
        assert!(open(&sealed).is_ok());
    }

    #[test]
    fn reordered_chunks_fail_authentication() {
        let mut data = vec![1; CHUNK_SIZE];
        data.extend_from_slice(&[2; CHUNK_SIZE]);
        data.extend_from_slice(&[3; 10]);
        let sealed = seal(&data);

        let sealed_chunk = CHUNK_SIZE + TAG_SIZE;
        let mut swapped = vec![];
        swapped.extend_from_slice(&sealed[sealed_chunk..2 * sealed_chunk]);
        swapped.extend_from_slice(&sealed[..sealed_chunk]);
        swapped.extend_from_slice(&sealed[2 * sealed_chunk..]);

        assert_eq!(open(&swapped).unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        // Garbage merged into the final short chunk breaks its tag.
        let mut sealed = seal(b"short");
        sealed.extend_from_slice(&[0; 3]);
        assert_eq!(open(&sealed).unwrap_err().kind(), io::ErrorKind::InvalidData);

        // Garbage in its own read after a full-size final chunk is caught by the
        // stream-termination check.
        let mut sealed = seal(&[42; 2 * CHUNK_SIZE]);
        sealed.extend_from_slice(&[0; 3]);
        assert_eq!(open(&sealed).unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    /// A reader that produces one byte per call, to exercise the refill loop.
    struct Trickle<'a>(&'a [u8]);

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0.is_empty() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.0[0];
            self.0 = &self.0[1..];
            Ok(1)
        }
    }

    #[test]
    fn tolerates_short_reads() {
        let data: Vec<u8> = (0..CHUNK_SIZE + 100).map(|i| (i / 7) as u8).collect();
        let sealed = seal(&data);

        let mut buf = vec![];
        Stream::decrypt(&key(), Trickle(&sealed))
            .read_to_end(&mut buf)
            .unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn concatenated_streams_are_rejected() {
        let sealed = seal(b"first");
        let mut doubled = sealed.clone();
        doubled.extend_from_slice(&sealed);
        assert_eq!(open(&doubled).unwrap_err().kind(), io::ErrorKind::InvalidData);
    }
}
