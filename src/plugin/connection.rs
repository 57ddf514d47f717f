//! The framed stanza transport between an age client and a plugin process.

use io_tee::{ReadExt, TeeReader, TeeWriter, WriteExt};
use std::env;
use std::io::{self, BufRead, BufReader, Read, Stderr, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use zeroize::Zeroize;

use crate::format::{read, write, Stanza};

/// A reader that optionally copies everything it reads to stderr, for
/// `AGEDEBUG=plugin` transcripts.
enum DebugReader<R: Read> {
    Off(R),
    On(TeeReader<R, Stderr>),
}

impl<R: Read> DebugReader<R> {
    fn new(reader: R, debug: bool) -> Self {
        if debug {
            DebugReader::On(reader.tee_dbg())
        } else {
            DebugReader::Off(reader)
        }
    }
}

impl<R: Read> Read for DebugReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DebugReader::Off(reader) => reader.read(buf),
            DebugReader::On(reader) => reader.read(buf),
        }
    }
}

/// A writer that optionally copies everything written through it to stderr.
enum DebugWriter<W: Write> {
    Off(W),
    On(TeeWriter<W, Stderr>),
}

impl<W: Write> DebugWriter<W> {
    fn new(writer: W, debug: bool) -> Self {
        if debug {
            DebugWriter::On(writer.tee_dbg())
        } else {
            DebugWriter::Off(writer)
        }
    }
}

impl<W: Write> Write for DebugWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            DebugWriter::Off(writer) => writer.write(buf),
            DebugWriter::On(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            DebugWriter::Off(writer) => writer.flush(),
            DebugWriter::On(writer) => writer.flush(),
        }
    }
}

/// What became of a plugin process once its session ended.
pub(crate) struct SessionReport {
    /// Whether the process exited with a zero status (vacuously true for connections
    /// that have no process behind them).
    pub(crate) success: bool,
    /// Captured standard error of the process.
    pub(crate) stderr: String,
}

/// A connection carrying stanzas to and from a plugin.
///
/// The session owns the subprocess: every exit path (including drop during a panic or
/// cancellation) closes the pipes, interrupts the plugin, and reaps it.
pub(crate) struct Connection<R: Read, W: Write> {
    input: Option<BufReader<DebugReader<R>>>,
    output: Option<DebugWriter<W>>,
    buffer: Vec<u8>,
    child: Option<Child>,
}

impl Connection<ChildStdout, ChildStdin> {
    /// Spawns the plugin binary at `path` with the given protocol, in the system
    /// temporary directory, with all three standard streams piped.
    pub(crate) fn open(path: &Path, protocol: &str) -> io::Result<Self> {
        let debug = env::var("AGEDEBUG").map(|s| s == "plugin").unwrap_or(false);

        let mut child = Command::new(path)
            .arg(format!("--age-plugin={}", protocol))
            .current_dir(env::temp_dir())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stdin = child.stdin.take().expect("stdin was piped");

        Ok(Connection {
            input: Some(BufReader::new(DebugReader::new(stdout, debug))),
            output: Some(DebugWriter::new(stdin, debug)),
            buffer: vec![],
            child: Some(child),
        })
    }
}

impl<R: Read, W: Write> Connection<R, W> {
    /// A connection over arbitrary byte streams, with no process attached.
    #[cfg(test)]
    pub(crate) fn from_parts(input: R, output: W) -> Self {
        Connection {
            input: Some(BufReader::new(DebugReader::new(input, false))),
            output: Some(DebugWriter::new(output, false)),
            buffer: vec![],
            child: None,
        }
    }

    /// Marshals one stanza to the plugin.
    pub(crate) fn send(&mut self, stanza: &Stanza) -> io::Result<()> {
        let output = self
            .output
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "connection is closed"))?;

        cookie_factory::gen_simple(write::stanza(stanza), &mut *output)
            .map_err(|e| match e {
                cookie_factory::GenError::IoError(e) => e,
                e => io::Error::new(io::ErrorKind::Other, format!("{:?}", e)),
            })
            .and_then(|w| w.flush())
    }

    /// Marshals a command stanza built from borrowed parts.
    pub(crate) fn send_command(&mut self, tag: &str, args: &[&str], body: &[u8]) -> io::Result<()> {
        self.send(&Stanza {
            tag: tag.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            body: body.to_vec(),
        })
    }

    /// Reads the next stanza from the plugin, pulling lines as the parser needs them.
    pub(crate) fn receive(&mut self) -> io::Result<Stanza> {
        let input = self
            .input
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "connection is closed"))?;

        loop {
            if !self.buffer.is_empty() {
                match read::stanza(&self.buffer) {
                    Ok((rest, stanza)) => {
                        let consumed = self.buffer.len() - rest.len();
                        let remainder = self.buffer.split_off(consumed);
                        // The buffer may have held key material (e.g. a file-key body).
                        self.buffer.zeroize();
                        self.buffer = remainder;
                        return Ok(stanza);
                    }
                    Err(nom::Err::Incomplete(_)) => (),
                    Err(_) => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "malformed stanza from plugin",
                        ));
                    }
                }
            }

            if input.read_until(b'\n', &mut self.buffer)? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "plugin closed the connection mid-stanza",
                ));
            }
        }
    }

    /// Ends the session: closes both pipes, interrupts the plugin, awaits its exit,
    /// and captures its stderr. Idempotent; later calls report success.
    pub(crate) fn shutdown(&mut self) -> io::Result<SessionReport> {
        self.output.take();
        self.input.take();
        self.buffer.zeroize();

        let child = match self.child.take() {
            Some(child) => child,
            None => {
                return Ok(SessionReport {
                    success: true,
                    stderr: String::new(),
                })
            }
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGINT);
        }

        // Only stderr is still attached to the child, so this drains it and reaps.
        let output = child.wait_with_output()?;
        Ok(SessionReport {
            success: output.status.success(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl<R: Read, W: Write> Drop for Connection<R, W> {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::Connection;
    use crate::format::Stanza;

    #[test]
    fn stanza_exchange_over_pipes() {
        let incoming = b"-> ok some-arg\ncGx1Z2lu\n".to_vec();
        let mut outgoing = vec![];

        let mut conn = Connection::from_parts(&incoming[..], &mut outgoing);

        conn.send_command("add-recipient", &["age1example"], &[])
            .unwrap();
        conn.send_command("wrap-file-key", &[], b"YELLOW SUBMARINE")
            .unwrap();

        let reply = conn.receive().unwrap();
        assert_eq!(reply.tag, "ok");
        assert_eq!(reply.args, &["some-arg"]);
        assert_eq!(reply.body, b"plugin");

        // The connection has no process attached, so shutdown trivially succeeds.
        assert!(conn.shutdown().unwrap().success);

        drop(conn);
        assert_eq!(
            String::from_utf8(outgoing).unwrap(),
            "-> add-recipient age1example\n\n-> wrap-file-key\nWUVMTE9XIFNVQk1BUklORQ\n"
        );
    }

    #[test]
    fn receive_handles_split_lines() {
        // A reader that yields one byte at a time forces the incremental parse path.
        struct OneByte<'a>(&'a [u8]);
        impl io::Read for OneByte<'_> {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.0.is_empty() {
                    return Ok(0);
                }
                buf[0] = self.0[0];
                self.0 = &self.0[1..];
                Ok(1)
            }
        }

        let incoming = b"-> file-key 0\nWUVMTE9XIFNVQk1BUklORQ\n";
        let mut conn = Connection::from_parts(OneByte(incoming), vec![]);
        let stanza = conn.receive().unwrap();
        assert_eq!(stanza.tag, "file-key");
        assert_eq!(stanza.body, b"YELLOW SUBMARINE");
    }

    #[test]
    fn eof_mid_stanza_is_an_error() {
        let mut conn = Connection::from_parts(&b"-> file-key 0\n"[..], vec![]);
        assert_eq!(
            conn.receive().unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn malformed_stanza_is_an_error() {
        let mut conn = Connection::from_parts(&b"not a stanza\n"[..], vec![]);
        assert_eq!(
            conn.receive().unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
    }

    #[test]
    fn round_trip_through_codec() {
        let stanza = Stanza {
            tag: "recipient-stanza".to_string(),
            args: vec!["0".to_string(), "test".to_string()],
            body: vec![1, 2, 3],
        };
        let mut wire = vec![];
        {
            let mut conn = Connection::from_parts(&b""[..], &mut wire);
            conn.send(&stanza).unwrap();
        }
        let mut conn = Connection::from_parts(&wire[..], vec![]);
        assert_eq!(conn.receive().unwrap(), stanza);
    }
}
