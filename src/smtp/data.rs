// Copyright 2022 OpenStax Poland
// Licensed under the MIT license. See LICENSE file in the project root for
// full license text.

//! Message content transfer after DATA (RFC 5321 section 4.5.2)

use std::collections::TryReserveError;
use memchr::memchr3_iter;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use super::transport::{Transport, TransportError};

/// Body buffers grow by this many bytes at a time
const DATA_BLOCK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("connection closed before end of data")]
    Closed,
    /// Message was read to its end and discarded
    #[error("message exceeds {limit} bytes")]
    TooLarge { limit: usize },
    /// Message was read to its end and discarded
    #[error("cannot buffer message: {0}")]
    NoMemory(#[from] TryReserveError),
    /// Message contained a CR or LF that was not part of a CRLF pair. It was
    /// read to its end and discarded.
    #[error("message contains a bare CR or LF")]
    BareLineBreak,
    #[error(transparent)]
    Transport(TransportError),
}

impl From<TransportError> for DataError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed | TransportError::Truncated(_) => DataError::Closed,
            err => DataError::Transport(err),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// After CRLF, or at the very beginning
    LineStart,
    Normal,
    /// After a CR that was stored
    Cr,
    /// After a dot at the start of a line, not yet stored
    Dot,
    /// After dot and CR at the start of a line, neither stored yet
    DotCr,
}

/// Receive a message body up to the terminating `CRLF.CRLF`
///
/// Leading dots are unstuffed and the CRLF before the final dot is not part
/// of the body. A CR or LF outside of a CRLF pair makes the whole message
/// invalid (RFC 5321 section 2.3.8). On any failure the rest of the message
/// is still consumed, so that the connection stays in sync.
pub async fn read_mail_data<S>(transport: &mut Transport<S>, limit: Option<usize>)
-> Result<Vec<u8>, DataError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut body = Body { data: Vec::new(), limit, failure: None };
    let mut state = State::LineStart;

    loop {
        let byte = transport.read_byte().await?.ok_or(DataError::Closed)?;

        state = match (state, byte) {
            (State::LineStart, b'.') => State::Dot,
            (State::Dot, b'\r') => State::DotCr,
            (State::DotCr, b'\n') => break,
            (State::Cr, b'\n') => {
                body.push(byte);
                State::LineStart
            }
            (State::Cr | State::DotCr, byte) => {
                body.fail(DataError::BareLineBreak);
                after(byte)
            }
            (_, b'\n') => {
                body.fail(DataError::BareLineBreak);
                State::Normal
            }
            (_, byte) => {
                body.push(byte);
                after(byte)
            }
        };
    }

    body.finish()
}

fn after(byte: u8) -> State {
    if byte == b'\r' { State::Cr } else { State::Normal }
}

struct Body {
    data: Vec<u8>,
    limit: Option<usize>,
    failure: Option<DataError>,
}

impl Body {
    fn push(&mut self, byte: u8) {
        if self.failure.is_some() {
            return;
        }

        // The final CRLF is stored before it is known to be final
        if let Some(limit) = self.limit {
            if self.data.len() >= limit + 2 {
                self.fail(DataError::TooLarge { limit });
                return;
            }
        }

        if self.data.len() == self.data.capacity() {
            if let Err(err) = self.data.try_reserve_exact(DATA_BLOCK) {
                self.fail(err.into());
                return;
            }
        }

        self.data.push(byte);
    }

    /// Discard the message; only the first failure is kept
    fn fail(&mut self, failure: DataError) {
        if self.failure.is_none() {
            self.data = Vec::new();
            self.failure = Some(failure);
        }
    }

    fn finish(mut self) -> Result<Vec<u8>, DataError> {
        if let Some(failure) = self.failure {
            return Err(failure);
        }

        if self.data.ends_with(b"\r\n") {
            self.data.truncate(self.data.len() - 2);
        }

        match self.limit {
            Some(limit) if self.data.len() > limit => Err(DataError::TooLarge { limit }),
            _ => Ok(self.data),
        }
    }
}

/// Prepare a body for transfer: every CR and LF not in a CRLF pair becomes
/// CRLF, and lines starting with a dot get the dot doubled
pub fn encode_data(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + body.len() / 64 + 1);
    let mut copied = 0;
    let mut line_start = 0;

    for at in memchr3_iter(b'\r', b'\n', b'.', body) {
        // LF of a CRLF pair already copied
        if at < copied {
            continue;
        }

        match body[at] {
            b'.' => {
                if at == line_start {
                    out.extend_from_slice(&body[copied..at]);
                    out.push(b'.');
                    copied = at;
                }
            }
            b'\r' if body.get(at + 1) == Some(&b'\n') => {
                out.extend_from_slice(&body[copied..at + 2]);
                copied = at + 2;
                line_start = copied;
            }
            _ => {
                out.extend_from_slice(&body[copied..at]);
                out.extend_from_slice(b"\r\n");
                copied = at + 1;
                line_start = copied;
            }
        }
    }

    out.extend_from_slice(&body[copied..]);
    out
}

/// Send a message body followed by the end-of-data marker
pub async fn write_mail_data<S>(transport: &mut Transport<S>, body: &[u8])
-> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut data = encode_data(body);
    data.extend_from_slice(b"\r\n.\r\n");
    log::trace!("<< ({} bytes of message data)", data.len());
    transport.write_exact(&data).await
}

#[cfg(test)]
mod tests {
    use tokio_test::io::Builder;
    use super::*;

    async fn receive(input: &[u8], limit: Option<usize>) -> (Result<Vec<u8>, DataError>, Vec<u8>) {
        let mut transport = Transport::new(Builder::new().read(input).build());
        let body = read_mail_data(&mut transport, limit).await;
        let rest = match transport.read_line(1000).await {
            Ok(line) => line,
            Err(_) => vec![],
        };
        (body, rest)
    }

    #[tokio::test]
    async fn empty_body() {
        let (body, rest) = receive(b".\r\nQUIT\r\n", None).await;
        assert_eq!(body.unwrap(), b"");
        assert_eq!(rest, b"QUIT");
    }

    #[tokio::test]
    async fn final_crlf_is_not_content() {
        let (body, _) = receive(b"Subject: x\r\n\r\nhello\r\n.\r\n", None).await;
        assert_eq!(body.unwrap(), b"Subject: x\r\n\r\nhello");
    }

    #[tokio::test]
    async fn leading_dots_are_unstuffed() {
        let (body, _) = receive(b"..hidden\r\n.x\r\na.b\r\n...\r\n.\r\n", None).await;
        assert_eq!(body.unwrap(), b".hidden\r\nx\r\na.b\r\n..");
    }

    #[tokio::test]
    async fn dot_cr_without_lf_is_rejected() {
        let (body, rest) = receive(b".\rx\r\n.\r\nNOOP\r\n", None).await;
        assert!(matches!(body, Err(DataError::BareLineBreak)));
        assert_eq!(rest, b"NOOP");
    }

    #[tokio::test]
    async fn bare_line_feed_cannot_end_data() {
        let (body, rest) = receive(b"hi\n.\r\nMAIL FROM:<evil@x>\r\n.\r\nQUIT\r\n", None).await;
        assert!(matches!(body, Err(DataError::BareLineBreak)));
        assert_eq!(rest, b"QUIT");
    }

    #[tokio::test]
    async fn bare_line_breaks_are_rejected() {
        for input in [&b"a\nb\r\n.\r\n"[..], b"a\rb\r\n.\r\n", b"\n.\r\n.\r\n", b"a\r\r\n.\r\n"] {
            let (body, rest) = receive(input, None).await;
            assert!(matches!(body, Err(DataError::BareLineBreak)), "{input:?} accepted");
            assert_eq!(rest, b"");
        }
    }

    #[tokio::test]
    async fn binary_content_passes_through() {
        let (body, _) = receive(b"\x00\xff\x80\r\n.\r\n", None).await;
        assert_eq!(body.unwrap(), b"\x00\xff\x80");
    }

    #[tokio::test]
    async fn oversized_message_is_drained() {
        let (body, rest) = receive(b"0123456789\r\n0123456789\r\n.\r\nNOOP\r\n", Some(12)).await;
        assert!(matches!(body, Err(DataError::TooLarge { limit: 12 })));
        assert_eq!(rest, b"NOOP");
    }

    #[tokio::test]
    async fn message_at_limit_fits() {
        let (body, _) = receive(b"0123456789\r\n.\r\n", Some(10)).await;
        assert_eq!(body.unwrap(), b"0123456789");

        let (body, _) = receive(b"0123456789a\r\n.\r\n", Some(10)).await;
        assert!(matches!(body, Err(DataError::TooLarge { .. })));
    }

    #[tokio::test]
    async fn eof_inside_data_is_closed() {
        let (body, _) = receive(b"partial message\r\n", None).await;
        assert!(matches!(body, Err(DataError::Closed)));
    }

    #[test]
    fn encoding_doubles_line_leading_dots() {
        assert_eq!(encode_data(b".a\r\nb.c\r\n.\r\n..d"), b"..a\r\nb.c\r\n..\r\n...d");
        assert_eq!(encode_data(b""), b"");
    }

    #[test]
    fn encoding_canonicalizes_line_breaks() {
        assert_eq!(encode_data(b"a\nb\rc\r\nd"), b"a\r\nb\r\nc\r\nd");
        assert_eq!(encode_data(b"a\r\r\n"), b"a\r\n\r\n");
        assert_eq!(encode_data(b"a\n.b"), b"a\r\n..b");
    }

    #[test]
    fn encoded_body_cannot_end_data_early() {
        let wire = encode_data(b"hi\n.\r\nMAIL FROM:<evil@x>");
        assert_eq!(wire, b"hi\r\n..\r\nMAIL FROM:<evil@x>");
        assert!(!wire.windows(5).any(|window| window == b"\r\n.\r\n"));
    }

    #[tokio::test]
    async fn writes_encoded_body_and_terminator() {
        let stream = Builder::new().write(b"..a\r\nb\r\n.\r\n").build();
        let mut transport = Transport::new(stream);
        write_mail_data(&mut transport, b".a\nb").await.unwrap();
    }

    #[tokio::test]
    async fn written_data_reads_back_unchanged() {
        let bodies: [&[u8]; 5] = [b"", b".", b"x\r\n", b"a\r\n.\r\n..b", b"\r\n\r\n"];

        for body in bodies {
            let (sender, receiver) = tokio::io::duplex(1024);
            let mut sender = Transport::new(sender);
            let mut receiver = Transport::new(receiver);

            write_mail_data(&mut sender, body).await.unwrap();
            assert_eq!(read_mail_data(&mut receiver, None).await.unwrap(), body);
        }
    }
}
