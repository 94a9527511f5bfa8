// Copyright 2022 OpenStax Poland
// Licensed under the MIT license. See LICENSE file in the project root for
// full license text.

//! Buffered line transport over a connected byte stream

use std::{future::Future, io, time::Duration};
use thiserror::Error;
use tokio::{io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt}, time};

use crate::util;

/// Maximum length of a command or reply line, including the trailing CRLF
pub const LINE_MAX: usize = 256;

/// Size of the per-connection read buffer
const READ_BUFFER: usize = 4096;

#[derive(Debug, Error)]
pub enum TransportError {
    /// Peer closed the connection before sending anything
    #[error("connection closed by peer")]
    Closed,
    /// Peer closed the connection in the middle of a line
    #[error("connection closed mid-line after {:?}", util::maybe_ascii(.0))]
    Truncated(Vec<u8>),
    /// No line terminator within the allowed length. The rest of the line has
    /// been discarded; this carries the first bytes of it.
    #[error("line longer than {limit} bytes: {:?}...", util::maybe_ascii(.prefix))]
    LineTooLong { limit: usize, prefix: Vec<u8> },
    /// Peer did not accept or provide any data in time
    #[error("no activity within {0:?}")]
    TimedOut(Duration),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One end of an SMTP connection
///
/// Owns the stream together with its read buffer, so bytes read ahead of the
/// current line stay with the connection they came from.
pub struct Transport<S> {
    stream: S,
    buffer: Box<[u8]>,
    start: usize,
    end: usize,
    timeout: Option<Duration>,
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Transport {
            stream,
            buffer: vec![0; READ_BUFFER].into_boxed_slice(),
            start: 0,
            end: 0,
            timeout: None,
        }
    }

    /// Limit how long any single read or write may wait for the peer
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Write all of `data`, retrying short and interrupted writes
    pub async fn write_exact(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut written = 0;

        while written < data.len() {
            match bounded(self.timeout, self.stream.write(&data[written..])).await? {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => written += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }

        loop {
            match bounded(self.timeout, self.stream.flush()).await? {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Read a single byte, returning `None` on end of stream
    pub async fn read_byte(&mut self) -> Result<Option<u8>, TransportError> {
        if self.start == self.end && self.fill().await? == 0 {
            return Ok(None);
        }

        let byte = self.buffer[self.start];
        self.start += 1;
        Ok(Some(byte))
    }

    /// Read one CRLF-terminated line, returning it without the terminator
    ///
    /// `max_len` counts the terminator. A lone CR or LF inside a line is
    /// kept as data.
    pub async fn read_line(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let mut line = Vec::with_capacity(max_len.min(LINE_MAX));

        loop {
            let byte = match self.read_byte().await? {
                Some(byte) => byte,
                None if line.is_empty() => return Err(TransportError::Closed),
                None => return Err(TransportError::Truncated(line)),
            };

            line.push(byte);

            if line.ends_with(b"\r\n") {
                line.truncate(line.len() - 2);
                return Ok(line);
            }

            if line.len() >= max_len {
                return self.discard_line(line, max_len).await;
            }
        }
    }

    /// Skip the remainder of an overlong line so the next read starts on a
    /// fresh one
    async fn discard_line(&mut self, prefix: Vec<u8>, limit: usize)
    -> Result<Vec<u8>, TransportError> {
        let mut last = prefix.last().copied();

        loop {
            match self.read_byte().await? {
                None => return Err(TransportError::Truncated(prefix)),
                Some(b'\n') if last == Some(b'\r') => {
                    return Err(TransportError::LineTooLong { limit, prefix });
                }
                Some(byte) => last = Some(byte),
            }
        }
    }

    async fn fill(&mut self) -> Result<usize, TransportError> {
        loop {
            match bounded(self.timeout, self.stream.read(&mut self.buffer)).await? {
                Ok(read) => {
                    self.start = 0;
                    self.end = read;
                    return Ok(read);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

async fn bounded<T>(limit: Option<Duration>, operation: impl Future<Output = io::Result<T>>)
-> Result<io::Result<T>, TransportError> {
    match limit {
        None => Ok(operation.await),
        Some(limit) => time::timeout(limit, operation)
            .await
            .map_err(|_| TransportError::TimedOut(limit)),
    }
}
