// Copyright 2022 OpenStax Poland
// Licensed under the MIT license. See LICENSE file in the project root for
// full license text.

//! Mail objects in transit and their on-disk representation

use std::{collections::TryReserveError, fmt, str};
use memchr::memchr;
use thiserror::Error;

use crate::util;

/// A complete message: envelope plus opaque body
///
/// Values of this type are always well-formed: they have at least one
/// recipient. The sender may be empty (null reverse-path, used for bounces).
#[derive(Clone, PartialEq, Eq)]
pub struct MailObject {
    sender: String,
    recipients: Vec<String>,
    body: Vec<u8>,
}

impl MailObject {
    pub fn new(sender: impl Into<String>, recipients: Vec<String>, body: Vec<u8>)
    -> Result<Self, FormatError> {
        if recipients.is_empty() {
            return Err(FormatError::NoRecipients);
        }

        Ok(MailObject { sender: sender.into(), recipients, body })
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_size(&self) -> usize {
        self.body.len()
    }

    /// Replace the body, e.g. with the output of a transformation
    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    /// Serialize into the spool file format
    ///
    /// ```text
    /// sender LF
    /// recipient count LF
    /// recipient LF (repeated count times)
    /// body (raw bytes, to end of file)
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let header: usize = self.sender.len() + 24
            + self.recipients.iter().map(|r| r.len() + 1).sum::<usize>();
        let mut out = Vec::with_capacity(header + self.body.len());

        out.extend_from_slice(self.sender.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(self.recipients.len().to_string().as_bytes());
        out.push(b'\n');
        for recipient in &self.recipients {
            out.extend_from_slice(recipient.as_bytes());
            out.push(b'\n');
        }
        out.extend_from_slice(&self.body);

        out
    }

    /// Parse the spool file format produced by [`MailObject::to_bytes`]
    pub fn from_bytes(mut data: &[u8]) -> Result<Self, FormatError> {
        let sender = next_line(&mut data).ok_or(FormatError::MissingSender)?.to_string();

        let count = next_line(&mut data).ok_or(FormatError::MissingCount)?;
        let count: usize = count.parse().map_err(|_| FormatError::BadCount(count.to_string()))?;

        if count == 0 {
            return Err(FormatError::NoRecipients);
        }

        let mut recipients = Vec::new();
        for index in 0..count {
            let recipient = next_line(&mut data)
                .ok_or(FormatError::MissingRecipient { index, count })?;
            recipients.push(recipient.to_string());
        }

        MailObject::new(sender, recipients, data.to_vec())
    }
}

impl fmt::Debug for MailObject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MailObject")
            .field("sender", &self.sender)
            .field("recipients", &self.recipients)
            .field("body", &util::maybe_ascii(&self.body[..self.body.len().min(64)]))
            .field("body_size", &self.body.len())
            .finish()
    }
}

/// Take one LF-terminated UTF-8 line off the front of `data`
fn next_line<'a>(data: &mut &'a [u8]) -> Option<&'a str> {
    let end = memchr(b'\n', data)?;
    let line = str::from_utf8(&data[..end]).ok()?;
    *data = &data[end + 1..];
    Some(line)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("missing sender line")]
    MissingSender,
    #[error("missing recipient count line")]
    MissingCount,
    #[error("invalid recipient count {0:?}")]
    BadCount(String),
    #[error("missing recipient {index} of {count}")]
    MissingRecipient { index: usize, count: usize },
    #[error("mail object has no recipients")]
    NoRecipients,
}

/// Envelope of a mail transaction being built by a server session
///
/// This never leaves the session; [`Envelope::complete`] turns it into a
/// [`MailObject`] once a body has been received.
#[derive(Debug, Default)]
pub struct Envelope {
    sender: Option<String>,
    recipients: Vec<String>,
}

impl Envelope {
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.sender.is_none() && self.recipients.is_empty()
    }

    /// Record the reverse-path, leaving the envelope untouched on failure
    pub fn set_sender(&mut self, sender: &str) -> Result<(), TryReserveError> {
        let mut owned = String::new();
        owned.try_reserve_exact(sender.len())?;
        owned.push_str(sender);
        self.sender = Some(owned);
        Ok(())
    }

    /// Append a forward-path, leaving the envelope untouched on failure
    pub fn add_recipient(&mut self, recipient: &str) -> Result<(), TryReserveError> {
        let mut owned = String::new();
        owned.try_reserve_exact(recipient.len())?;
        owned.push_str(recipient);
        self.recipients.try_reserve(1)?;
        self.recipients.push(owned);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.sender = None;
        self.recipients.clear();
    }

    /// Combine this envelope with a body, leaving the envelope empty
    ///
    /// Returns `None` if the envelope lacks a sender or recipients.
    pub fn complete(&mut self, body: Vec<u8>) -> Option<MailObject> {
        let sender = self.sender.take()?;
        let recipients = std::mem::take(&mut self.recipients);
        MailObject::new(sender, recipients, body).ok()
    }
}
