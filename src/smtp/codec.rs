// Copyright 2022 OpenStax Poland
// Licensed under the MIT license. See LICENSE file in the project root for
// full license text.

//! Encoding and decoding of SMTP command and reply lines

use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{mail::MailObject, util};
use super::{
    syntax::{self, SliceExt, SyntaxError},
    transport::{Transport, TransportError, LINE_MAX},
};

/// Commands understood by the gateway
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    Ehlo,
    Helo,
    Mail,
    Rcpt,
    Data,
    Rset,
    Vrfy,
    Noop,
    Quit,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Ehlo => "EHLO",
            Verb::Helo => "HELO",
            Verb::Mail => "MAIL",
            Verb::Rcpt => "RCPT",
            Verb::Data => "DATA",
            Verb::Rset => "RSET",
            Verb::Vrfy => "VRFY",
            Verb::Noop => "NOOP",
            Verb::Quit => "QUIT",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded client command
///
/// `parameter` holds the domain for EHLO/HELO, the mailbox for MAIL/RCPT
/// (empty for a null reverse-path) and the argument of VRFY, if any.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub verb: Verb,
    pub parameter: Option<String>,
}

/// Result of decoding one command line
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Incoming {
    Command(Command),
    /// Command was recognized but its parameter is invalid
    Malformed { verb: Verb, reason: SyntaxError },
    /// Line does not start with a known command; carries the raw line
    Unrecognized(Vec<u8>),
}

/// Reply codes the gateway sends and understands
///
/// `OkContinued` is the `250-` line of a multi-line reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReplyCode {
    ServiceReady,
    Closing,
    Ok,
    OkContinued,
    WillForward,
    CannotVerify,
    StartMailInput,
    MailboxBusy,
    LocalError,
    InsufficientStorage,
    CannotAccommodate,
    CommandUnrecognized,
    NotImplemented,
    BadSequence,
    ParameterNotImplemented,
    MailboxUnavailable,
    UserNotLocal,
    ExceededStorage,
    MailboxNameNotAllowed,
    TransactionFailed,
    ParametersNotRecognized,
}

impl ReplyCode {
    pub const ALL: [ReplyCode; 21] = [
        ReplyCode::ServiceReady,
        ReplyCode::Closing,
        ReplyCode::Ok,
        ReplyCode::OkContinued,
        ReplyCode::WillForward,
        ReplyCode::CannotVerify,
        ReplyCode::StartMailInput,
        ReplyCode::MailboxBusy,
        ReplyCode::LocalError,
        ReplyCode::InsufficientStorage,
        ReplyCode::CannotAccommodate,
        ReplyCode::CommandUnrecognized,
        ReplyCode::NotImplemented,
        ReplyCode::BadSequence,
        ReplyCode::ParameterNotImplemented,
        ReplyCode::MailboxUnavailable,
        ReplyCode::UserNotLocal,
        ReplyCode::ExceededStorage,
        ReplyCode::MailboxNameNotAllowed,
        ReplyCode::TransactionFailed,
        ReplyCode::ParametersNotRecognized,
    ];

    pub fn code(self) -> u16 {
        match self {
            ReplyCode::ServiceReady => 220,
            ReplyCode::Closing => 221,
            ReplyCode::Ok | ReplyCode::OkContinued => 250,
            ReplyCode::WillForward => 251,
            ReplyCode::CannotVerify => 252,
            ReplyCode::StartMailInput => 354,
            ReplyCode::MailboxBusy => 450,
            ReplyCode::LocalError => 451,
            ReplyCode::InsufficientStorage => 452,
            ReplyCode::CannotAccommodate => 455,
            ReplyCode::CommandUnrecognized => 500,
            ReplyCode::NotImplemented => 502,
            ReplyCode::BadSequence => 503,
            ReplyCode::ParameterNotImplemented => 504,
            ReplyCode::MailboxUnavailable => 550,
            ReplyCode::UserNotLocal => 551,
            ReplyCode::ExceededStorage => 552,
            ReplyCode::MailboxNameNotAllowed => 553,
            ReplyCode::TransactionFailed => 554,
            ReplyCode::ParametersNotRecognized => 555,
        }
    }

    pub fn is_continued(self) -> bool {
        self == ReplyCode::OkContinued
    }

    /// Text sent when no message is supplied
    ///
    /// The greeting's text depends on the host name and is built by
    /// [`encode_reply`]; continued replies have no default.
    pub fn default_message(self) -> Option<&'static str> {
        Some(match self {
            ReplyCode::ServiceReady => "Service ready",
            ReplyCode::Closing => "closing connection, bye",
            ReplyCode::Ok => "OK",
            ReplyCode::OkContinued => return None,
            ReplyCode::WillForward => "User not local; will forward to next hop",
            ReplyCode::CannotVerify =>
                "cannot VRFY user, but will accept message and attempt delivery",
            ReplyCode::StartMailInput => "Start mail input; end with <CRLF>.<CRLF>",
            ReplyCode::MailboxBusy => "Requested mail action not taken: mailbox unavailable",
            ReplyCode::LocalError => "Requested action aborted: local error in processing",
            ReplyCode::InsufficientStorage =>
                "Requested action not taken: insufficient system storage",
            ReplyCode::CannotAccommodate => "Server unable to accommodate parameters",
            ReplyCode::CommandUnrecognized => "Syntax error, command unrecognized",
            ReplyCode::NotImplemented => "Command not implemented",
            ReplyCode::BadSequence => "Bad sequence of commands",
            ReplyCode::ParameterNotImplemented => "Command parameter not implemented",
            ReplyCode::MailboxUnavailable => "Requested action not taken: mailbox unavailable",
            ReplyCode::UserNotLocal => "User not local; please try <forward-path>",
            ReplyCode::ExceededStorage =>
                "Requested mail action aborted: exceeded storage allocation",
            ReplyCode::MailboxNameNotAllowed =>
                "Requested action not taken: mailbox name not allowed",
            ReplyCode::TransactionFailed => "Transaction failed",
            ReplyCode::ParametersNotRecognized =>
                "MAIL FROM/RCPT TO parameters not recognized or not implemented",
        })
    }

    /// Look up a numeric code; `continued` selects the `250-` form
    pub fn from_code(code: u16, continued: bool) -> Option<Self> {
        if continued {
            return (code == 250).then_some(ReplyCode::OkContinued);
        }

        ReplyCode::ALL.iter()
            .copied()
            .find(|reply| !reply.is_continued() && reply.code() == code)
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}", self.code(), if self.is_continued() { "-" } else { "" })
    }
}

/// A decoded server reply line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub code: ReplyCode,
    pub message: String,
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let separator = if self.code.is_continued() { "" } else { " " };
        write!(f, "{}{separator}{}", self.code, self.message)
    }
}

/// Result of decoding one reply line
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IncomingReply {
    Reply(Reply),
    /// Line does not carry a known reply code; carries the raw line
    Unrecognized(Vec<u8>),
}

impl fmt::Display for IncomingReply {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IncomingReply::Reply(reply) => reply.fmt(f),
            IncomingReply::Unrecognized(line) => write!(f, "{}", util::maybe_ascii(line)),
        }
    }
}

/// Commands the gateway sends when relaying
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request<'a> {
    Ehlo,
    Helo,
    /// MAIL FROM with the mail object's sender
    Mail,
    /// RCPT TO with the recipient at this index of the mail object
    Rcpt(usize),
    Data,
    Rset,
    Vrfy(&'a str),
    Noop,
    Quit,
}

impl Request<'_> {
    pub fn verb(self) -> Verb {
        match self {
            Request::Ehlo => Verb::Ehlo,
            Request::Helo => Verb::Helo,
            Request::Mail => Verb::Mail,
            Request::Rcpt(_) => Verb::Rcpt,
            Request::Data => Verb::Data,
            Request::Rset => Verb::Rset,
            Request::Vrfy(_) => Verb::Vrfy,
            Request::Noop => Verb::Noop,
            Request::Quit => Verb::Quit,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("{0} requires a mail object")]
    MissingMail(Verb),
    #[error("recipient index {index} out of range for {count} recipients")]
    RecipientOutOfRange { index: usize, count: usize },
    #[error("reply {0} requires a message")]
    MissingMessage(ReplyCode),
    #[error("line longer than {0} bytes")]
    LineTooLong(usize),
    #[error("line break inside command argument")]
    LineBreak,
}

/// Render a command line, CRLF included
///
/// EHLO and HELO announce `hostname`. MAIL and RCPT take their addresses
/// from `mail`.
pub fn encode_command(request: Request, mail: Option<&MailObject>, hostname: &str)
-> Result<Vec<u8>, EncodeError> {
    let mail_for = |verb| mail.ok_or(EncodeError::MissingMail(verb));

    let line = match request {
        Request::Ehlo => format!("EHLO {hostname}"),
        Request::Helo => format!("HELO {hostname}"),
        Request::Mail => format!("MAIL FROM:<{}>", mail_for(Verb::Mail)?.sender()),
        Request::Rcpt(index) => {
            let recipients = mail_for(Verb::Rcpt)?.recipients();
            let recipient = recipients.get(index).ok_or(EncodeError::RecipientOutOfRange {
                index,
                count: recipients.len(),
            })?;
            format!("RCPT TO:<{recipient}>")
        }
        Request::Data => "DATA".into(),
        Request::Rset => "RSET".into(),
        Request::Vrfy(user) => format!("VRFY {user}"),
        Request::Noop => "NOOP".into(),
        Request::Quit => "QUIT".into(),
    };

    if line.contains(['\r', '\n']) {
        return Err(EncodeError::LineBreak);
    }

    if line.len() + 2 > LINE_MAX {
        return Err(EncodeError::LineTooLong(LINE_MAX));
    }

    let mut data = line.into_bytes();
    data.extend_from_slice(b"\r\n");
    Ok(data)
}

/// Render a reply line, CRLF included
///
/// Without `message` the code's canonical text is used. A supplied message
/// is cut at its first line break and shortened to fit in [`LINE_MAX`].
pub fn encode_reply(code: ReplyCode, message: Option<&str>, hostname: &str)
-> Result<Vec<u8>, EncodeError> {
    let text = match (code, message) {
        (_, Some(message)) => message.to_string(),
        (ReplyCode::ServiceReady, None) => format!("{hostname} Service ready"),
        (_, None) => code.default_message().ok_or(EncodeError::MissingMessage(code))?.into(),
    };

    let text = text.split(['\r', '\n']).next().unwrap_or_default();
    let text = truncate(text, LINE_MAX - 4 - 2);
    let separator = if code.is_continued() { '-' } else { ' ' };

    Ok(format!("{}{separator}{text}\r\n", code.code()).into_bytes())
}

/// Longest prefix of `text` no longer than `max` bytes, on a char boundary
fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }

    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Classify one command line (without CRLF)
pub fn parse_command(line: &[u8]) -> Incoming {
    let verb = match_prefix_ignore_ascii_case! { line;
        b"EHLO" => Verb::Ehlo,
        b"HELO" => Verb::Helo,
        b"MAIL" => Verb::Mail,
        b"RCPT" => Verb::Rcpt,
        b"DATA" => Verb::Data,
        b"RSET" => Verb::Rset,
        b"VRFY" => Verb::Vrfy,
        b"NOOP" => Verb::Noop,
        b"QUIT" => Verb::Quit,
        _ => return Incoming::Unrecognized(line.to_vec()),
    };

    let mut rest = &line[4..];

    let parameter = match verb {
        Verb::Ehlo | Verb::Helo => syntax::domain(&mut rest).map(|domain| Some(domain.to_string())),
        Verb::Mail => address_parameter(&mut rest, " FROM:", true).map(Some),
        Verb::Rcpt => address_parameter(&mut rest, " TO:", false).map(Some),
        Verb::Vrfy => Ok(argument(rest)),
        Verb::Data | Verb::Rset | Verb::Noop | Verb::Quit => Ok(None),
    };

    match parameter {
        Ok(parameter) => Incoming::Command(Command { verb, parameter }),
        Err(reason) => Incoming::Malformed { verb, reason },
    }
}

fn address_parameter(line: &mut &[u8], keyword: &'static str, allow_null: bool)
-> syntax::Result<String> {
    line.expect_caseless(keyword)?;
    let address = syntax::path(line)?;
    syntax::parameters(line)?;

    if address.is_empty() && !allow_null {
        return Err(SyntaxError::Missing);
    }

    Ok(address.to_string())
}

fn argument(line: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Classify one reply line (without CRLF)
pub fn parse_reply(line: &[u8]) -> IncomingReply {
    let unrecognized = || IncomingReply::Unrecognized(line.to_vec());

    if line.len() < 3 || !line[..3].iter().all(u8::is_ascii_digit) {
        return unrecognized();
    }

    let code = line[..3].iter().fold(0u16, |code, digit| code * 10 + u16::from(digit - b'0'));

    let continued = match line.get(3) {
        None | Some(b' ') => false,
        Some(b'-') => true,
        Some(_) => return unrecognized(),
    };

    match ReplyCode::from_code(code, continued) {
        None => unrecognized(),
        Some(code) => IncomingReply::Reply(Reply {
            code,
            message: String::from_utf8_lossy(line.get(4..).unwrap_or_default()).into_owned(),
        }),
    }
}

/// Read and decode one command
///
/// Overlong lines of a known command are reported as malformed.
pub async fn recv_command<S>(transport: &mut Transport<S>) -> Result<Incoming, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match transport.read_line(LINE_MAX).await {
        Ok(line) => {
            log::trace!(">> {}", util::maybe_ascii(&line));
            Ok(parse_command(&line))
        }
        Err(TransportError::LineTooLong { limit, prefix }) => {
            log::trace!(">> {}... (overlong)", util::maybe_ascii(&prefix));
            Ok(match parse_command(&prefix) {
                Incoming::Command(Command { verb, .. }) | Incoming::Malformed { verb, .. } =>
                    Incoming::Malformed { verb, reason: SyntaxError::TooLong(limit) },
                Incoming::Unrecognized(_) => Incoming::Unrecognized(prefix),
            })
        }
        Err(err) => Err(err),
    }
}

/// Read and decode one reply line
pub async fn recv_reply<S>(transport: &mut Transport<S>) -> Result<IncomingReply, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match transport.read_line(LINE_MAX).await {
        Ok(line) => {
            log::trace!(">> {}", util::maybe_ascii(&line));
            Ok(parse_reply(&line))
        }
        Err(TransportError::LineTooLong { prefix, .. }) => {
            log::trace!(">> {}... (overlong)", util::maybe_ascii(&prefix));
            Ok(IncomingReply::Unrecognized(prefix))
        }
        Err(err) => Err(err),
    }
}

/// Encode and send one command
pub async fn send_command<S>(
    transport: &mut Transport<S>,
    request: Request<'_>,
    mail: Option<&MailObject>,
    hostname: &str,
) -> Result<(), CodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = encode_command(request, mail, hostname)?;
    log::trace!("<< {}", util::maybe_ascii(&line));
    transport.write_exact(&line).await?;
    Ok(())
}

/// Encode and send one reply
pub async fn send_reply<S>(
    transport: &mut Transport<S>,
    code: ReplyCode,
    message: Option<&str>,
    hostname: &str,
) -> Result<(), CodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = encode_reply(code, message, hostname)?;
    log::trace!("<< {}", util::maybe_ascii(&line));
    transport.write_exact(&line).await?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn mail() -> MailObject {
        MailObject::new("a@x.com", vec!["a@b.com".into(), "c@d.com".into()], vec![]).unwrap()
    }

    fn command(verb: Verb, parameter: Option<&str>) -> Incoming {
        Incoming::Command(Command { verb, parameter: parameter.map(str::to_string) })
    }

    #[test]
    fn canonical_replies() {
        assert_eq!(encode_reply(ReplyCode::Ok, None, "gate").unwrap(), b"250 OK\r\n");
        assert_eq!(
            encode_reply(ReplyCode::StartMailInput, None, "gate").unwrap(),
            b"354 Start mail input; end with <CRLF>.<CRLF>\r\n",
        );
        assert_eq!(
            encode_reply(ReplyCode::ServiceReady, None, "gate.example").unwrap(),
            b"220 gate.example Service ready\r\n",
        );
        assert_eq!(
            encode_reply(ReplyCode::Closing, None, "gate").unwrap(),
            b"221 closing connection, bye\r\n",
        );
        assert_eq!(
            encode_reply(ReplyCode::CannotVerify, None, "gate").unwrap(),
            b"252 cannot VRFY user, but will accept message and attempt delivery\r\n",
        );
    }

    #[test]
    fn every_terminal_reply_has_default_text() {
        for code in ReplyCode::ALL {
            let encoded = encode_reply(code, None, "gate");
            if code.is_continued() {
                assert_eq!(encoded, Err(EncodeError::MissingMessage(code)));
            } else {
                let line = encoded.unwrap();
                assert!(line.starts_with(format!("{} ", code.code()).as_bytes()));
                assert!(line.ends_with(b"\r\n"));
            }
        }
    }

    #[test]
    fn custom_messages() {
        assert_eq!(
            encode_reply(ReplyCode::OkContinued, Some("PIPELINING"), "gate").unwrap(),
            b"250-PIPELINING\r\n",
        );
        assert_eq!(
            encode_reply(ReplyCode::Ok, Some("queued\r\n250 injected"), "gate").unwrap(),
            b"250 queued\r\n",
        );

        let long = "x".repeat(400);
        let line = encode_reply(ReplyCode::TransactionFailed, Some(&long), "gate").unwrap();
        assert_eq!(line.len(), LINE_MAX);
        assert!(line.starts_with(b"554 xxx"));
        assert!(line.ends_with(b"x\r\n"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "é".repeat(200);
        let line = encode_reply(ReplyCode::Ok, Some(&text), "gate").unwrap();
        assert!(line.len() <= LINE_MAX);
        assert!(String::from_utf8(line).is_ok());
    }

    #[test]
    fn command_lines() {
        let mail = mail();
        assert_eq!(encode_command(Request::Quit, None, "gate").unwrap(), b"QUIT\r\n");
        assert_eq!(encode_command(Request::Data, None, "gate").unwrap(), b"DATA\r\n");
        assert_eq!(encode_command(Request::Ehlo, None, "gate.example").unwrap(), b"EHLO gate.example\r\n");
        assert_eq!(
            encode_command(Request::Mail, Some(&mail), "gate").unwrap(),
            b"MAIL FROM:<a@x.com>\r\n",
        );
        assert_eq!(
            encode_command(Request::Rcpt(0), Some(&mail), "gate").unwrap(),
            b"RCPT TO:<a@b.com>\r\n",
        );
        assert_eq!(
            encode_command(Request::Rcpt(1), Some(&mail), "gate").unwrap(),
            b"RCPT TO:<c@d.com>\r\n",
        );
    }

    #[test]
    fn command_argument_errors() {
        let mail = mail();
        assert_eq!(
            encode_command(Request::Rcpt(2), Some(&mail), "gate"),
            Err(EncodeError::RecipientOutOfRange { index: 2, count: 2 }),
        );
        assert_eq!(encode_command(Request::Mail, None, "gate"), Err(EncodeError::MissingMail(Verb::Mail)));
        assert_eq!(encode_command(Request::Rcpt(0), None, "gate"), Err(EncodeError::MissingMail(Verb::Rcpt)));

        let long = MailObject::new("a".repeat(300), vec!["b@c".into()], vec![]).unwrap();
        assert_eq!(encode_command(Request::Mail, Some(&long), "gate"), Err(EncodeError::LineTooLong(LINE_MAX)));

        let broken = MailObject::new("a\r@x", vec!["b@c".into()], vec![]).unwrap();
        assert_eq!(encode_command(Request::Mail, Some(&broken), "gate"), Err(EncodeError::LineBreak));
    }

    #[test]
    fn parses_known_commands() {
        assert_eq!(parse_command(b"EHLO client.example"), command(Verb::Ehlo, Some("client.example")));
        assert_eq!(parse_command(b"helo client"), command(Verb::Helo, Some("client")));
        assert_eq!(parse_command(b"MAIL FROM:<a@x.com>"), command(Verb::Mail, Some("a@x.com")));
        assert_eq!(parse_command(b"mail from:<>"), command(Verb::Mail, Some("")));
        assert_eq!(
            parse_command(b"MAIL FROM:<a@x.com> BODY=8BITMIME"),
            command(Verb::Mail, Some("a@x.com")),
        );
        assert_eq!(parse_command(b"RCPT TO:<b@y.com>"), command(Verb::Rcpt, Some("b@y.com")));
        assert_eq!(parse_command(b"DATA"), command(Verb::Data, None));
        assert_eq!(parse_command(b"rset"), command(Verb::Rset, None));
        assert_eq!(parse_command(b"VRFY someone"), command(Verb::Vrfy, Some("someone")));
        assert_eq!(parse_command(b"VRFY"), command(Verb::Vrfy, None));
        assert_eq!(parse_command(b"NOOP whatever"), command(Verb::Noop, None));
        assert_eq!(parse_command(b"QUIT"), command(Verb::Quit, None));
    }

    #[test]
    fn malformed_parameters_keep_the_verb() {
        assert_eq!(
            parse_command(b"MAIL FROM:a@x.com"),
            Incoming::Malformed { verb: Verb::Mail, reason: SyntaxError::Expected("<") },
        );
        assert_eq!(
            parse_command(b"MAIL FROM:<a@x.com"),
            Incoming::Malformed { verb: Verb::Mail, reason: SyntaxError::Expected(">") },
        );
        assert_eq!(
            parse_command(b"RCPT <b@y.com>"),
            Incoming::Malformed { verb: Verb::Rcpt, reason: SyntaxError::Expected(" TO:") },
        );
        assert_eq!(
            parse_command(b"RCPT TO:<>"),
            Incoming::Malformed { verb: Verb::Rcpt, reason: SyntaxError::Missing },
        );
        assert_eq!(
            parse_command(b"EHLO"),
            Incoming::Malformed { verb: Verb::Ehlo, reason: SyntaxError::Expected(" ") },
        );
    }

    #[test]
    fn unknown_commands_carry_the_line() {
        assert_eq!(parse_command(b"STARTTLS"), Incoming::Unrecognized(b"STARTTLS".to_vec()));
        assert_eq!(parse_command(b""), Incoming::Unrecognized(vec![]));
        assert_eq!(parse_command(b"\xff\xfe"), Incoming::Unrecognized(b"\xff\xfe".to_vec()));
    }

    #[test]
    fn parses_replies() {
        assert_eq!(
            parse_reply(b"250 OK"),
            IncomingReply::Reply(Reply { code: ReplyCode::Ok, message: "OK".into() }),
        );
        assert_eq!(
            parse_reply(b"250-8BITMIME"),
            IncomingReply::Reply(Reply { code: ReplyCode::OkContinued, message: "8BITMIME".into() }),
        );
        assert_eq!(
            parse_reply(b"221"),
            IncomingReply::Reply(Reply { code: ReplyCode::Closing, message: String::new() }),
        );
        assert_eq!(
            parse_reply(b"354 go ahead"),
            IncomingReply::Reply(Reply { code: ReplyCode::StartMailInput, message: "go ahead".into() }),
        );
    }

    #[test]
    fn unknown_replies_are_typed() {
        for line in [&b"421 closing"[..], b"25", b"abc OK", b"220-multi", b"250x", b""] {
            assert_eq!(parse_reply(line), IncomingReply::Unrecognized(line.to_vec()));
        }
    }

    #[tokio::test]
    async fn overlong_command_is_malformed() {
        let mut line = b"MAIL FROM:<".to_vec();
        line.extend(std::iter::repeat(b'a').take(400));
        line.extend_from_slice(b">\r\nJUNK\r\n");
        let mut transport = Transport::new(Builder::new().read(&line).build());

        assert_eq!(
            recv_command(&mut transport).await.unwrap(),
            Incoming::Malformed { verb: Verb::Mail, reason: SyntaxError::TooLong(LINE_MAX) },
        );
        assert_eq!(
            recv_command(&mut transport).await.unwrap(),
            Incoming::Unrecognized(b"JUNK".to_vec()),
        );
    }

    #[tokio::test]
    async fn send_and_receive_over_transport() {
        let stream = Builder::new()
            .write(b"NOOP\r\n")
            .write(b"503 Bad sequence of commands\r\n")
            .read(b"250-SIZE 100\r\n250 OK\r\n")
            .build();
        let mut transport = Transport::new(stream);

        send_command(&mut transport, Request::Noop, None, "gate").await.unwrap();
        send_reply(&mut transport, ReplyCode::BadSequence, None, "gate").await.unwrap();

        assert_eq!(
            recv_reply(&mut transport).await.unwrap(),
            IncomingReply::Reply(Reply { code: ReplyCode::OkContinued, message: "SIZE 100".into() }),
        );
        assert_eq!(
            recv_reply(&mut transport).await.unwrap(),
            IncomingReply::Reply(Reply { code: ReplyCode::Ok, message: "OK".into() }),
        );
        assert!(matches!(recv_reply(&mut transport).await, Err(TransportError::Closed)));
    }
}
