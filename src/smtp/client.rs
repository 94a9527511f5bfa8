// Copyright 2022 OpenStax Poland
// Licensed under the MIT license. See LICENSE file in the project root for
// full license text.

//! Client side of an SMTP session, used to relay mail upstream

use std::{fmt, time::Duration};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{config, mail::MailObject};
use super::{
    codec::{self, CodecError, EncodeError, IncomingReply, Reply, ReplyCode, Request, Verb},
    data,
    extension::{Extension, ExtensionSet},
    transport::{Transport, TransportError},
};

/// Point in a client session at which a reply was expected
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Greeting,
    Command(Verb),
    MessageData,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Stage::Greeting => f.write_str("greeting"),
            Stage::Command(verb) => verb.fmt(f),
            Stage::MessageData => f.write_str("message data"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("expected {} after {stage}, got {reply}", .expected.code())]
    UnexpectedReply {
        stage: Stage,
        expected: ReplyCode,
        reply: IncomingReply,
    },
    #[error("no reply after {stage} within {limit:?}")]
    TimedOut { stage: Stage, limit: Duration },
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<CodecError> for ClientError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Encode(err) => err.into(),
            CodecError::Transport(err) => err.into(),
        }
    }
}

/// Whether more mail follows on the same connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Continuation {
    More,
    /// Send QUIT after this mail
    Last,
}

/// Result of a successful transfer
#[derive(Debug)]
pub enum Delivery {
    Delivered,
    /// Mail was accepted, but closing the session did not go as expected
    QuitFailed(ClientError),
}

/// One outbound SMTP session
///
/// Commands are sent one at a time, each waiting for its reply, even when
/// the server offers pipelining.
pub struct Client<S> {
    transport: Transport<S>,
    hostname: String,
    timeouts: config::Timeouts,
    extensions: ExtensionSet,
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Take over a freshly opened connection: wait for the greeting and
    /// introduce ourselves as `hostname`
    pub async fn connect(stream: S, hostname: &str, timeouts: &config::Timeouts)
    -> Result<Self, ClientError> {
        let mut client = Client {
            transport: Transport::new(stream),
            hostname: hostname.to_string(),
            timeouts: timeouts.clone(),
            extensions: ExtensionSet::default(),
        };

        client.expect(Stage::Greeting, ReplyCode::ServiceReady).await?;

        let stage = Stage::Command(Verb::Ehlo);
        client.wait_for(stage);
        codec::send_command(&mut client.transport, Request::Ehlo, None, hostname).await?;

        loop {
            match client.recv_reply(stage).await? {
                IncomingReply::Reply(Reply { code: code @ (ReplyCode::Ok | ReplyCode::OkContinued), message }) => {
                    if let Some(extension) = Extension::parse(&message) {
                        client.extensions.insert(extension);
                    }

                    if code == ReplyCode::Ok {
                        break;
                    }
                }
                IncomingReply::Unrecognized(line) if continues(&line, ReplyCode::Ok) => {}
                reply => return Err(ClientError::UnexpectedReply {
                    stage,
                    expected: ReplyCode::Ok,
                    reply,
                }),
            }
        }

        log::debug!("upstream extensions: {:?}", client.extensions);

        Ok(client)
    }

    /// Extensions the server announced in reply to EHLO
    pub fn extensions(&self) -> &ExtensionSet {
        &self.extensions
    }

    /// Transfer one mail
    ///
    /// With [`Continuation::Last`] the session is closed afterwards; a failure
    /// to do so cleanly is reported as [`Delivery::QuitFailed`], since the
    /// mail itself has already been accepted.
    pub async fn send_mail(&mut self, mail: &MailObject, continuation: Continuation)
    -> Result<Delivery, ClientError> {
        self.request(Request::Mail, Some(mail), ReplyCode::Ok).await?;

        for index in 0..mail.recipients().len() {
            self.request(Request::Rcpt(index), Some(mail), ReplyCode::Ok).await?;
        }

        self.request(Request::Data, None, ReplyCode::StartMailInput).await?;

        self.transport.set_timeout(Some(seconds(self.timeouts.data_block)));
        data::write_mail_data(&mut self.transport, mail.body()).await?;
        self.expect(Stage::MessageData, ReplyCode::Ok).await?;

        log::debug!(
            "upstream accepted mail from <{}> for {} recipient(s)",
            mail.sender(),
            mail.recipients().len(),
        );

        match continuation {
            Continuation::More => Ok(Delivery::Delivered),
            Continuation::Last => match self.quit().await {
                Ok(()) => Ok(Delivery::Delivered),
                Err(err) => Ok(Delivery::QuitFailed(err)),
            },
        }
    }

    pub async fn quit(&mut self) -> Result<(), ClientError> {
        self.request(Request::Quit, None, ReplyCode::Closing).await?;
        Ok(())
    }

    /// Send one command and wait for its reply
    async fn request(&mut self, request: Request<'_>, mail: Option<&MailObject>, expected: ReplyCode)
    -> Result<Reply, ClientError> {
        let stage = Stage::Command(request.verb());
        self.wait_for(stage);
        codec::send_command(&mut self.transport, request, mail, &self.hostname).await?;
        self.expect(stage, expected).await
    }

    /// Wait for a reply with `expected` code
    ///
    /// Continuation lines of a multi-line reply with that code are skipped.
    async fn expect(&mut self, stage: Stage, expected: ReplyCode) -> Result<Reply, ClientError> {
        self.wait_for(stage);

        loop {
            match self.recv_reply(stage).await? {
                IncomingReply::Reply(reply) if reply.code == expected => return Ok(reply),
                IncomingReply::Reply(reply)
                if expected == ReplyCode::Ok && reply.code == ReplyCode::OkContinued => continue,
                IncomingReply::Unrecognized(line) if continues(&line, expected) => continue,
                reply => return Err(ClientError::UnexpectedReply { stage, expected, reply }),
            }
        }
    }

    async fn recv_reply(&mut self, stage: Stage) -> Result<IncomingReply, ClientError> {
        match codec::recv_reply(&mut self.transport).await {
            Ok(reply) => Ok(reply),
            Err(TransportError::TimedOut(limit)) => Err(ClientError::TimedOut { stage, limit }),
            Err(err) => Err(err.into()),
        }
    }

    /// Apply the time limit of `stage` to the following reads and writes
    fn wait_for(&mut self, stage: Stage) {
        let timeouts = &self.timeouts;
        let limit = match stage {
            Stage::Greeting => timeouts.greeting,
            Stage::Command(Verb::Mail) => timeouts.mail,
            Stage::Command(Verb::Rcpt) => timeouts.rcpt,
            Stage::Command(Verb::Data) => timeouts.data_start,
            Stage::Command(_) => timeouts.command,
            Stage::MessageData => timeouts.data_end,
        };
        self.transport.set_timeout(Some(seconds(limit)));
    }
}

fn seconds(limit: u64) -> Duration {
    Duration::from_secs(limit.max(1))
}

/// Whether `line` is a non-final line of a multi-line reply with `code`
fn continues(line: &[u8], code: ReplyCode) -> bool {
    line.starts_with(format!("{}-", code.code()).as_bytes())
}

#[cfg(test)]
mod tests {
    use tokio_test::io::{Builder, Mock};
    use super::*;

    const GREETING: [&str; 3] = ["S: 220 relay.test Service ready", "C: EHLO gate.test", "S: 250 relay.test"];

    fn mail() -> MailObject {
        MailObject::new(
            "a@x.com",
            vec!["b@y.com".into(), "c@y.com".into()],
            b"Subject: hi\r\n\r\n.leading dot\r\nend".to_vec(),
        ).unwrap()
    }

    /// Upstream server following a script: `C:` lines must be sent by the
    /// client, `S:` lines are replied
    fn server(script: &[&str]) -> Mock {
        let mut stream = Builder::new();
        for line in script {
            match line.split_at(3) {
                ("C: ", command) => stream.write(format!("{command}\r\n").as_bytes()),
                ("S: ", reply) => stream.read(format!("{reply}\r\n").as_bytes()),
                _ => panic!("bad script line {line:?}"),
            };
        }
        stream.build()
    }

    fn greeted(script: &[&str]) -> Mock {
        server(&[&GREETING[..], script].concat())
    }

    async fn connect(stream: Mock) -> Result<Client<Mock>, ClientError> {
        Client::connect(stream, "gate.test", &config::Timeouts::default()).await
    }

    const TRANSACTION: [&str; 14] = [
        "C: MAIL FROM:<a@x.com>",
        "S: 250 OK",
        "C: RCPT TO:<b@y.com>",
        "S: 250 OK",
        "C: RCPT TO:<c@y.com>",
        "S: 250 OK",
        "C: DATA",
        "S: 354 go ahead",
        "C: Subject: hi",
        "C: ",
        "C: ..leading dot",
        "C: end",
        "C: .",
        "S: 250 queued",
    ];

    #[tokio::test]
    async fn happy_path_with_quit() {
        let stream = greeted(&[&TRANSACTION[..], &["C: QUIT", "S: 221 bye"]].concat());
        let mut client = connect(stream).await.unwrap();

        let delivery = client.send_mail(&mail(), Continuation::Last).await.unwrap();
        assert!(matches!(delivery, Delivery::Delivered));
    }

    #[tokio::test]
    async fn several_mails_on_one_connection() {
        let stream = greeted(&[&TRANSACTION[..], &TRANSACTION, &["C: QUIT", "S: 221 bye"]].concat());
        let mut client = connect(stream).await.unwrap();

        let first = client.send_mail(&mail(), Continuation::More).await.unwrap();
        let second = client.send_mail(&mail(), Continuation::Last).await.unwrap();
        assert!(matches!(first, Delivery::Delivered));
        assert!(matches!(second, Delivery::Delivered));
    }

    #[tokio::test]
    async fn collects_known_extensions() {
        let stream = server(&[
            "S: 220 relay.test ESMTP",
            "C: EHLO gate.test",
            "S: 250-relay.test greets gate.test",
            "S: 250-8BITMIME",
            "S: 250-SIZE 10485760",
            "S: 250-STARTTLS",
            "S: 250-AUTH PLAIN",
            "S: 250 PIPELINING",
        ]);
        let client = connect(stream).await.unwrap();

        let extensions = client.extensions();
        assert!(extensions.contains(Extension::EightBitMime));
        assert!(extensions.contains(Extension::Size));
        assert!(extensions.contains(Extension::Pipelining));
        assert!(!extensions.contains(Extension::Dsn));
        assert_eq!(extensions.iter().count(), 3);
    }

    #[tokio::test]
    async fn multiline_greeting_is_accepted() {
        let stream = server(&[
            "S: 220-relay.test ESMTP",
            "S: 220-no UCE",
            "S: 220 ready",
            "C: EHLO gate.test",
            "S: 250 relay.test",
        ]);
        assert!(connect(stream).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_bad_greeting() {
        let stream = server(&["S: 554 go away"]);
        match connect(stream).await {
            Err(ClientError::UnexpectedReply { stage: Stage::Greeting, expected, .. }) =>
                assert_eq!(expected, ReplyCode::ServiceReady),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("connected despite 554 greeting"),
        }
    }

    #[tokio::test]
    async fn rejected_recipient_aborts() {
        let stream = greeted(&[
            "C: MAIL FROM:<a@x.com>",
            "S: 250 OK",
            "C: RCPT TO:<b@y.com>",
            "S: 250 OK",
            "C: RCPT TO:<c@y.com>",
            "S: 550 no such user",
        ]);
        let mut client = connect(stream).await.unwrap();

        let err = client.send_mail(&mail(), Continuation::Last).await.unwrap_err();
        match err {
            ClientError::UnexpectedReply { stage, reply: IncomingReply::Reply(reply), .. } => {
                assert_eq!(stage, Stage::Command(Verb::Rcpt));
                assert_eq!(reply.code, ReplyCode::MailboxUnavailable);
                assert_eq!(reply.message, "no such user");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn unknown_reply_code_is_an_error() {
        let stream = greeted(&[
            "C: MAIL FROM:<a@x.com>",
            "S: 250 OK",
            "C: RCPT TO:<b@y.com>",
            "S: 250 OK",
            "C: RCPT TO:<c@y.com>",
            "S: 250 OK",
            "C: DATA",
            "S: 421 shutting down",
        ]);
        let mut client = connect(stream).await.unwrap();

        let err = client.send_mail(&mail(), Continuation::More).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::UnexpectedReply { stage: Stage::Command(Verb::Data), reply: IncomingReply::Unrecognized(_), .. }
        ));
        assert_eq!(err.to_string(), "expected 354 after DATA, got 421 shutting down");
    }

    #[tokio::test]
    async fn connection_loss_is_a_transport_error() {
        let stream = greeted(&["C: MAIL FROM:<a@x.com>"]);
        let mut client = connect(stream).await.unwrap();

        let err = client.send_mail(&mail(), Continuation::More).await.unwrap_err();
        assert!(matches!(err, ClientError::Transport(TransportError::Closed)));
    }

    #[tokio::test]
    async fn failed_quit_is_only_a_warning() {
        let stream = greeted(&TRANSACTION);
        let mut client = connect(stream).await.unwrap();

        let delivery = client.send_mail(&mail(), Continuation::Last).await.unwrap();
        assert!(matches!(delivery, Delivery::QuitFailed(ClientError::Transport(_))));
    }

    #[tokio::test]
    async fn multiline_ok_is_accepted() {
        let stream = greeted(&[
            "C: MAIL FROM:<a@x.com>",
            "S: 250-sender",
            "S: 250 OK",
            "C: RCPT TO:<b@y.com>",
            "S: 250 OK",
            "C: RCPT TO:<c@y.com>",
            "S: 250 OK",
            "C: DATA",
            "S: 354 go",
            "C: Subject: hi",
            "C: ",
            "C: ..leading dot",
            "C: end",
            "C: .",
            "S: 250 OK",
        ]);
        let mut client = connect(stream).await.unwrap();
        assert!(client.send_mail(&mail(), Continuation::More).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_times_out() {
        let stream = Builder::new().wait(Duration::from_secs(3600)).build();

        match connect(stream).await {
            Err(ClientError::TimedOut { stage: Stage::Greeting, limit }) =>
                assert_eq!(limit, Duration::from_secs(300)),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("connected without a greeting"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn each_stage_has_its_own_limit() {
        let stream = Builder::new()
            .read(b"220 relay.test\r\n")
            .write(b"EHLO gate.test\r\n")
            .read(b"250 relay.test\r\n")
            .write(b"MAIL FROM:<a@x.com>\r\n")
            .read(b"250 OK\r\n")
            .write(b"RCPT TO:<b@y.com>\r\n")
            .read(b"250 OK\r\n")
            .write(b"RCPT TO:<c@y.com>\r\n")
            .read(b"250 OK\r\n")
            .write(b"DATA\r\n")
            .wait(Duration::from_secs(3600))
            .build();
        let timeouts = config::Timeouts { data_start: 5, ..Default::default() };
        let mut client = Client::connect(stream, "gate.test", &timeouts).await.unwrap();

        match client.send_mail(&mail(), Continuation::More).await {
            Err(ClientError::TimedOut { stage, limit }) => {
                assert_eq!(stage, Stage::Command(Verb::Data));
                assert_eq!(limit, Duration::from_secs(5));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
