// Copyright 2022 OpenStax Poland
// Licensed under the MIT license. See LICENSE file in the project root for
// full license text.

//! Server side of an SMTP session

use std::future::Future;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{config, mail::{Envelope, MailObject}};
use super::{
    codec::{self, CodecError, EncodeError, Incoming, ReplyCode, Verb},
    data::{self, DataError},
    transport::{Transport, TransportError},
};

/// Where completed mail objects go
///
/// A failed store is answered with 452 and leaves the session degraded.
pub trait MailSink {
    /// Handle to a stored mail, reported back once the session ends
    type Receipt: Send;

    fn store(&self, mail: &MailObject)
    -> impl Future<Output = anyhow::Result<Self::Receipt>> + Send;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Waiting for EHLO or HELO
    Clear,
    /// Greeted, waiting for MAIL
    Ehlo,
    /// Sender known, waiting for the first RCPT
    Mail,
    /// At least one recipient, waiting for more or for DATA
    Rcpt,
    /// Storage failed; no further mail is accepted
    Degraded,
}

/// What the session has to do in response to a command
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Reply(ReplyCode, Option<&'static str>),
    /// Reply 354 and receive message data
    ReceiveData,
    /// Reply 221 and end the session
    Quit,
}

impl Step {
    fn reply(code: ReplyCode) -> Self {
        Step::Reply(code, None)
    }
}

/// Command sequencing and envelope bookkeeping, without any I/O
#[derive(Debug)]
pub struct Machine {
    state: State,
    envelope: Envelope,
    max_recipients: usize,
}

impl Machine {
    pub fn new(max_recipients: usize) -> Self {
        Machine {
            state: State::Clear,
            envelope: Envelope::default(),
            max_recipients,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> State {
        self.state
    }

    #[cfg(test)]
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn handle(&mut self, incoming: Incoming) -> Step {
        let command = match incoming {
            Incoming::Command(command) => command,
            Incoming::Malformed { verb: Verb::Ehlo | Verb::Helo | Verb::Mail | Verb::Rcpt, .. } =>
                return Step::reply(ReplyCode::CannotAccommodate),
            // Only an overlong line can make the other commands malformed
            Incoming::Malformed { .. } =>
                return Step::Reply(ReplyCode::CommandUnrecognized, Some("Line too long")),
            Incoming::Unrecognized(_) => return Step::reply(ReplyCode::CommandUnrecognized),
        };

        let parameter = command.parameter.as_deref().unwrap_or_default();

        match (self.state, command.verb) {
            (_, Verb::Quit) => {
                self.envelope.clear();
                Step::Quit
            }
            (_, Verb::Noop) => Step::reply(ReplyCode::Ok),
            (_, Verb::Vrfy) => Step::reply(ReplyCode::CannotVerify),

            (State::Clear, Verb::Ehlo | Verb::Helo) => {
                self.state = State::Ehlo;
                Step::reply(ReplyCode::Ok)
            }
            (_, Verb::Ehlo | Verb::Helo) => Step::reply(ReplyCode::BadSequence),

            (State::Ehlo, Verb::Mail) => match self.envelope.set_sender(parameter) {
                Ok(()) => {
                    self.state = State::Mail;
                    Step::reply(ReplyCode::Ok)
                }
                Err(_) => Step::reply(ReplyCode::InsufficientStorage),
            },
            (State::Degraded, Verb::Mail) => Step::reply(ReplyCode::ExceededStorage),
            (_, Verb::Mail) => Step::reply(ReplyCode::BadSequence),

            (State::Mail | State::Rcpt, Verb::Rcpt) => self.add_recipient(parameter),
            (_, Verb::Rcpt) => Step::reply(ReplyCode::BadSequence),

            (State::Rcpt, Verb::Data) => Step::ReceiveData,
            (_, Verb::Data) => Step::reply(ReplyCode::BadSequence),

            (State::Mail | State::Rcpt, Verb::Rset) => {
                self.envelope.clear();
                self.state = State::Ehlo;
                Step::reply(ReplyCode::Ok)
            }
            (_, Verb::Rset) => Step::reply(ReplyCode::Ok),
        }
    }

    fn add_recipient(&mut self, recipient: &str) -> Step {
        if self.envelope.recipients().len() >= self.max_recipients {
            return Step::Reply(ReplyCode::InsufficientStorage, Some("Too many recipients"));
        }

        match self.envelope.add_recipient(recipient) {
            Ok(()) => {
                self.state = State::Rcpt;
                Step::reply(ReplyCode::Ok)
            }
            Err(_) => Step::reply(ReplyCode::InsufficientStorage),
        }
    }

    /// Turn the envelope and a received body into a mail object, ready for
    /// the next transaction
    pub fn complete(&mut self, body: Vec<u8>) -> Option<MailObject> {
        self.state = State::Ehlo;
        self.envelope.complete(body)
    }

    /// Drop the current transaction, ready for the next one
    pub fn abort(&mut self) {
        self.envelope.clear();
        self.state = State::Ehlo;
    }

    /// Drop the current transaction and refuse further mail
    pub fn degrade(&mut self) {
        self.envelope.clear();
        self.state = State::Degraded;
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection closed without QUIT")]
    Closed,
    #[error("connection closed during message data")]
    DataTruncated,
    #[error(transparent)]
    Transport(TransportError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => SessionError::Closed,
            err => SessionError::Transport(err),
        }
    }
}

impl From<CodecError> for SessionError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Encode(err) => err.into(),
            CodecError::Transport(err) => err.into(),
        }
    }
}

/// How a session ended
#[derive(Debug)]
pub struct Outcome<R> {
    /// Receipts of all mails stored during the session, in order
    pub received: Vec<R>,
    /// `Ok` if the client quit
    pub result: Result<(), SessionError>,
}

/// One inbound SMTP session
pub struct Session<'a, S, K: MailSink> {
    transport: Transport<S>,
    machine: Machine,
    sink: &'a K,
    hostname: &'a str,
    max_message_size: Option<usize>,
    received: Vec<K::Receipt>,
}

impl<'a, S, K> Session<'a, S, K>
where
    S: AsyncRead + AsyncWrite + Unpin,
    K: MailSink,
{
    pub fn new(stream: S, sink: &'a K, config: &'a config::Smtp) -> Self {
        let mut transport = Transport::new(stream);
        transport.set_timeout(Some(config.timeout()));

        Session {
            transport,
            machine: Machine::new(config.max_recipients),
            sink,
            hostname: &config.hostname,
            max_message_size: config.max_message_size,
            received: Vec::new(),
        }
    }

    /// Greet the client and serve commands until QUIT or a transport error
    pub async fn run(&mut self) -> Outcome<K::Receipt> {
        let result = self.serve().await;
        Outcome {
            received: std::mem::take(&mut self.received),
            result,
        }
    }

    async fn serve(&mut self) -> Result<(), SessionError> {
        self.reply(ReplyCode::ServiceReady, None).await?;

        loop {
            let incoming = codec::recv_command(&mut self.transport).await?;

            match self.machine.handle(incoming) {
                Step::Reply(code, message) => self.reply(code, message).await?,
                Step::ReceiveData => {
                    self.reply(ReplyCode::StartMailInput, None).await?;
                    self.receive_data().await?;
                }
                Step::Quit => {
                    self.reply(ReplyCode::Closing, None).await?;
                    return Ok(());
                }
            }
        }
    }

    async fn receive_data(&mut self) -> Result<(), SessionError> {
        let body = match data::read_mail_data(&mut self.transport, self.max_message_size).await {
            Ok(body) => body,
            Err(DataError::Closed) => return Err(SessionError::DataTruncated),
            Err(DataError::Transport(err)) => return Err(err.into()),
            Err(err @ DataError::TooLarge { .. }) => {
                log::warn!("rejecting message: {err}");
                self.machine.abort();
                return self.reply(ReplyCode::ExceededStorage, None).await;
            }
            Err(err @ DataError::BareLineBreak) => {
                log::warn!("rejecting message: {err}");
                self.machine.abort();
                return self.reply(ReplyCode::TransactionFailed, Some("Bare CR or LF in message data")).await;
            }
            Err(err @ DataError::NoMemory(_)) => {
                log::error!("rejecting message: {err}");
                self.machine.abort();
                return self.reply(ReplyCode::InsufficientStorage, None).await;
            }
        };

        let mail = match self.machine.complete(body) {
            Some(mail) => mail,
            None => return self.reply(ReplyCode::LocalError, None).await,
        };

        match self.sink.store(&mail).await {
            Ok(receipt) => {
                log::info!(
                    "received mail from <{}> for {} recipient(s), {} bytes",
                    mail.sender(),
                    mail.recipients().len(),
                    mail.body_size(),
                );
                self.received.push(receipt);
                self.reply(ReplyCode::Ok, None).await
            }
            Err(err) => {
                log::error!("could not store mail from <{}>: {err:?}", mail.sender());
                self.machine.degrade();
                self.reply(ReplyCode::InsufficientStorage, None).await
            }
        }
    }

    async fn reply(&mut self, code: ReplyCode, message: Option<&str>) -> Result<(), SessionError> {
        codec::send_reply(&mut self.transport, code, message, self.hostname).await?;
        Ok(())
    }
}
