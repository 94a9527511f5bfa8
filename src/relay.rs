// Copyright 2022 OpenStax Poland
// Licensed under the MIT license. See LICENSE file in the project root for
// full license text.

//! Forwarding of spooled mail to the upstream server

use anyhow::{Context, Result};
use std::{path::{Path, PathBuf}, sync::Arc, time::Duration};
use tokio::{net::TcpStream, time::{self, MissedTickBehavior}};

use crate::{
    config::Config,
    mail::{FormatError, MailObject},
    smtp::{client::{Client, Continuation, Delivery}, extension::Extension},
    spool::Spool,
    transform::{TransformError, Transformer},
};

/// How long to wait for the upstream server to accept a connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Relay {
    config: Arc<Config>,
    spool: Arc<Spool>,
    transformer: Transformer,
}

impl Relay {
    pub fn new(config: Arc<Config>, spool: Arc<Spool>) -> Self {
        let transformer = Transformer::new(&config.crypto.tool);
        Relay { config, spool, transformer }
    }

    /// Deliver spooled mails over a single upstream session
    ///
    /// Delivered files are removed. Anything that could not be delivered is
    /// moved to unsent storage, except mail which can never be prepared for
    /// relay, which goes to failed storage. Nothing is dropped.
    pub async fn relay(&self, paths: Vec<PathBuf>) {
        let mut prepared = Vec::with_capacity(paths.len());

        for path in paths {
            match self.prepare(&path).await {
                Ok(mail) => prepared.push((path, mail)),
                Err(err) if is_permanent(&err) => {
                    log::error!("cannot relay {}: {err:#}", path.display());
                    self.give_up(&path).await;
                }
                Err(err) => {
                    log::warn!("could not prepare {} for relay: {err:#}", path.display());
                    self.defer(&path).await;
                }
            }
        }

        if prepared.is_empty() {
            return;
        }

        let mut client = match self.connect().await {
            Ok(client) => client,
            Err(err) => {
                log::warn!("could not connect to upstream server: {err:#}");
                for (path, _) in &prepared {
                    self.defer(path).await;
                }
                return;
            }
        };

        for (index, (path, mail)) in prepared.iter().enumerate() {
            let continuation = if index + 1 == prepared.len() {
                Continuation::Last
            } else {
                Continuation::More
            };

            if !mail.body().is_ascii() && !client.extensions().contains(Extension::EightBitMime) {
                log::warn!("upstream server does not announce 8BITMIME, relaying 8-bit body of {} anyway", path.display());
            }

            match client.send_mail(mail, continuation).await {
                Ok(delivery) => {
                    if let Delivery::QuitFailed(err) = delivery {
                        log::warn!("mail delivered, but upstream session did not close cleanly: {err}");
                    }

                    log::info!(
                        "relayed mail from <{}> to {} recipient(s) upstream",
                        mail.sender(),
                        mail.recipients().len(),
                    );

                    if let Err(err) = self.spool.remove(path).await {
                        log::error!("{err:#}");
                    }
                }
                Err(err) => {
                    log::warn!("could not relay {}: {err}", path.display());
                    for (path, _) in &prepared[index..] {
                        self.defer(path).await;
                    }
                    return;
                }
            }
        }
    }

    /// Try once to deliver every mail in unsent storage, each over its own
    /// connection
    pub async fn retry_unsent(&self) -> Result<()> {
        let paths = self.spool.list_unsent().await?;

        if !paths.is_empty() {
            log::debug!("retrying {} unsent mail(s)", paths.len());
        }

        for path in paths {
            self.relay(vec![path]).await;
        }

        Ok(())
    }

    /// Retry unsent mail periodically, forever
    pub async fn retry_service(self: Arc<Self>) -> Result<()> {
        let mut interval = time::interval(self.config.spool.retry_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            if let Err(err) = self.retry_unsent().await {
                log::error!("could not retry unsent mail: {err:?}");
            }
        }
    }

    async fn prepare(&self, path: &Path) -> Result<MailObject> {
        let mut mail = self.spool.load(path).await?;
        let plan = self.config.rules.plan(&mail, self.config.crypto.single_recipient_only);

        if !plan.is_empty() {
            log::debug!("applying {plan:?} to {}", path.display());
            let body = self.transformer.apply_all(mail.body().to_vec(), &plan).await?;
            mail.set_body(body);
        }

        Ok(mail)
    }

    async fn connect(&self) -> Result<Client<TcpStream>> {
        let relay = &self.config.relay;

        let stream = time::timeout(CONNECT_TIMEOUT, TcpStream::connect((relay.host.as_str(), relay.port)))
            .await
            .with_context(|| format!("timed out connecting to {}:{}", relay.host, relay.port))?
            .with_context(|| format!("could not connect to {}:{}", relay.host, relay.port))?;

        Ok(Client::connect(stream, self.config.relay_hostname(), &relay.timeouts).await?)
    }

    async fn defer(&self, path: &Path) {
        match self.spool.move_to_unsent(path).await {
            Ok(moved) => log::warn!("mail {} moved to unsent storage", moved.display()),
            Err(err) => log::error!("{err:#}"),
        }
    }

    async fn give_up(&self, path: &Path) {
        match self.spool.move_to_failed(path).await {
            Ok(moved) => log::error!("mail {} moved to failed storage", moved.display()),
            Err(err) => log::error!("{err:#}"),
        }
    }
}

/// Whether preparing a mail failed in a way that retrying cannot fix: the
/// spool file is corrupt, or the S/MIME tool rejected the mail
fn is_permanent(err: &anyhow::Error) -> bool {
    err.downcast_ref::<FormatError>().is_some()
        || matches!(err.downcast_ref::<TransformError>(), Some(TransformError::Failed { .. }))
}
