// Copyright 2022 OpenStax Poland
// Licensed under the MIT license. See LICENSE file in the project root for
// full license text.

//! SMTP server

use anyhow::{Context, Result};
use std::{net::{Ipv6Addr, SocketAddr}, sync::Arc};
use tokio::{net::{TcpListener, TcpStream}, sync::Semaphore};

use crate::{config::Config, relay::Relay, spool::Spool};
use super::session::Session;

pub async fn start(config: Arc<Config>, spool: Arc<Spool>, relay: Arc<Relay>) -> Result<()> {
    let port = config.smtp.port;
    let listener = TcpListener::bind((Ipv6Addr::UNSPECIFIED, port))
        .await
        .with_context(|| format!("could not bind TCP socket on [{}]:{}", Ipv6Addr::UNSPECIFIED, port))?;

    log::info!("Started SMTP server on {}", listener.local_addr()?);

    serve(listener, config, spool, relay).await
}

/// Accept connections on `listener`, serving at most
/// `config.smtp.max_connections` of them at once
async fn serve(
    listener: TcpListener,
    config: Arc<Config>,
    spool: Arc<Spool>,
    relay: Arc<Relay>,
) -> Result<()> {
    let connections = Arc::new(Semaphore::new(config.smtp.max_connections.max(1)));

    loop {
        let permit = connections.clone()
            .acquire_owned()
            .await
            .context("connection limit closed")?;

        let (socket, addr) = listener.accept()
            .await
            .context("could not accept connection")?;

        let config = config.clone();
        let spool = spool.clone();
        let relay = relay.clone();

        tokio::spawn(async move {
            handle_client(&config, &spool, &relay, socket, addr).await;
            drop(permit);
        });
    }
}

/// Handle one SMTP connection, then relay whatever it delivered
async fn handle_client(
    config: &Config,
    spool: &Spool,
    relay: &Relay,
    socket: TcpStream,
    addr: SocketAddr,
) {
    log::debug!("accepted connection from {addr}");

    let outcome = Session::new(socket, spool, &config.smtp).run().await;

    if let Err(err) = outcome.result {
        log::error!("error serving {addr}: {err}");
    }

    if !outcome.received.is_empty() {
        relay.relay(outcome.received).await;
    }
}
