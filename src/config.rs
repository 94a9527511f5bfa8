use anyhow::{Context, Result};
use argh::FromArgs;
use serde::Deserialize;
use std::{fs, path::PathBuf, time::Duration};

use crate::{rules::Rules, util};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub smtp: Smtp,
    pub relay: Relay,
    pub spool: Spool,
    pub crypto: Crypto,
    pub rules: Rules,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Smtp {
    pub port: u16,
    /// Name announced in the greeting
    pub hostname: String,
    /// Maximum number of connections served at once
    pub max_connections: usize,
    /// Maximum number of recipients of a single mail
    pub max_recipients: usize,
    /// Maximum size of a message body, in bytes
    pub max_message_size: Option<usize>,
    /// Seconds to wait for the next command or block of message data
    pub timeout: u64,
}

impl Smtp {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1))
    }
}

impl Default for Smtp {
    fn default() -> Self {
        Smtp {
            // RFC 6409 specifies 587 as the SMTP TCP port
            port: 587,
            hostname: util::local_hostname(),
            max_connections: 200,
            max_recipients: 100,
            max_message_size: None,
            // RFC 5321 section 4.5.3.2.7
            timeout: 300,
        }
    }
}

/// Upstream server that accepted mail is forwarded to
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Relay {
    pub host: String,
    pub port: u16,
    /// Name announced in EHLO, if different from [`Smtp::hostname`]
    pub hostname: Option<String>,
    pub timeouts: Timeouts,
}

impl Default for Relay {
    fn default() -> Self {
        Relay {
            host: "127.0.0.1".into(),
            port: 25,
            hostname: None,
            timeouts: Timeouts::default(),
        }
    }
}

/// Seconds to wait for the upstream server at each stage of a transaction
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Initial 220 reply
    pub greeting: u64,
    pub mail: u64,
    pub rcpt: u64,
    /// 354 reply to DATA
    pub data_start: u64,
    /// Each block of message data to be accepted
    pub data_block: u64,
    /// Reply after the end of message data
    pub data_end: u64,
    /// Replies to EHLO, QUIT and any other command
    pub command: u64,
}

impl Default for Timeouts {
    // RFC 5321 section 4.5.3.2
    fn default() -> Self {
        Timeouts {
            greeting: 300,
            mail: 300,
            rcpt: 300,
            data_start: 120,
            data_block: 180,
            data_end: 600,
            command: 300,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Spool {
    /// Mail waiting to be relayed
    pub pending: PathBuf,
    /// Mail that could not be relayed and will be retried
    pub unsent: PathBuf,
    /// Mail that can never be relayed, kept for the administrator
    pub failed: PathBuf,
    /// Seconds between relay attempts for unsent mail
    pub retry_interval: u64,
}

impl Spool {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval.max(1))
    }
}

impl Default for Spool {
    fn default() -> Self {
        Spool {
            pending: "spool/pending".into(),
            unsent: "spool/unsent".into(),
            failed: "spool/failed".into(),
            retry_interval: 60,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Crypto {
    /// Program performing S/MIME operations
    pub tool: PathBuf,
    /// Only decrypt and encrypt mail with exactly one recipient
    pub single_recipient_only: bool,
}

impl Default for Crypto {
    fn default() -> Self {
        Crypto {
            tool: "smime-tool".into(),
            single_recipient_only: true,
        }
    }
}

/// SMTP gateway signing, encrypting and relaying mail
#[derive(FromArgs)]
struct Args {
    /// configuration file to use
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,
    /// port to run SMTP server on
    #[argh(option)]
    smtp_port: Option<u16>,
    /// host to relay mail to
    #[argh(option)]
    relay_host: Option<String>,
    /// port to relay mail to
    #[argh(option)]
    relay_port: Option<u16>,
    /// host name to announce
    #[argh(option)]
    hostname: Option<String>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(port) = self.smtp_port {
            config.smtp.port = port;
        }

        if let Some(host) = self.relay_host {
            config.relay.host = host;
        }

        if let Some(port) = self.relay_port {
            config.relay.port = port;
        }

        if let Some(hostname) = self.hostname {
            config.smtp.hostname = hostname;
        }
    }
}

impl Config {
    /// Host name to announce to the upstream server
    pub fn relay_hostname(&self) -> &str {
        self.relay.hostname.as_deref().unwrap_or(&self.smtp.hostname)
    }
}

pub fn load() -> Result<Config> {
    let args: Args = argh::from_env();

    let mut config = match args.config {
        None => Config::default(),
        Some(ref path) => {
            let data = fs::read_to_string(path)
                .with_context(|| format!("could not read {}", path.display()))?;
            parse(&data).with_context(|| format!("invalid configuration in {}", path.display()))?
        }
    };

    args.apply(&mut config);

    Ok(config)
}

fn parse(data: &str) -> Result<Config> {
    Ok(toml::from_str(data)?)
}
