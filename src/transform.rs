// Copyright 2022 OpenStax Poland
// Licensed under the MIT license. See LICENSE file in the project root for
// full license text.

//! S/MIME operations, delegated to an external program
//!
//! The program is invoked as
//! `<tool> <operation> --cert <file> [--key <file>] [--ca <file>]` with the
//! message on standard input, and prints the result on standard output. A key
//! password is passed in the `SMIME_KEY_PASS` environment variable, never on
//! the command line. `<tool> --version` must succeed for the program to be
//! considered usable.

use std::{io, path::{Path, PathBuf}, process::Stdio};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};

/// Environment variable carrying the private key's password
pub const PASSWORD_VAR: &str = "SMIME_KEY_PASS";

#[derive(Clone, PartialEq, Eq)]
pub enum Transform {
    Sign { certificate: PathBuf, key: PathBuf, password: Option<String> },
    Encrypt { certificate: PathBuf },
    Decrypt { certificate: PathBuf, key: PathBuf, password: Option<String> },
    Verify { certificate: PathBuf, ca_certificate: PathBuf },
}

impl Transform {
    pub fn operation(&self) -> &'static str {
        match self {
            Transform::Sign { .. } => "sign",
            Transform::Encrypt { .. } => "encrypt",
            Transform::Decrypt { .. } => "decrypt",
            Transform::Verify { .. } => "verify",
        }
    }

    fn certificate(&self) -> &Path {
        match self {
            Transform::Sign { certificate, .. }
            | Transform::Encrypt { certificate }
            | Transform::Decrypt { certificate, .. }
            | Transform::Verify { certificate, .. } => certificate,
        }
    }

    fn key(&self) -> Option<(&Path, Option<&str>)> {
        match self {
            Transform::Sign { key, password, .. } | Transform::Decrypt { key, password, .. } =>
                Some((key, password.as_deref())),
            Transform::Encrypt { .. } | Transform::Verify { .. } => None,
        }
    }

    fn ca_certificate(&self) -> Option<&Path> {
        match self {
            Transform::Verify { ca_certificate, .. } => Some(ca_certificate),
            _ => None,
        }
    }
}

// Passwords stay out of logs
impl std::fmt::Debug for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut debug = f.debug_struct(self.operation());
        debug.field("certificate", &self.certificate());
        if let Some((key, password)) = self.key() {
            debug.field("key", &key).field("password", &password.map(|_| "***"));
        }
        if let Some(ca_certificate) = self.ca_certificate() {
            debug.field("ca_certificate", &ca_certificate);
        }
        debug.finish()
    }
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("could not run {}: {source}", .tool.display())]
    Spawn { tool: PathBuf, source: io::Error },
    #[error("{operation} failed ({status}): {stderr}")]
    Failed { operation: &'static str, status: std::process::ExitStatus, stderr: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct Transformer {
    tool: PathBuf,
}

impl Transformer {
    pub fn new(tool: impl Into<PathBuf>) -> Self {
        Transformer { tool: tool.into() }
    }

    /// Check that the tool can be run, returning the version it reports
    pub async fn version(&self) -> Result<String, TransformError> {
        let output = Command::new(&self.tool)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| TransformError::Spawn { tool: self.tool.clone(), source })?;

        if !output.status.success() {
            return Err(TransformError::Failed {
                operation: "version check",
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run `transform` over `body`, returning the transformed body
    pub async fn apply(&self, body: &[u8], transform: &Transform) -> Result<Vec<u8>, TransformError> {
        let mut command = Command::new(&self.tool);
        command.arg(transform.operation())
            .arg("--cert")
            .arg(transform.certificate());

        if let Some((key, password)) = transform.key() {
            command.arg("--key").arg(key);
            if let Some(password) = password {
                command.env(PASSWORD_VAR, password);
            }
        }

        if let Some(ca_certificate) = transform.ca_certificate() {
            command.arg("--ca").arg(ca_certificate);
        }

        command.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| TransformError::Spawn {
            tool: self.tool.clone(),
            source,
        })?;

        let mut stdin = child.stdin.take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "no stdin"))?;

        let input = async move {
            match stdin.write_all(body).await {
                // The tool may refuse to read, its exit status tells why
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                result => result,
            }
        };

        let (_, output) = tokio::try_join!(input, child.wait_with_output())?;

        log::debug!("{} exited with {}, {} bytes of output", transform.operation(), output.status, output.stdout.len());

        if !output.status.success() {
            return Err(TransformError::Failed {
                operation: transform.operation(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(output.stdout)
    }

    /// Run all of `plan` over `body`, in order
    pub async fn apply_all(&self, mut body: Vec<u8>, plan: &[Transform]) -> Result<Vec<u8>, TransformError> {
        for transform in plan {
            body = self.apply(&body, transform).await?;
        }
        Ok(body)
    }
}
