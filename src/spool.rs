// Copyright 2022 OpenStax Poland
// Licensed under the MIT license. See LICENSE file in the project root for
// full license text.

//! On-disk storage of mail awaiting relay
//!
//! Accepted mail is written to the pending directory and removed once
//! relayed. Mail which could not be relayed is moved to the unsent directory,
//! from which it is retried periodically. Mail which can never be relayed is
//! moved to the failed directory instead. Files are first written under a
//! temporary name starting with a dot and then renamed, so that a file with
//! a regular name is always complete.

use anyhow::{anyhow, Context, Result};
use std::{io, path::{Path, PathBuf}};
use tokio::fs;

use crate::{config, mail::MailObject, smtp::session::MailSink, util};

pub struct Spool {
    pending: PathBuf,
    unsent: PathBuf,
    failed: PathBuf,
}

impl Spool {
    /// Open spool directories, creating them if necessary
    pub async fn open(config: &config::Spool) -> Result<Self> {
        for dir in [&config.pending, &config.unsent, &config.failed] {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("could not create spool directory {}", dir.display()))?;
        }

        Ok(Spool {
            pending: config.pending.clone(),
            unsent: config.unsent.clone(),
            failed: config.failed.clone(),
        })
    }

    /// Write `mail` into the pending directory
    pub async fn store(&self, mail: &MailObject) -> Result<PathBuf> {
        let name = util::unique_name();
        let temporary = self.pending.join(format!(".{name}.tmp"));
        let target = self.pending.join(&name);

        if let Err(err) = fs::write(&temporary, mail.to_bytes()).await {
            let _ = fs::remove_file(&temporary).await;
            return Err(err).with_context(|| format!("could not write {}", temporary.display()));
        }

        if let Err(err) = fs::rename(&temporary, &target).await {
            let _ = fs::remove_file(&temporary).await;
            return Err(err).with_context(|| format!("could not publish {}", target.display()));
        }

        Ok(target)
    }

    pub async fn load(&self, path: &Path) -> Result<MailObject> {
        let data = fs::read(path)
            .await
            .with_context(|| format!("could not read {}", path.display()))?;

        MailObject::from_bytes(&data)
            .with_context(|| format!("malformed spool file {}", path.display()))
    }

    /// Move a file into the unsent directory, returning its new path
    pub async fn move_to_unsent(&self, path: &Path) -> Result<PathBuf> {
        move_into(&self.unsent, path).await
    }

    /// Move a file that will never be relayed out of the way, returning its
    /// new path
    pub async fn move_to_failed(&self, path: &Path) -> Result<PathBuf> {
        move_into(&self.failed, path).await
    }

    pub async fn remove(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)
            .await
            .with_context(|| format!("could not remove {}", path.display()))
    }

    /// Files in the unsent directory, oldest first
    pub async fn list_unsent(&self) -> Result<Vec<PathBuf>> {
        list(&self.unsent).await
    }

    /// Move mail left in the pending directory by a previous run to the
    /// unsent directory, and clean up incomplete files
    pub async fn recover(&self) -> Result<usize> {
        let mut entries = fs::read_dir(&self.pending)
            .await
            .with_context(|| format!("could not list {}", self.pending.display()))?;
        let mut recovered = 0;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();

            if is_temporary(&path) {
                log::debug!("removing incomplete spool file {}", path.display());
                fs::remove_file(&path).await?;
            } else if entry.file_type().await?.is_file() {
                self.move_to_unsent(&path).await?;
                recovered += 1;
            }
        }

        Ok(recovered)
    }
}

impl MailSink for Spool {
    type Receipt = PathBuf;

    async fn store(&self, mail: &MailObject) -> Result<PathBuf> {
        Spool::store(self, mail).await
    }
}

fn is_temporary(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map_or(true, |name| name.starts_with('.'))
}

async fn move_into(dir: &Path, path: &Path) -> Result<PathBuf> {
    let name = path.file_name()
        .ok_or_else(|| anyhow!("{} is not a spool file", path.display()))?;
    let target = dir.join(name);

    if path == target {
        return Ok(target);
    }

    match fs::rename(path, &target).await {
        Ok(()) => Ok(target),
        // Directories on different file systems
        Err(err) if err.kind() != io::ErrorKind::NotFound => {
            log::debug!("rename of {} failed ({err}), copying instead", path.display());
            fs::copy(path, &target)
                .await
                .with_context(|| format!("could not move {} to {}", path.display(), target.display()))?;
            fs::remove_file(path).await?;
            Ok(target)
        }
        Err(err) => Err(err).with_context(|| format!("could not move {}", path.display())),
    }
}

async fn list(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("could not list {}", dir.display()))?;
    let mut files = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !is_temporary(&path) && entry.file_type().await?.is_file() {
            files.push(path);
        }
    }

    // Names start with a timestamp
    files.sort();
    Ok(files)
}
