// Copyright 2022 OpenStax Poland
// Licensed under the MIT license. See LICENSE file in the project root for
// full license text.

use std::{fmt, process, sync::atomic::{AtomicU64, Ordering}};
use time::OffsetDateTime;

/// Render raw protocol bytes for logs, escaping anything that isn't ASCII
pub fn maybe_ascii(ascii: &[u8]) -> MaybeAscii {
    MaybeAscii(ascii)
}

pub struct MaybeAscii<'a>(&'a [u8]);

impl fmt::Display for MaybeAscii<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for &byte in self.0 {
            match byte {
                b'\r' => f.write_str("\\r")?,
                b'\n' => f.write_str("\\n")?,
                0x20..=0x7e => write!(f, "{}", byte as char)?,
                _ => write!(f, "\\x{:02x}", byte)?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for MaybeAscii<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "\"{}\"", self)
    }
}

/// Name of this host, as announced in greetings and EHLO
pub fn local_hostname() -> String {
    match hostname::get() {
        Err(err) => {
            log::warn!("unable to get host name, using localhost: {err}");
            "localhost".into()
        }
        Ok(name) => match name.into_string() {
            Ok(name) if !name.is_empty() => name,
            Ok(_) => "localhost".into(),
            Err(name) => {
                log::warn!("host name {name:?} is not valid UTF-8, using localhost");
                "localhost".into()
            }
        },
    }
}

/// Produce a file name that is unique within this process and very unlikely
/// to collide with names produced by other processes
pub fn unique_name() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let now = OffsetDateTime::now_utc();
    let sequence = COUNTER.fetch_add(1, Ordering::Relaxed);

    format!("{}.{:09}.{}.{}", now.unix_timestamp(), now.nanosecond(), process::id(), sequence)
}
