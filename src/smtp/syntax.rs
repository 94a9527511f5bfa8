//! Grammar of SMTP command parameters (RFC 5321 section 4.1.2)

use std::str;
use thiserror::Error;

/// Maximum length of a HELO/EHLO domain argument
pub const DOMAIN_MAX: usize = 128;

/// Maximum length of a mailbox address inside a path
pub const ADDR_MAX: usize = 128;

pub type Result<T, E = SyntaxError> = std::result::Result<T, E>;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum SyntaxError {
    #[error("expected {0:?}")]
    Expected(&'static str),
    #[error("unexpected characters after parameter")]
    ExpectedEnd,
    #[error("missing parameter")]
    Missing,
    #[error("parameter longer than {0} bytes")]
    TooLong(usize),
    #[error("invalid character in parameter")]
    InvalidCharacter,
}

pub trait SliceExt<'a> {
    /// Advance this slice by `number` positions
    fn advance(&mut self, number: usize);

    /// Execute `f`, advancing `self` only if it succeeds
    fn atomic<T: 'a>(&mut self, f: impl FnOnce(&mut &'a [u8]) -> Result<T>) -> Result<T>;

    /// Return `Ok(())` and advance this slice if it begins (case insensitive)
    /// with `needle`
    fn expect_caseless(&mut self, needle: &'static str) -> Result<()>;

    /// Return `Ok(())` if nothing but spaces remain
    fn expect_blank(&self) -> Result<()>;

    /// Return longest prefix whose characters match `test`, advancing this
    /// slice by its length
    fn take_while(&mut self, test: impl FnMut(u8) -> bool) -> &'a [u8];
}

impl<'a> SliceExt<'a> for &'a [u8] {
    fn atomic<T: 'a>(&mut self, f: impl FnOnce(&mut &'a [u8]) -> Result<T>) -> Result<T> {
        let mut cursor = *self;
        let value = f(&mut cursor)?;
        *self = cursor;
        Ok(value)
    }

    fn advance(&mut self, by: usize) {
        *self = &self[by..];
    }

    fn expect_caseless(&mut self, needle: &'static str) -> Result<()> {
        let bytes = needle.as_bytes();
        if bytes.len() <= self.len() && self[..bytes.len()].eq_ignore_ascii_case(bytes) {
            self.advance(bytes.len());
            Ok(())
        } else {
            Err(SyntaxError::Expected(needle))
        }
    }

    fn expect_blank(&self) -> Result<()> {
        if self.iter().all(|&c| c == b' ') {
            Ok(())
        } else {
            Err(SyntaxError::ExpectedEnd)
        }
    }

    fn take_while(&mut self, mut test: impl FnMut(u8) -> bool) -> &'a [u8] {
        let offset = self.iter().position(|&c| !test(c)).unwrap_or(self.len());
        let result = &self[..offset];
        self.advance(offset);
        result
    }
}

/// Argument of HELO and EHLO: a domain or an address literal
///
/// Client names are taken as announced; only their shape is checked, since
/// the gateway never routes on them.
pub fn domain<'a>(line: &mut &'a [u8]) -> Result<&'a str> {
    line.atomic(|line| {
        line.expect_caseless(" ")?;
        let _ = line.take_while(|c| c == b' ');

        let domain = line.take_while(|c| c.is_ascii_graphic());

        if domain.is_empty() {
            return Err(SyntaxError::Missing);
        }

        if domain.len() > DOMAIN_MAX {
            return Err(SyntaxError::TooLong(DOMAIN_MAX));
        }

        line.expect_blank()?;

        // Only ASCII graphic characters were taken
        str::from_utf8(domain).map_err(|_| SyntaxError::InvalidCharacter)
    })
}

/// `Path` or `"<>"`, as used by MAIL FROM and RCPT TO
///
/// Returns the mailbox between the angle brackets. A source route
/// (`@a,@b:`) is accepted and dropped.
pub fn path<'a>(line: &mut &'a [u8]) -> Result<&'a str> {
    // Path = "<" [ A-d-l ":" ] Mailbox ">"
    line.atomic(|line| {
        line.expect_caseless("<")?;

        // A-d-l     = At-domain *( "," At-domain )
        // At-domain = "@" Domain
        if line.starts_with(b"@") {
            let route = line.take_while(|c| c != b':' && c != b'>');
            if !line.starts_with(b":") || route.is_empty() {
                return Err(SyntaxError::Expected(":"));
            }
            line.advance(1);
        }

        let mailbox = line.take_while(is_path_char);

        if mailbox.len() > ADDR_MAX {
            return Err(SyntaxError::TooLong(ADDR_MAX));
        }

        line.expect_caseless(">")?;

        str::from_utf8(mailbox).map_err(|_| SyntaxError::InvalidCharacter)
    })
}

/// Characters allowed inside an address. Non-ASCII bytes are let through
/// so that UTF-8 addresses survive; they are validated as a whole.
fn is_path_char(c: u8) -> bool {
    match c {
        b'<' | b'>' => false,
        0x21..=0x7e => true,
        0x80..=0xff => true,
        _ => false,
    }
}

pub fn parameter<'a>(line: &mut &'a [u8]) -> Result<(&'a [u8], Option<&'a [u8]>)> {
    // Mail-parameters = esmtp-param *(SP esmtp-param)
    // Rcpt-parameters = esmtp-param *(SP esmtp-param)
    // esmtp-param     = esmtp-keyword ["=" esmtp-value]
    // esmtp-keyword   = (ALPHA / DIGIT) *(ALPHA / DIGIT / "-")
    // esmtp-value     = 1*(%d33-60 / %d62-126)
    line.atomic(|line| {
        let keyword = line.take_while(|c| c.is_ascii_alphanumeric() || c == b'-');

        if keyword.is_empty() || keyword[0] == b'-' {
            return Err(SyntaxError::Expected("esmtp-keyword"));
        }

        if line.expect_caseless("=").is_err() {
            return Ok((keyword, None));
        }

        let value = line.take_while(|c| matches!(c, 33..=60 | 62..=126));

        if value.is_empty() {
            Err(SyntaxError::Expected("esmtp-value"))
        } else {
            Ok((keyword, Some(value)))
        }
    })
}

/// Trailing ESMTP parameters after a path. They are checked for syntax and
/// otherwise ignored, as no extensions are advertised.
pub fn parameters(line: &mut &[u8]) -> Result<()> {
    while !line.is_empty() {
        line.expect_caseless(" ")?;

        if line.expect_blank().is_ok() {
            line.advance(line.len());
            break;
        }

        parameter(line)?;
    }

    Ok(())
}
