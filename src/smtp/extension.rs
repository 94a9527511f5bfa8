// Copyright 2022 OpenStax Poland
// Licensed under the MIT license. See LICENSE file in the project root for
// full license text.

use std::fmt;

/// ESMTP extensions recognized in EHLO replies
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Extension {
    EightBitMime,
    Dsn,
    Etrn,
    Expn,
    Help,
    Onex,
    Pipelining,
    Size,
    Verb,
    Vrfy,
}

impl Extension {
    const COUNT: usize = 10;

    pub const ALL: [Extension; Extension::COUNT] = [
        Extension::EightBitMime,
        Extension::Dsn,
        Extension::Etrn,
        Extension::Expn,
        Extension::Help,
        Extension::Onex,
        Extension::Pipelining,
        Extension::Size,
        Extension::Verb,
        Extension::Vrfy,
    ];

    pub fn keyword(self) -> &'static str {
        match self {
            Extension::EightBitMime => "8BITMIME",
            Extension::Dsn => "DSN",
            Extension::Etrn => "ETRN",
            Extension::Expn => "EXPN",
            Extension::Help => "HELP",
            Extension::Onex => "ONEX",
            Extension::Pipelining => "PIPELINING",
            Extension::Size => "SIZE",
            Extension::Verb => "VERB",
            Extension::Vrfy => "VRFY",
        }
    }

    /// Recognize the extension announced by one EHLO reply line
    ///
    /// Only the keyword is looked at; parameters (like the limit of `SIZE`)
    /// are ignored. Returns `None` for unknown keywords.
    pub fn parse(line: &str) -> Option<Self> {
        let keyword = line.split_ascii_whitespace().next()?;
        Extension::ALL.iter()
            .copied()
            .find(|extension| extension.keyword().eq_ignore_ascii_case(keyword))
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Extensions advertised by a server during one client session
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtensionSet([bool; Extension::COUNT]);

impl ExtensionSet {
    pub fn insert(&mut self, extension: Extension) {
        self.0[extension.index()] = true;
    }

    pub fn contains(&self, extension: Extension) -> bool {
        self.0[extension.index()]
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        !self.0.iter().any(|&present| present)
    }

    pub fn iter(&self) -> impl Iterator<Item = Extension> + '_ {
        Extension::ALL.iter().copied().filter(|&extension| self.contains(extension))
    }
}

impl fmt::Debug for ExtensionSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
