// Copyright 2022 OpenStax Poland
// Licensed under the MIT license. See LICENSE file in the project root for
// full license text.

//! Per-address signing and encryption rules

use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

use crate::{mail::MailObject, transform::Transform};

/// Sign mail sent by `sender`
#[derive(Clone, Debug, Deserialize)]
pub struct SignRule {
    pub sender: String,
    pub certificate: PathBuf,
    pub key: PathBuf,
    #[serde(default)]
    pub password: Option<String>,
}

/// Encrypt mail sent to `recipient`
#[derive(Clone, Debug, Deserialize)]
pub struct EncryptRule {
    pub recipient: String,
    pub certificate: PathBuf,
}

/// Decrypt mail sent to `recipient`
#[derive(Clone, Debug, Deserialize)]
pub struct DecryptRule {
    pub recipient: String,
    pub certificate: PathBuf,
    pub key: PathBuf,
    #[serde(default)]
    pub password: Option<String>,
}

/// Verify signature of mail sent by `sender`
#[derive(Clone, Debug, Deserialize)]
pub struct VerifyRule {
    pub sender: String,
    /// Certificate the signature must be made with
    pub certificate: PathBuf,
    /// Authority the signer's certificate must chain to
    pub ca_certificate: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Rules {
    pub sign: Vec<SignRule>,
    pub encrypt: Vec<EncryptRule>,
    pub decrypt: Vec<DecryptRule>,
    pub verify: Vec<VerifyRule>,
}

/// Rules applying to a sender address
#[derive(Clone, Copy, Debug)]
pub struct SenderRules<'a> {
    pub sign: Option<&'a SignRule>,
    pub verify: Option<&'a VerifyRule>,
}

/// Rules applying to a recipient address
#[derive(Clone, Copy, Debug)]
pub struct RecipientRules<'a> {
    pub encrypt: Option<&'a EncryptRule>,
    pub decrypt: Option<&'a DecryptRule>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("{table} rule with an empty address")]
    EmptyAddress { table: &'static str },
    #[error("more than one {table} rule for {address}")]
    Duplicate { table: &'static str, address: String },
}

fn find<'a, T>(rules: &'a [T], address: &str, key: impl Fn(&T) -> &str) -> Option<&'a T> {
    rules.iter().find(|rule| key(rule).eq_ignore_ascii_case(address))
}

fn check<T>(table: &'static str, rules: &[T], key: impl Fn(&T) -> &str) -> Result<(), RuleError> {
    for (index, rule) in rules.iter().enumerate() {
        let address = key(rule);

        if address.is_empty() {
            return Err(RuleError::EmptyAddress { table });
        }

        if rules[..index].iter().any(|other| key(other).eq_ignore_ascii_case(address)) {
            return Err(RuleError::Duplicate { table, address: address.to_string() });
        }
    }

    Ok(())
}

impl Rules {
    pub fn is_empty(&self) -> bool {
        self.sign.is_empty() && self.encrypt.is_empty()
            && self.decrypt.is_empty() && self.verify.is_empty()
    }

    /// Reject tables in which an address is ambiguous
    pub fn validate(&self) -> Result<(), RuleError> {
        check("sign", &self.sign, |rule| rule.sender.as_str())?;
        check("encrypt", &self.encrypt, |rule| rule.recipient.as_str())?;
        check("decrypt", &self.decrypt, |rule| rule.recipient.as_str())?;
        check("verify", &self.verify, |rule| rule.sender.as_str())
    }

    pub fn match_sender(&self, address: &str) -> Option<SenderRules<'_>> {
        let rules = SenderRules {
            sign: find(&self.sign, address, |rule| rule.sender.as_str()),
            verify: find(&self.verify, address, |rule| rule.sender.as_str()),
        };
        (rules.sign.is_some() || rules.verify.is_some()).then_some(rules)
    }

    pub fn match_recipient(&self, address: &str) -> Option<RecipientRules<'_>> {
        let rules = RecipientRules {
            encrypt: find(&self.encrypt, address, |rule| rule.recipient.as_str()),
            decrypt: find(&self.decrypt, address, |rule| rule.recipient.as_str()),
        };
        (rules.encrypt.is_some() || rules.decrypt.is_some()).then_some(rules)
    }

    /// Transformations to apply to `mail` before relaying, in order
    ///
    /// Decryption and encryption act on behalf of recipients. When
    /// `single_recipient_only` is set they apply only to mail with exactly
    /// one recipient; otherwise every recipient must be covered by rules
    /// naming the same credentials.
    pub fn plan(&self, mail: &MailObject, single_recipient_only: bool) -> Vec<Transform> {
        let mut plan = Vec::new();
        let sender = self.match_sender(mail.sender());

        let decrypt = common_rule(mail.recipients(), single_recipient_only, |recipient| {
            find(&self.decrypt, recipient, |rule| rule.recipient.as_str())
        }, |a: &DecryptRule, b: &DecryptRule| {
            a.certificate == b.certificate && a.key == b.key && a.password == b.password
        });

        if let Some(rule) = decrypt {
            plan.push(Transform::Decrypt {
                certificate: rule.certificate.clone(),
                key: rule.key.clone(),
                password: rule.password.clone(),
            });
        }

        if let Some(rule) = sender.and_then(|rules| rules.verify) {
            plan.push(Transform::Verify {
                certificate: rule.certificate.clone(),
                ca_certificate: rule.ca_certificate.clone(),
            });
        }

        if let Some(rule) = sender.and_then(|rules| rules.sign) {
            plan.push(Transform::Sign {
                certificate: rule.certificate.clone(),
                key: rule.key.clone(),
                password: rule.password.clone(),
            });
        }

        let encrypt = common_rule(mail.recipients(), single_recipient_only, |recipient| {
            find(&self.encrypt, recipient, |rule| rule.recipient.as_str())
        }, |a: &EncryptRule, b: &EncryptRule| a.certificate == b.certificate);

        if let Some(rule) = encrypt {
            plan.push(Transform::Encrypt { certificate: rule.certificate.clone() });
        }

        plan
    }
}

/// Rule covering all `recipients`, if there is one
fn common_rule<'a, T>(
    recipients: &[String],
    single_recipient_only: bool,
    lookup: impl Fn(&str) -> Option<&'a T>,
    same_credentials: impl Fn(&T, &T) -> bool,
) -> Option<&'a T> {
    if single_recipient_only && recipients.len() != 1 {
        return None;
    }

    let (first, rest) = recipients.split_first()?;
    let rule = lookup(first)?;

    for recipient in rest {
        if !same_credentials(lookup(recipient)?, rule) {
            return None;
        }
    }

    Some(rule)
}
