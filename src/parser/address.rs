use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::db::models::Mailbox;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecipientRole {
    To,
    Cc,
    Bcc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recipient {
    pub mailbox: Mailbox,
    pub role: RecipientRole,
}

fn email_regex() -> &'static Regex {
    static EMAIL_RE: OnceLock<Regex> = OnceLock::new();
    EMAIL_RE.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}")
            .expect("static email pattern compiles")
    })
}

/// Parse one raw address into an `{email, name}` pair. Total: malformed
/// input degrades to a lossy result instead of an error.
///
/// Priority: bracketed `Name <addr>` form, then a bare address, then an
/// email-like substring embedded in junk. When nothing address-shaped is
/// found the whole trimmed input becomes the email with no name.
pub fn parse_address(raw: &str) -> Mailbox {
    let raw = raw.trim();

    if let Some(angle_start) = raw.rfind('<') {
        if let Some(angle_end) = raw.rfind('>') {
            if angle_end > angle_start {
                let inner = raw[angle_start + 1..angle_end].trim();
                if !inner.is_empty() {
                    let name = strip_name_decorations(&raw[..angle_start]);
                    return Mailbox {
                        email: inner.to_ascii_lowercase(),
                        name,
                    };
                }
            }
        }
    }

    if email_regex()
        .find(raw)
        .is_some_and(|m| m.start() == 0 && m.end() == raw.len())
    {
        return Mailbox {
            email: raw.to_ascii_lowercase(),
            name: None,
        };
    }

    if let Some(found) = email_regex().find(raw) {
        let name = strip_name_decorations(&raw[..found.start()]);
        return Mailbox {
            email: found.as_str().to_ascii_lowercase(),
            name,
        };
    }

    Mailbox {
        email: raw.to_ascii_lowercase(),
        name: None,
    }
}

fn strip_name_decorations(raw: &str) -> Option<String> {
    let cleaned = raw
        .replace(['<', '>', '"'], " ")
        .trim()
        .to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Split a recipient header on commas outside double quotes and parse each
/// segment, tagging every result with the header's role.
pub fn parse_recipients(header_value: &str, role: RecipientRole) -> Vec<Recipient> {
    let mut recipients = Vec::new();
    let mut in_quotes = false;
    let mut current = String::new();

    for ch in header_value.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                push_recipient(&mut recipients, &current, role);
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    push_recipient(&mut recipients, &current, role);

    recipients
}

fn push_recipient(recipients: &mut Vec<Recipient>, segment: &str, role: RecipientRole) {
    let segment = segment.trim();
    if segment.is_empty() {
        return;
    }

    let mailbox = parse_address(segment);
    if mailbox.email.is_empty() {
        return;
    }
    recipients.push(Recipient { mailbox, role });
}
