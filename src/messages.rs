//! Player-facing messages
//!
//! Message templates use `{name}` placeholders and `{line}` for a line break.

use serde::{Deserialize, Serialize};

use crate::ledger::Sanction;

/// Substitute `{key}` placeholders in a single pass
///
/// Replacement values are not scanned again, so a value containing `{key}`
/// is inserted literally.
#[must_use]
pub fn replace_vars(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let replaced = tail.find('}').and_then(|end| {
            let name = &tail[1..end];
            let value = if name == "line" {
                Some("\n")
            } else {
                vars.iter().find(|(key, _)| *key == name).map(|(_, value)| *value)
            };
            value.map(|value| (value, end))
        });
        match replaced {
            Some((value, end)) => {
                out.push_str(value);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Text shown to an account when it is punished
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PunishmentMessages {
    pub kick: String,
    pub ban: String,
    #[serde(rename = "ban-ip")]
    pub ban_ip: String,
    pub tempban: String,
}

impl Default for PunishmentMessages {
    fn default() -> Self {
        Self {
            kick: "You have been kicked for reaching the warning limit.".to_string(),
            ban: "You have been banned for reaching the warning limit.".to_string(),
            ban_ip: "Your IP has been banned for reaching the warning limit.".to_string(),
            tempban: "You have been temporarily banned for reaching the warning limit.".to_string(),
        }
    }
}

impl PunishmentMessages {
    #[must_use]
    pub fn for_sanction(&self, sanction: Sanction) -> &str {
        match sanction {
            Sanction::Kick => &self.kick,
            Sanction::Ban => &self.ban,
            Sanction::BanIp => &self.ban_ip,
            Sanction::Tempban => &self.tempban,
        }
    }

    /// Sanctions whose message is blank
    #[must_use]
    pub fn missing(&self) -> Vec<Sanction> {
        [Sanction::Kick, Sanction::Ban, Sanction::BanIp, Sanction::Tempban]
            .into_iter()
            .filter(|sanction| self.for_sanction(*sanction).trim().is_empty())
            .collect()
    }
}

/// Notices sent to accounts by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Messages {
    /// Sent when a punishment is scheduled with a delay; `{delay}` in seconds
    pub delay_notice: String,
    /// Sent to the warned account; `{source}`, `{reason}`, `{expiration}`
    pub warned: String,
    /// Sent when a warning expires; `{reason}`
    pub expired: String,
    /// Sent on join when warnings arrived while away; `{count}`
    pub new_warnings: String,
    /// Sent on join when the account has warnings; `{count}`
    pub active_warnings: String,
    /// Sent on join when the account has no warnings
    pub no_warnings: String,
}

impl Default for Messages {
    fn default() -> Self {
        Self {
            delay_notice: "You have reached the warning limit. You will be punished in {delay} seconds.".to_string(),
            warned: "You have been warned by {source} for: {reason}{line}The warning will {expiration}".to_string(),
            expired: "Your warning has expired: {reason}".to_string(),
            new_warnings: "You have received {count} new warning(s). Please take note of your behavior.".to_string(),
            active_warnings: "You have {count} active warning(s). Please take note of your behavior.".to_string(),
            no_warnings: "You have no active warnings. Keep up the good behavior!".to_string(),
        }
    }
}

impl Messages {
    #[must_use]
    pub fn delay_notice(&self, delay_secs: i64) -> String {
        replace_vars(&self.delay_notice, &[("delay", &delay_secs.to_string())])
    }

    #[must_use]
    pub fn warned(&self, source: &str, reason: &str, expiration: &str) -> String {
        replace_vars(
            &self.warned,
            &[("source", source), ("reason", reason), ("expiration", expiration)],
        )
    }

    #[must_use]
    pub fn expired(&self, reason: &str) -> String {
        replace_vars(&self.expired, &[("reason", reason)])
    }

    #[must_use]
    pub fn new_warnings(&self, count: u64) -> String {
        replace_vars(&self.new_warnings, &[("count", &count.to_string())])
    }

    #[must_use]
    pub fn active_warnings(&self, count: u64) -> String {
        replace_vars(&self.active_warnings, &[("count", &count.to_string())])
    }
}
