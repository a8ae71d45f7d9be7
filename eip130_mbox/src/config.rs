// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::PollBudget;
use eip130_regs::MailboxNumber;
use eip130_token::policy::PolicyVersion;
use serde::{Deserialize, Serialize};

/// Driver settings. Every field has a default, so a config file only needs
/// to name what differs.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Config {
    /// Mailbox used by the firmware login, the typed token operations and
    /// secure-boot sessions.
    pub mailbox: MailboxNumber,
    /// Identity placed in word 1 of every command token.
    pub identity: u32,
    /// Crypto officer identity required before entering FIPS mode.
    pub coid: u32,
    pub policy_version: PolicyVersion,
    /// Status reads after a link, unlink or link reset request before the
    /// request counts as not acknowledged.
    pub link_ack_checks: u32,
    pub load_retries: u32,
    /// Let the master host load firmware even without the protection bit
    /// matching.
    pub allow_nonsecure_master: bool,
    /// Assets created by this host are reachable from the non-secure side.
    pub non_secure: bool,
    /// Module status polls (CRC24, firmware download, FIPS mode).
    pub status_poll: PollBudget,
    /// Waiting for a result token.
    pub result_poll: PollBudget,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mailbox: MailboxNumber::FIRST,
            identity: 0x6953_424C,
            coid: 0x4F5A_3647,
            policy_version: PolicyVersion::default(),
            link_ack_checks: 1,
            load_retries: 3,
            allow_nonsecure_master: false,
            non_secure: false,
            status_poll: PollBudget::default(),
            result_poll: PollBudget::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn partial_toml() {
        let c: Config = toml::from_str(
            r#"
            mailbox = 2
            identity = 0x4F5A3647
            policy-version = "v1"

            [status-poll]
            max-attempts = 50
            time-limit-ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(c.mailbox.get(), 2);
        assert_eq!(c.identity, 0x4F5A_3647);
        assert_eq!(c.policy_version, PolicyVersion::V1);
        assert_eq!(c.status_poll.max_attempts, 50);
        assert_eq!(c.status_poll.time_limit, Some(Duration::from_millis(250)));
        assert_eq!(c.result_poll, PollBudget::default());
        assert_eq!(c.load_retries, 3);
    }

    #[test]
    fn rejects_unknown_and_out_of_range() {
        assert!(toml::from_str::<Config>("retries = 3").is_err());
        assert!(toml::from_str::<Config>("mailbox = 9").is_err());
    }

    #[test]
    fn default_survives_toml() {
        let text = toml::to_string(&Config::default()).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back, Config::default());
    }
}
