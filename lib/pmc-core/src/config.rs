// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::Deserialize;

/// Tunables for a registry, normally deserialized from the `[config]` table
/// of the image description. Missing keys take their default. All periods
/// are in scheduler ticks.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// How often undelivered notifications and suspend callbacks are
    /// retried.
    pub notifier_retry_period: u64,
    /// How often devices waiting on hardware are polled for completion.
    pub completion_poll_period: u64,
    /// How long an idle-capable target gets to acknowledge a forced
    /// power-down before it is taken down anyway.
    pub force_power_down_timeout: u64,
    /// QoS given to a requirement that has been cleared.
    pub default_qos: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            notifier_retry_period: 10,
            completion_poll_period: 1,
            force_power_down_timeout: 100,
            default_qos: drv_pmc_api::DEFAULT_QOS,
        }
    }
}
