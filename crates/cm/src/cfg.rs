/*
 * SPDX-License-Identifier: Apache-2.0
 */

//! Local TOML + environment config, loaded once at startup. Cloud-delivered
//! unit config (update items, desired instances) is out of scope here; this
//! only covers what the binary needs to come up.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use cm_model::CmError;

fn default_log_directive() -> String {
    "info".to_string()
}

fn default_nodes_connection_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_service_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_sm_connection_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_unit_status_send_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_num_concurrent_items() -> usize {
    cm_model::limits::MAX_NUM_CONCURRENT_ITEMS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// This unit's identity, as reported to the cloud.
    pub unit_id: String,

    pub state_dir: String,
    pub storage_dir: String,

    #[serde(with = "humantime_serde", default = "default_nodes_connection_timeout")]
    pub nodes_connection_timeout: Duration,

    #[serde(with = "humantime_serde", default = "default_service_ttl")]
    pub service_ttl: Duration,

    #[serde(with = "humantime_serde", default = "default_sm_connection_timeout")]
    pub sm_connection_timeout: Duration,

    #[serde(with = "humantime_serde", default = "default_unit_status_send_timeout")]
    pub unit_status_send_timeout: Duration,

    #[serde(default = "default_max_num_concurrent_items")]
    pub max_num_concurrent_items: usize,

    #[serde(default = "default_log_directive")]
    pub log_directive: String,
}

impl Config {
    /// Merges an optional TOML file over built-in defaults, then lets
    /// `CM_`-prefixed environment variables override both.
    pub fn load(config_path: Option<&Path>) -> Result<Self, CmError> {
        let mut figment = Figment::new();
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("CM_"));
        figment
            .extract()
            .map_err(|err| CmError::invalid_argument(format!("failed to load config: {err}")))
    }

    pub fn launcher_config(&self) -> cm_core::launcher::Config {
        cm_core::launcher::Config {
            nodes_connection_timeout: self.nodes_connection_timeout,
            max_num_concurrent_items: self.max_num_concurrent_items,
        }
    }

    pub fn instance_config(&self) -> cm_core::instance::Config {
        cm_core::instance::Config {
            service_ttl: self.service_ttl,
        }
    }

    pub fn storage_state_config(&self) -> cm_core::storage_state::Config {
        cm_core::storage_state::Config {
            storage_dir: self.storage_dir.clone(),
            state_dir: self.state_dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_applies_defaults_for_omitted_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            unit_id = "unit-1"
            state_dir = "/var/lib/cm/state"
            storage_dir = "/var/lib/cm/storage"
            "#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.unit_id, "unit-1");
        assert_eq!(config.nodes_connection_timeout, Duration::from_secs(60));
        assert_eq!(config.max_num_concurrent_items, cm_model::limits::MAX_NUM_CONCURRENT_ITEMS);
    }
}
