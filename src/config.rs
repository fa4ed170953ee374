//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Ambient runtime configuration
//!
//! Loaded from an optional `config.toml` (via `--config` or the XDG
//! lookup) merged with `GATOR_*` environment overrides. Every tunable
//! defaults to the protocol's canonical value, so a bare invocation needs
//! no file at all.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use getset::CopyGetters;
use getset::Getters;
use serde::Deserialize;

use crate::store::Severity;

#[derive(Clone, Debug, Deserialize, Getters, CopyGetters)]
pub struct Configuration {
    /// Minimum severity the root renders to the console
    #[serde(default = "default_console_severity")]
    console_severity: String,

    /// Seconds between `update` heartbeats to the parent
    #[serde(default = "default_update_interval")]
    update_interval_sec: u64,

    /// Seconds between resource samples of the supervised process
    #[serde(default = "default_sample_interval")]
    sample_interval_sec: u64,

    /// Seconds a LAUNCHED child may take to register before it counts as
    /// failed-to-start
    #[serde(default = "default_connect_grace")]
    connect_grace_sec: u64,

    /// Seconds a stopping tier waits for its children's `complete` before
    /// asking the scheduler to terminate them
    #[serde(default = "default_stop_grace")]
    stop_grace_sec: u64,

    /// Seconds to wait for the `complete` acknowledgement
    #[serde(default = "default_report_timeout")]
    report_timeout_sec: u64,

    /// Seconds a log-store read may take before it errors
    #[serde(default = "default_store_timeout")]
    store_timeout_sec: u64,

    /// Seconds a scheduler launch may take before it errors
    #[serde(default = "default_scheduler_timeout")]
    scheduler_timeout_sec: u64,

    /// Upward connect attempts before giving up with exit code 2
    #[serde(default = "default_connect_attempts")]
    #[getset(get_copy = "pub")]
    connect_attempts: usize,

    /// Seconds to wait after closing stdin before SIGTERM
    #[serde(default = "default_term_grace")]
    term_grace_sec: u64,

    /// Seconds to wait after SIGTERM before SIGKILL
    #[serde(default = "default_kill_grace")]
    kill_grace_sec: u64,

    /// Directory for the per-run embedded database files; the system temp
    /// directory when unset
    #[serde(default)]
    #[getset(get = "pub")]
    state_dir: Option<PathBuf>,

    /// Sample the whole descendant tree of the job, not just the direct
    /// child
    #[serde(default = "default_sample_descendants")]
    #[getset(get_copy = "pub")]
    sample_descendants: bool,

    /// Severity re-tag rules for captured output lines
    #[serde(default)]
    #[getset(get = "pub")]
    classify: Vec<ClassifyRule>,
}

#[derive(Clone, Debug, Deserialize, Getters)]
pub struct ClassifyRule {
    #[getset(get = "pub")]
    pattern: String,

    #[getset(get = "pub")]
    severity: String,
}

impl Configuration {
    pub fn console_severity(&self) -> Severity {
        Severity::from_name(&self.console_severity).unwrap_or(Severity::Info)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_sec)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_sec)
    }

    pub fn connect_grace(&self) -> Duration {
        Duration::from_secs(self.connect_grace_sec)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_sec)
    }

    pub fn report_timeout(&self) -> Duration {
        Duration::from_secs(self.report_timeout_sec)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_sec)
    }

    pub fn scheduler_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduler_timeout_sec)
    }

    pub fn term_grace(&self) -> Duration {
        Duration::from_secs(self.term_grace_sec)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_sec)
    }
}

fn default_console_severity() -> String {
    String::from("INFO")
}

fn default_update_interval() -> u64 {
    10
}

fn default_sample_interval() -> u64 {
    5
}

fn default_connect_grace() -> u64 {
    60
}

fn default_stop_grace() -> u64 {
    30
}

fn default_report_timeout() -> u64 {
    5
}

fn default_store_timeout() -> u64 {
    5
}

fn default_scheduler_timeout() -> u64 {
    60
}

fn default_connect_attempts() -> usize {
    12
}

fn default_term_grace() -> u64 {
    10
}

fn default_kill_grace() -> u64 {
    5
}

fn default_sample_descendants() -> bool {
    true
}

/// Load the configuration, merging (in order of precedence, lowest first)
/// the XDG config file, an explicitly passed file and `GATOR_*`
/// environment variables
pub fn load(explicit: Option<&Path>) -> Result<Configuration> {
    let mut config = config::Config::default();

    match explicit {
        Some(path) => {
            config
                .merge(config::File::from(path.to_path_buf()))
                .with_context(|| format!("Loading configuration from {}", path.display()))?;
        }
        None => {
            let xdg = xdg::BaseDirectories::with_prefix("gator")
                .context("Setting up XDG directory lookup")?;
            if let Some(path) = xdg.find_config_file("config.toml") {
                config
                    .merge(config::File::from(path.clone()))
                    .with_context(|| format!("Loading configuration from {}", path.display()))?;
            }
        }
    }

    config
        .merge(config::Environment::with_prefix("GATOR"))
        .context("Merging environment overrides")?;

    config
        .try_into()
        .context("Deserializing configuration")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(text: &str) -> Configuration {
        let mut config = config::Config::default();
        config
            .merge(config::File::from_str(text, config::FileFormat::Toml))
            .unwrap();
        config.try_into().unwrap()
    }

    #[test]
    fn test_defaults_match_protocol_constants() {
        let configuration = from_toml("");
        assert_eq!(configuration.update_interval(), Duration::from_secs(10));
        assert_eq!(configuration.sample_interval(), Duration::from_secs(5));
        assert_eq!(configuration.connect_grace(), Duration::from_secs(60));
        assert_eq!(configuration.stop_grace(), Duration::from_secs(30));
        assert_eq!(configuration.term_grace(), Duration::from_secs(10));
        assert_eq!(configuration.kill_grace(), Duration::from_secs(5));
        assert_eq!(configuration.connect_attempts(), 12);
        assert_eq!(configuration.console_severity(), Severity::Info);
        assert!(configuration.sample_descendants());
        assert!(configuration.classify().is_empty());
    }

    #[test]
    fn test_explicit_values_override_defaults() {
        let configuration = from_toml(
            r#"
            console_severity = "warning"
            update_interval_sec = 2
            sample_descendants = false

            [[classify]]
            pattern = "^WARN"
            severity = "WARNING"
        "#,
        );

        assert_eq!(configuration.console_severity(), Severity::Warning);
        assert_eq!(configuration.update_interval(), Duration::from_secs(2));
        assert!(!configuration.sample_descendants());
        assert_eq!(configuration.classify().len(), 1);
        assert_eq!(configuration.classify()[0].pattern(), "^WARN");
    }
}
