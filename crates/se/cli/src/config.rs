//! Configuration file and environment overrides

use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::OptionExt;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use nexum_se_core::{PendingPolicy, ServiceConfig};
use nexum_se_pcsc::{PcscConfig, ShareMode};
use serde::{Deserialize, Serialize};

/// Prefix of environment variables overriding the file, e.g.
/// `NEXUM_SE_SERVICE__WORKER_THREADS=2`
const ENV_PREFIX: &str = "NEXUM_SE_";

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub(crate) struct Config {
    pub(crate) service: ServiceSection,
    pub(crate) pcsc: PcscSection,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub(crate) struct ServiceSection {
    pub(crate) worker_threads: usize,
    pub(crate) queue_capacity: usize,
    pub(crate) pending_policy: Policy,
    /// Seconds to wait for each operation
    pub(crate) timeout: u64,
}

impl Default for ServiceSection {
    fn default() -> Self {
        let defaults = ServiceConfig::default();
        Self {
            worker_threads: defaults.worker_threads,
            queue_capacity: defaults.queue_capacity,
            pending_policy: Policy::Fail,
            timeout: 10,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Policy {
    Fail,
    Discard,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub(crate) struct PcscSection {
    pub(crate) share_mode: Share,
    pub(crate) poll_interval_ms: u64,
}

impl Default for PcscSection {
    fn default() -> Self {
        Self {
            share_mode: Share::Shared,
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Share {
    Shared,
    Exclusive,
    Direct,
}

impl Config {
    pub(crate) fn service(&self) -> ServiceConfig {
        let policy = match self.service.pending_policy {
            Policy::Fail => PendingPolicy::Fail,
            Policy::Discard => PendingPolicy::Discard,
        };
        ServiceConfig::new()
            .with_worker_threads(self.service.worker_threads)
            .with_queue_capacity(self.service.queue_capacity)
            .with_pending_policy(policy)
    }

    pub(crate) fn pcsc(&self) -> PcscConfig {
        let share_mode = match self.pcsc.share_mode {
            Share::Shared => ShareMode::Shared,
            Share::Exclusive => ShareMode::Exclusive,
            Share::Direct => ShareMode::Direct,
        };
        PcscConfig::new()
            .with_share_mode(share_mode)
            .with_poll_interval(Duration::from_millis(self.pcsc.poll_interval_ms))
    }

    pub(crate) const fn timeout(&self) -> Duration {
        Duration::from_secs(self.service.timeout)
    }
}

/// Returns the base config directory for nexum
pub(crate) fn config_dir() -> eyre::Result<PathBuf> {
    Ok(std::env::home_dir()
        .ok_or_eyre("home directory not found")?
        .join(".nxm"))
}

/// Load defaults, then `path` (or `~/.nxm/se.toml`), then the environment
pub(crate) fn load_config(path: Option<&Path>) -> eyre::Result<Config> {
    let file = match path {
        Some(path) => path.to_path_buf(),
        None => config_dir()?.join("se.toml"),
    };
    Ok(figment(&file).extract()?)
}

fn figment(file: &Path) -> Figment {
    Figment::from(Serialized::defaults(Config::default()))
        .merge(Toml::file(file))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_and_env_overrides() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "se.toml",
                r#"
                [service]
                worker_threads = 2
                pending_policy = "discard"

                [pcsc]
                share_mode = "exclusive"
                "#,
            )?;
            jail.set_env("NEXUM_SE_SERVICE__QUEUE_CAPACITY", "8");

            let config: Config = figment(Path::new("se.toml")).extract()?;
            let service = config.service();
            assert_eq!(service.worker_threads, 2);
            assert_eq!(service.queue_capacity, 8);
            assert_eq!(service.pending_policy, PendingPolicy::Discard);
            assert_eq!(config.pcsc().share_mode, ShareMode::Exclusive);
            assert_eq!(config.timeout(), Duration::from_secs(10));
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        figment::Jail::expect_with(|_| {
            let config: Config = figment(Path::new("missing.toml")).extract()?;
            assert_eq!(config.service.pending_policy, Policy::Fail);
            assert_eq!(config.pcsc().poll_interval, Duration::from_secs(1));
            Ok(())
        });
    }
}
