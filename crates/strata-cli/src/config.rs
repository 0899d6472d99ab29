//! Strata CLI configuration stored at `~/.strata/config.json`.
//!
//! Holds the cluster reference to kubeconfig context mappings, the
//! deployments this machine manages, an optional kubeconfig path and lock
//! timings.
//!
//! The config file resolution chain (highest priority first):
//! 1. Explicit `--config` flag
//! 2. `STRATA_CONFIG` environment variable (read by clap into the flag)
//! 3. `~/.strata/config.json`
//!
//! The kubeconfig resolution chain:
//! 1. Explicit `--kubeconfig` flag or `STRATA_KUBECONFIG`
//! 2. `kubeconfig` in the config file
//! 3. Fall back to kube default (`KUBECONFIG` env / `~/.kube/config`)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_lock::LockConfig;
use strata_lock::lock::{DEFAULT_LEASE_DURATION, DEFAULT_MAX_WAIT};

use crate::{Error, Result};

const CONFIG_DIR_NAME: &str = ".strata";
const CONFIG_FILE_NAME: &str = "config.json";

/// Persistent CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StrataConfig {
    /// Cluster reference to kubeconfig context.
    #[serde(default)]
    pub cluster_refs: BTreeMap<String, String>,
    /// Deployments managed from this machine, by name.
    #[serde(default)]
    pub deployments: BTreeMap<String, DeploymentEntry>,
    /// Kubeconfig used when no flag or env var names one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
    /// Lock timing defaults.
    #[serde(default)]
    pub lock: LockSettings,
}

/// Where a deployment lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentEntry {
    /// Namespace holding the lock and the remote config on every member.
    pub namespace: String,
    /// Cluster holding the lock and the authoritative copy.
    pub primary: String,
    /// Member cluster references, primary included.
    pub clusters: Vec<String>,
}

/// Lock timings in seconds; unset values use the built-in defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LockSettings {
    /// Lease validity window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_duration_secs: Option<u64>,
    /// How long to wait for a contended lock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_wait_secs: Option<u64>,
}

impl LockSettings {
    /// Lock timing with per-invocation overrides applied on top.
    pub fn resolve(
        &self,
        lease_duration_secs: Option<u64>,
        max_wait_secs: Option<u64>,
    ) -> Result<LockConfig> {
        let lease = lease_duration_secs
            .or(self.lease_duration_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_LEASE_DURATION);
        let wait = max_wait_secs
            .or(self.max_wait_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_MAX_WAIT);

        if lease.is_zero() {
            return Err(Error::validation("lease duration must be at least one second"));
        }
        Ok(LockConfig::new(lease, wait))
    }
}

impl StrataConfig {
    /// The entry for `name`, or `DeploymentNotFound`.
    pub fn deployment(&self, name: &str) -> Result<&DeploymentEntry> {
        self.deployments
            .get(name)
            .ok_or_else(|| Error::deployment_not_found(name))
    }
}

/// Returns `~/.strata/`.
pub fn strata_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| Error::command_failed("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Resolve the config file path: explicit path, else `~/.strata/config.json`.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(strata_dir()?.join(CONFIG_FILE_NAME)),
    }
}

/// Load config from `path`, returning default if missing.
pub fn load_config(path: &Path) -> Result<StrataConfig> {
    if !path.exists() {
        return Ok(StrataConfig::default());
    }
    let data = std::fs::read_to_string(path)
        .map_err(|e| Error::command_failed(format!("failed to read {}: {}", path.display(), e)))?;
    serde_json::from_str(&data).map_err(|e| Error::InvalidConfig {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Save config to `path`, creating its directory if needed.
pub fn save_config(path: &Path, config: &StrataConfig) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if !dir.exists() {
            std::fs::create_dir_all(dir).map_err(|e| {
                Error::command_failed(format!("failed to create {}: {}", dir.display(), e))
            })?;
        }
    }
    let data = serde_json::to_string_pretty(config)?;
    std::fs::write(path, data)
        .map_err(|e| Error::command_failed(format!("failed to write {}: {}", path.display(), e)))
}

/// Resolve a kubeconfig path using the priority chain.
///
/// Returns `None` to use kube defaults.
pub fn resolve_kubeconfig(explicit: Option<&Path>, config: &StrataConfig) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| config.kubeconfig.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StrataConfig {
        let mut config = StrataConfig::default();
        config
            .cluster_refs
            .insert("east".to_string(), "kind-east".to_string());
        config.deployments.insert(
            "deploy".to_string(),
            DeploymentEntry {
                namespace: "ns1".to_string(),
                primary: "east".to_string(),
                clusters: vec!["east".to_string(), "west".to_string()],
            },
        );
        config.lock.lease_duration_secs = Some(30);
        config
    }

    #[test]
    fn missing_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, StrataConfig::default());
    }

    #[test]
    fn save_creates_directory_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        save_config(&path, &sample()).unwrap();
        assert_eq!(load_config(&path).unwrap(), sample());

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"clusterRefs\""));
        assert!(raw.contains("\"leaseDurationSecs\": 30"));
        assert!(!raw.contains("maxWaitSecs"));
    }

    #[test]
    fn malformed_file_is_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"clusterRefs": {"east": "kind-east"}}"#).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.cluster_refs["east"], "kind-east");
        assert!(config.deployments.is_empty());
        assert_eq!(config.lock, LockSettings::default());
    }

    #[test]
    fn explicit_config_path_wins() {
        let path = resolve_config_path(Some(Path::new("/tmp/strata.json"))).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/strata.json"));
    }

    #[test]
    fn kubeconfig_chain() {
        let mut config = StrataConfig::default();
        assert_eq!(resolve_kubeconfig(None, &config), None);

        config.kubeconfig = Some(PathBuf::from("/from/config"));
        assert_eq!(
            resolve_kubeconfig(None, &config),
            Some(PathBuf::from("/from/config"))
        );
        assert_eq!(
            resolve_kubeconfig(Some(Path::new("/explicit")), &config),
            Some(PathBuf::from("/explicit"))
        );
    }

    #[test]
    fn lock_settings_overrides() {
        let settings = LockSettings {
            lease_duration_secs: Some(30),
            max_wait_secs: None,
        };

        let lock = settings.resolve(None, None).unwrap();
        assert_eq!(lock.lease_duration, Duration::from_secs(30));
        assert_eq!(lock.renew_interval, Duration::from_secs(10));
        assert_eq!(lock.max_wait, DEFAULT_MAX_WAIT);

        let lock = settings.resolve(Some(9), Some(5)).unwrap();
        assert_eq!(lock.lease_duration, Duration::from_secs(9));
        assert_eq!(lock.max_wait, Duration::from_secs(5));

        assert!(settings.resolve(Some(0), None).is_err());
    }

    #[test]
    fn unknown_deployment() {
        let err = sample().deployment("other").unwrap_err();
        assert!(matches!(err, Error::DeploymentNotFound { .. }));
        assert_eq!(sample().deployment("deploy").unwrap().primary, "east");
    }
}
