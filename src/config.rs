//! Run configuration
//!
//! One explicit value passed into providers and scenarios. Loaded from JSON
//! and/or `CHURN_*` environment variables; durations are whole seconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::poller::PollSettings;
use crate::resource::StorageInterface;

/// Prefix of the environment variables read by [`Config::from_env`]
pub const ENV_PREFIX: &str = "CHURN_";

/// Default image for pods consuming test claims
pub const DEFAULT_POD_IMAGE: &str = "quay.io/quay/busybox:latest";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Namespace to run in; a fresh namespace is created when unset
    pub namespace: Option<String>,
    pub rbd_storage_class: String,
    pub cephfs_storage_class: String,
    /// Claims per storage interface in every provisioning call
    pub claims_per_interface: usize,
    /// Claim size as a Kubernetes quantity
    pub claim_size: String,
    pub pod_image: String,
    pub bound_timeout_secs: u64,
    pub running_timeout_secs: u64,
    pub delete_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub join_poll_interval_secs: u64,
    pub max_workers: usize,
    /// 0 disables failing fast on repeated status errors
    pub max_consecutive_check_failures: u32,
    /// Device path volumes are attached at
    pub volume_device: String,
    pub volume_size_gib: u32,
    /// Seed for access-mode distribution; random when unset
    pub seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: None,
            rbd_storage_class: "ocs-storagecluster-ceph-rbd".to_string(),
            cephfs_storage_class: "ocs-storagecluster-cephfs".to_string(),
            claims_per_interface: 1,
            claim_size: "5Gi".to_string(),
            pod_image: DEFAULT_POD_IMAGE.to_string(),
            bound_timeout_secs: 300,
            running_timeout_secs: 300,
            delete_timeout_secs: 300,
            poll_interval_secs: 3,
            join_poll_interval_secs: 10,
            max_workers: 10,
            max_consecutive_check_failures: 5,
            volume_device: "/dev/vdb".to_string(),
            volume_size_gib: 100,
            seed: None,
        }
    }
}

impl Config {
    /// Parse and validate a JSON document; missing fields take defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `CHURN_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_overrides(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup`, keyed by upper snake case field name
    /// (e.g. `CLAIMS_PER_INTERFACE`).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("NAMESPACE") {
            self.namespace = Some(v).filter(|ns| !ns.is_empty());
        }
        if let Some(v) = lookup("RBD_STORAGE_CLASS") {
            self.rbd_storage_class = v;
        }
        if let Some(v) = lookup("CEPHFS_STORAGE_CLASS") {
            self.cephfs_storage_class = v;
        }
        if let Some(v) = lookup("CLAIM_SIZE") {
            self.claim_size = v;
        }
        if let Some(v) = lookup("POD_IMAGE") {
            self.pod_image = v;
        }
        if let Some(v) = lookup("VOLUME_DEVICE") {
            self.volume_device = v;
        }

        parse_override(&lookup, "CLAIMS_PER_INTERFACE", &mut self.claims_per_interface)?;
        parse_override(&lookup, "BOUND_TIMEOUT_SECS", &mut self.bound_timeout_secs)?;
        parse_override(&lookup, "RUNNING_TIMEOUT_SECS", &mut self.running_timeout_secs)?;
        parse_override(&lookup, "DELETE_TIMEOUT_SECS", &mut self.delete_timeout_secs)?;
        parse_override(&lookup, "POLL_INTERVAL_SECS", &mut self.poll_interval_secs)?;
        parse_override(&lookup, "JOIN_POLL_INTERVAL_SECS", &mut self.join_poll_interval_secs)?;
        parse_override(&lookup, "MAX_WORKERS", &mut self.max_workers)?;
        parse_override(
            &lookup,
            "MAX_CONSECUTIVE_CHECK_FAILURES",
            &mut self.max_consecutive_check_failures,
        )?;
        parse_override(&lookup, "VOLUME_SIZE_GIB", &mut self.volume_size_gib)?;

        if let Some(v) = lookup("SEED") {
            let seed = v
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("{ENV_PREFIX}SEED: not a number: {v}")))?;
            self.seed = Some(seed);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::InvalidConfig("maxWorkers must be at least 1".into()));
        }
        if self.claims_per_interface == 0 {
            return Err(Error::InvalidConfig(
                "claimsPerInterface must be at least 1".into(),
            ));
        }
        if self.poll_interval_secs == 0 || self.join_poll_interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "poll intervals must be at least one second".into(),
            ));
        }
        for (name, timeout) in [
            ("boundTimeoutSecs", self.bound_timeout_secs),
            ("runningTimeoutSecs", self.running_timeout_secs),
            ("deleteTimeoutSecs", self.delete_timeout_secs),
        ] {
            if timeout < self.poll_interval_secs {
                return Err(Error::InvalidConfig(format!(
                    "{name} ({timeout}s) is shorter than pollIntervalSecs ({}s)",
                    self.poll_interval_secs
                )));
            }
        }
        if self.claim_size.trim().is_empty() {
            return Err(Error::InvalidConfig("claimSize must not be empty".into()));
        }
        Ok(())
    }

    pub fn storage_class(&self, interface: StorageInterface) -> &str {
        match interface {
            StorageInterface::CephBlockPool => &self.rbd_storage_class,
            StorageInterface::CephFileSystem => &self.cephfs_storage_class,
        }
    }

    fn poll(&self, timeout_secs: u64) -> PollSettings {
        PollSettings::from_secs(timeout_secs, self.poll_interval_secs)
            .with_max_consecutive_failures(self.max_consecutive_check_failures)
    }

    /// Polling for claims to bind and volumes to become available
    pub fn bound_poll(&self) -> PollSettings {
        self.poll(self.bound_timeout_secs)
    }

    pub fn running_poll(&self) -> PollSettings {
        self.poll(self.running_timeout_secs)
    }

    pub fn delete_poll(&self) -> PollSettings {
        self.poll(self.delete_timeout_secs)
    }

    pub fn join_poll_interval(&self) -> Duration {
        Duration::from_secs(self.join_poll_interval_secs)
    }
}

fn parse_override<F, T>(lookup: &F, key: &str, field: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(key) {
        *field = raw.trim().parse().map_err(|_| {
            Error::InvalidConfig(format!("{ENV_PREFIX}{key}: not a valid number: {raw}"))
        })?;
    }
    Ok(())
}
