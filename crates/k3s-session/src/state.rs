//! Binding of durable and ephemeral storage to a named cluster.
//!
//! Two cache volumes outlive a session: one for configuration (the generated
//! kubeconfig) and one for runtime data (datastore, images, TLS material).
//! Their keys are derived from the cluster name only, so running a session
//! again with the same name attaches to the same volumes.

use container_spec::{CacheVolume, Container};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::Clock;
use crate::name::ClusterName;

/// Prefix of the configuration volume key.
pub const CONFIG_CACHE_PREFIX: &str = "k3s_config_";
/// Prefix of the runtime volume key.
pub const RUNTIME_CACHE_PREFIX: &str = "k3s_cache_";

/// Where k3s writes its configuration, including `k3s.yaml`.
pub const CONFIG_DIR: &str = "/etc/rancher/k3s";
/// Where k3s keeps runtime state.
pub const RUNTIME_DIR: &str = "/var/lib/rancher";
/// The k3s root inside [`RUNTIME_DIR`], wiped unless state is kept.
pub const RUNTIME_ROOT: &str = "/var/lib/rancher/k3s/";
/// CNI plugin state, scratch only.
pub const CNI_DIR: &str = "/var/lib/cni";
/// Kubelet state, scratch only.
pub const KUBELET_DIR: &str = "/var/lib/kubelet";
/// Logs, scratch only.
pub const LOG_DIR: &str = "/var/log";

/// Name of the environment variable that forces the wipe steps to run again.
pub const CACHE_BUST_ENV: &str = "CACHEBUST";

/// Paths removed on every construction. Credentials are regenerated each time
/// because ones from an earlier incarnation do not match a newly bound port.
pub const ALWAYS_WIPED: [&str; 2] = [
    "/var/lib/rancher/k3s/server/tls",
    "/etc/rancher/k3s/k3s.yaml",
];

/// The storage of one cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBinding {
    config_cache: CacheVolume,
    runtime_cache: CacheVolume,
    keep_state: bool,
}

/// Derives the storage of the cluster called `name`.
///
/// With `keep_state` the runtime volume survives construction apart from the
/// [`ALWAYS_WIPED`] paths. This lets a cluster resume its workloads but is not
/// recommended: a stale node identity can keep k3s from starting.
pub fn bind(name: &ClusterName, keep_state: bool) -> StateBinding {
    let binding = StateBinding {
        config_cache: CacheVolume::new(format!("{}{}", CONFIG_CACHE_PREFIX, name)),
        runtime_cache: CacheVolume::new(format!("{}{}", RUNTIME_CACHE_PREFIX, name)),
        keep_state,
    };
    debug!(
        config = binding.config_cache.key(),
        runtime = binding.runtime_cache.key(),
        keep_state,
        "Bound cluster state"
    );
    binding
}

impl StateBinding {
    /// The volume holding the cluster configuration.
    pub fn config_cache(&self) -> &CacheVolume {
        &self.config_cache
    }

    /// The volume holding runtime data.
    pub fn runtime_cache(&self) -> &CacheVolume {
        &self.runtime_cache
    }

    /// Whether runtime data survives construction.
    pub fn keep_state(&self) -> bool {
        self.keep_state
    }

    /// Mounts the volumes and scratch directories into `container` and
    /// schedules the wipes that must happen before k3s starts.
    pub fn apply(&self, container: &Container, clock: &dyn Clock) -> Container {
        container
            .with_mounted_cache(CONFIG_DIR, &self.config_cache)
            .with_mounted_temp(CNI_DIR)
            .with_mounted_temp(KUBELET_DIR)
            .with_mounted_cache(RUNTIME_DIR, &self.runtime_cache)
            .with_env_variable(CACHE_BUST_ENV, clock.cache_bust())
            .with_removed_paths(ALWAYS_WIPED.iter().copied())
            .with(|c| {
                if self.keep_state {
                    c.clone()
                } else {
                    c.with_removed_paths(vec![RUNTIME_ROOT])
                }
            })
            .with_mounted_temp(LOG_DIR)
    }
}
