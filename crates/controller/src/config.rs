//! Controller settings. Defaults are overridable through `CONVERGE_*` variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use converge_apply::ManifestLimits;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Backoff while a dependency is not ready.
    pub dependency_requeue: Duration,
    pub health_poll_interval: Duration,
    pub max_reported_not_ready: usize,
    pub strict_substitution: bool,
    pub field_manager: String,
    /// Where fetched source artifacts live.
    pub storage_root: PathBuf,
    pub kustomize_bin: PathBuf,
    pub manifest_limits: ManifestLimits,
    pub queue_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            dependency_requeue: Duration::from_secs(30),
            health_poll_interval: Duration::from_secs(2),
            max_reported_not_ready: 10,
            strict_substitution: false,
            field_manager: "converge".to_string(),
            storage_root: PathBuf::from("/data"),
            kustomize_bin: PathBuf::from("kustomize"),
            manifest_limits: ManifestLimits::default(),
            queue_capacity: 1024,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

fn env_duration(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    match converge_core::duration::parse(&raw) {
        Ok(d) => Some(d),
        Err(e) => {
            warn!(var = name, value = %raw, error = %e, "ignoring unparsable duration");
            None
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            dependency_requeue: env_duration("CONVERGE_DEPENDENCY_REQUEUE").unwrap_or(d.dependency_requeue),
            health_poll_interval: env_duration("CONVERGE_HEALTH_POLL_INTERVAL").unwrap_or(d.health_poll_interval),
            max_reported_not_ready: env_parse("CONVERGE_MAX_REPORTED_NOT_READY").unwrap_or(d.max_reported_not_ready),
            strict_substitution: env_parse("CONVERGE_STRICT_SUBSTITUTION").unwrap_or(d.strict_substitution),
            field_manager: std::env::var("CONVERGE_FIELD_MANAGER").unwrap_or(d.field_manager),
            storage_root: std::env::var("CONVERGE_STORAGE_ROOT").map(PathBuf::from).unwrap_or(d.storage_root),
            kustomize_bin: std::env::var("CONVERGE_KUSTOMIZE_BIN").map(PathBuf::from).unwrap_or(d.kustomize_bin),
            manifest_limits: ManifestLimits::from_env(),
            queue_capacity: env_parse("CONVERGE_QUEUE_CAP").unwrap_or(d.queue_capacity),
        }
    }
}
