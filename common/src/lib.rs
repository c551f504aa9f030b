use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

pub mod names;
pub mod shutdown;
pub mod wait;

/// Default API listener port for a control plane instance.
pub const DEFAULT_API_PORT: u16 = 5373;
/// Default admin listener port (health + WebSocket hub).
pub const DEFAULT_ADMIN_PORT: u16 = 5374;

/// Prefix for k3d clusters managed by kecs. An instance named `dev` is
/// backed by a k3d cluster named `kecs-dev`.
pub const CLUSTER_PREFIX: &str = "kecs-";

pub fn init() {
    let default_level = if env_flag("KECS_DEBUG") {
        "debug"
    } else {
        "info"
    };
    let filter = std::env::var("KECS_LOG_LEVEL")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default_level.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// True when the named environment variable is set to a truthy value.
pub fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name)
            .unwrap_or_default()
            .to_lowercase()
            .as_str(),
        "1" | "true" | "yes"
    )
}

/// True when running as the in-cluster control plane rather than on the
/// operator's host.
pub fn container_mode() -> bool {
    env_flag("KECS_CONTAINER_MODE")
}

/// Root of all kecs state on this host: `~/.kecs`, or `KECS_DATA_DIR`
/// when set (the in-cluster deployment points this at its volume).
pub fn kecs_home() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("KECS_DATA_DIR")
        && !dir.is_empty()
    {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(".kecs"))
}

pub fn instance_dir(name: &str) -> Result<PathBuf> {
    Ok(kecs_home()?.join("instances").join(name))
}

pub fn instance_data_dir(name: &str) -> Result<PathBuf> {
    Ok(instance_dir(name)?.join("data"))
}

pub fn instance_config_path(name: &str) -> Result<PathBuf> {
    Ok(instance_dir(name)?.join("config.json"))
}

/// Current time as Unix epoch milliseconds.
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_dir_override_wins() {
        // Serialize env mutation within this test only.
        unsafe { std::env::set_var("KECS_DATA_DIR", "/tmp/kecs-test-home") };
        assert_eq!(kecs_home().unwrap(), PathBuf::from("/tmp/kecs-test-home"));
        unsafe { std::env::remove_var("KECS_DATA_DIR") };
    }
}
