use crate::paths;
use common::config::{env_millis_or, env_or};
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration of a camera client session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub client_socket_path: PathBuf,
    pub server_socket_path: PathBuf,
    pub client_id: u32,
    pub heartbeat_interval: Duration,
    pub release_timeout: Duration,
    pub pwdn_pin: u32,
    pub gpio_sysfs_root: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_socket_path: PathBuf::from(paths::CLIENT_SOCKET_PATH),
            server_socket_path: PathBuf::from(paths::SERVER_SOCKET_PATH),
            client_id: 0,
            heartbeat_interval: paths::HEARTBEAT_INTERVAL,
            release_timeout: paths::RELEASE_TIMEOUT,
            pwdn_pin: paths::PWDN_PIN,
            gpio_sysfs_root: PathBuf::from(paths::GPIO_SYSFS_ROOT),
        }
    }
}

impl ClientConfig {
    /// Read overrides from `CAMERA_*` variables. Unset or unparsable values
    /// keep the production defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            client_socket_path: env_or("CAMERA_CLIENT_SOCKET", defaults.client_socket_path),
            server_socket_path: env_or("CAMERA_SERVER_SOCKET", defaults.server_socket_path),
            client_id: env_or("CAMERA_CLIENT_ID", defaults.client_id),
            heartbeat_interval: env_millis_or("CAMERA_HEARTBEAT_MS", defaults.heartbeat_interval),
            release_timeout: env_millis_or("CAMERA_RELEASE_TIMEOUT_MS", defaults.release_timeout),
            pwdn_pin: env_or("CAMERA_PWDN_PIN", defaults.pwdn_pin),
            gpio_sysfs_root: env_or("CAMERA_GPIO_SYSFS_ROOT", defaults.gpio_sysfs_root),
        }
    }
}
