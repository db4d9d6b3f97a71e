//! Centralized IPC constants
//!
//! Socket paths, buffer bounds and timing shared by every part of the camera
//! client. The values match what the camera server daemon expects.

use std::time::Duration;

/// Datagram socket the client binds
pub const CLIENT_SOCKET_PATH: &str = "/dev/socket/vic-engine-cam_client0";

/// Well-known datagram socket of the camera server
pub const SERVER_SOCKET_PATH: &str = "/var/run/mm-anki-camera/camera-server";

/// ION allocator device, used when the `ion` feature is enabled
pub const ION_DEVICE_PATH: &str = "/dev/ion";

/// Root of the sysfs tree used for GPIO access
pub const GPIO_SYSFS_ROOT: &str = "/sys";

/// Sensor power-down (standby) GPIO
pub const PWDN_PIN: u32 = 94;

/// Maximum number of frame slots in the shared buffer
pub const MAX_FRAMES: usize = 6;

/// Capacity of the outgoing and incoming message queues
pub const MAX_PACKETS: usize = 12;

/// Interval between client heartbeats; also the event loop poll timeout
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(200);

/// How long a release waits for the unregister ack before tearing down anyway
pub const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_are_absolute() {
        assert!(CLIENT_SOCKET_PATH.starts_with('/'));
        assert!(SERVER_SOCKET_PATH.starts_with('/'));
        assert!(ION_DEVICE_PATH.starts_with('/'));
        assert!(GPIO_SYSFS_ROOT.starts_with('/'));
    }

    #[test]
    fn test_socket_paths_fit_sun_path() {
        // sockaddr_un.sun_path is 108 bytes on Linux, including the NUL
        assert!(CLIENT_SOCKET_PATH.len() < 108);
        assert!(SERVER_SOCKET_PATH.len() < 108);
    }

    #[test]
    fn test_release_outlasts_heartbeat() {
        assert!(RELEASE_TIMEOUT > HEARTBEAT_INTERVAL * 2);
    }
}
