use camera_ipc::ClientConfig;
use common::config::{env_millis_or, env_or};
use std::env;
use std::time::Duration;

pub use common::Environment;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub environment: Environment,
    pub client: ClientConfig,
    /// Attempts made to connect to the camera server on init
    pub init_retries: u32,
    pub poll_interval: Duration,
    pub otel_endpoint: Option<String>,
}

impl ServiceConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let environment = Environment::from_env();
        let client = ClientConfig::from_env();

        let init_retries = env_or("CAMERA_INIT_RETRIES", 10);
        let poll_interval = env_millis_or("CAMERA_POLL_MS", Duration::from_millis(33));

        let otel_endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .ok()
            .filter(|s| !s.is_empty());

        Ok(Self {
            environment,
            client,
            init_retries,
            poll_interval,
            otel_endpoint,
        })
    }
}
