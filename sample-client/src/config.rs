use envconfig::Envconfig;
use std::time::Duration;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(default = "http://127.0.0.1:50051")]
    pub server_url: String,

    /// Service name passed to the health watch, empty for the whole server
    #[envconfig(default = "")]
    pub health_service: String,

    /// Comma separated payloads sent before half-closing
    #[envconfig(default = "foo")]
    pub payloads: String,

    #[envconfig(default = "5000")]
    pub connect_timeout_ms: u64,
}

impl Config {
    pub fn payloads(&self) -> Vec<String> {
        self.payloads
            .split(',')
            .map(str::trim)
            .filter(|payload| !payload.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
