use envconfig::Envconfig;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:50051")]
    pub grpc_address: SocketAddr,

    /// How long health watchers get to see NOT_SERVING before the listener stops
    #[envconfig(default = "1000")]
    pub drain_grace_ms: u64,

    /// How long in-flight streams get to finish before they are force-terminated
    #[envconfig(default = "1000")]
    pub stop_timeout_ms: u64,

    /// Prometheus exporter port, 0 disables it
    #[envconfig(default = "0")]
    pub metrics_port: u16,
}

impl Config {
    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();
        assert_eq!(config.grpc_address, "127.0.0.1:50051".parse().unwrap());
        assert_eq!(config.drain_grace(), Duration::from_secs(1));
        assert_eq!(config.stop_timeout(), Duration::from_secs(1));
        assert_eq!(config.metrics_port, 0);
    }

    #[test]
    fn overrides() {
        let env = HashMap::from([
            ("GRPC_ADDRESS".to_string(), "0.0.0.0:6000".to_string()),
            ("DRAIN_GRACE_MS".to_string(), "250".to_string()),
            ("STOP_TIMEOUT_MS".to_string(), "5000".to_string()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();
        assert_eq!(config.grpc_address.port(), 6000);
        assert_eq!(config.drain_grace(), Duration::from_millis(250));
        assert_eq!(config.stop_timeout(), Duration::from_secs(5));
    }
}
