#![forbid(unsafe_code)]

// Server configuration, loaded from environment variables with defaults.

use std::net::IpAddr;

/// Runtime configuration for the SFU.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket signaling port
    pub port: u16,
    /// Path to the PEM-encoded RSA public key used to verify join tokens
    pub public_key_path: String,
    /// STUN server handed to the peer-connection library
    pub stun_server: String,
    /// ICE media port range (inclusive)
    pub ice_port_min: u16,
    pub ice_port_max: u16,
    /// Optional public IP announced in ICE candidates (NAT 1:1)
    pub announce_ip: Option<IpAddr>,
    /// Cap on concurrent WebSocket connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            public_key_path: "keys/public.pem".to_string(),
            stun_server: "stun:stun.l.google.com:19302".to_string(),
            ice_port_min: 50001,
            ice_port_max: 50005,
            announce_ip: None,
            max_connections: 10_000,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            port: env_parse("PORT", defaults.port),
            public_key_path: std::env::var("PUBLIC_KEY_PATH")
                .unwrap_or(defaults.public_key_path),
            stun_server: std::env::var("STUN_SERVER").unwrap_or(defaults.stun_server),
            ice_port_min: env_parse("ICE_PORT_MIN", defaults.ice_port_min),
            ice_port_max: env_parse("ICE_PORT_MAX", defaults.ice_port_max),
            announce_ip: std::env::var("ANNOUNCE_IP")
                .ok()
                .and_then(|v| v.parse().ok()),
            max_connections: env_parse("MAX_CONNECTIONS", defaults.max_connections),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.ice_port_min, 50001);
        assert_eq!(cfg.ice_port_max, 50005);
        assert!(cfg.announce_ip.is_none());
        assert_eq!(cfg.max_connections, 10_000);
    }
}
