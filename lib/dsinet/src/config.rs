//! Engine configuration. All values can be taken from the environment, but
//! they are captured into an explicit `Config` at engine construction so no
//! hidden process-global state remains.

use std::env;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Abstract-namespace name of the default servicebroker mount point
/// (without the leading NUL byte).
pub const DEFAULT_BROKER: &str = "dsi/servicebroker";

#[derive(Debug, Clone)]
pub struct Config {
    /// Abstract-namespace name the servicebroker listens on.
    pub broker: String,
    /// Always use TCP transport, even when a local attach would work.
    pub force_tcp: bool,
    /// Port for the TCP acceptor; an ephemeral port is chosen when unset.
    pub tcp_port: Option<u16>,
    /// Local IP address advertised during TCP registration.
    pub ip_address: Ipv4Addr,
    /// Receive timeout applied to every accepted or connected channel.
    pub recv_timeout: Option<Duration>,
    /// Send timeout applied to every accepted or connected channel.
    pub send_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            broker: DEFAULT_BROKER.to_owned(),
            force_tcp: false,
            tcp_port: None,
            ip_address: Ipv4Addr::LOCALHOST,
            recv_timeout: None,
            send_timeout: None,
        }
    }
}

impl Config {
    /// Capture the configuration from the environment: `DSISERVICEBROKER`,
    /// `DSI_FORCE_TCP`, `DSI_COMMENGINE_PORT`, `DSI_IP_ADDRESS`,
    /// `DSI_RECV_TIMEOUT` and `DSI_SEND_TIMEOUT` (timeouts in milliseconds,
    /// zero meaning unlimited).
    pub fn from_env() -> Config {
        let defaults = Config::default();

        Config {
            broker: env::var("DSISERVICEBROKER").unwrap_or(defaults.broker),
            force_tcp: env_flag("DSI_FORCE_TCP"),
            tcp_port: env_number("DSI_COMMENGINE_PORT").map(|port| port as u16),
            ip_address: env::var("DSI_IP_ADDRESS")
                .ok()
                .and_then(|addr| addr.parse().ok())
                .unwrap_or(defaults.ip_address),
            recv_timeout: env_timeout("DSI_RECV_TIMEOUT"),
            send_timeout: env_timeout("DSI_SEND_TIMEOUT"),
        }
    }
}

fn env_number(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|value| value.parse().ok())
}

fn env_flag(name: &str) -> bool {
    env_number(name).map(|value| value > 0).unwrap_or(false)
}

fn env_timeout(name: &str) -> Option<Duration> {
    match env_number(name) {
        Some(0) | None => None,
        Some(ms) => Some(Duration::from_millis(ms)),
    }
}
