use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_STATIC_DIR: &str = "./web/static";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub static_dir: PathBuf,
    /// Send `data` frames back to their sender as well.
    pub echo: bool,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind: env::var("WEBTTY_RELAY_BIND")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(defaults.bind),
            port: env::var("WEBTTY_RELAY_PORT")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(defaults.port),
            static_dir: env::var("WEBTTY_RELAY_STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.static_dir),
            echo: env::var("WEBTTY_RELAY_ECHO")
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.echo),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            static_dir: PathBuf::from(DEFAULT_STATIC_DIR),
            echo: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_listens_on_all_interfaces() {
        let config = RelayConfig::default();
        assert_eq!(config.addr().to_string(), "0.0.0.0:8080");
        assert_eq!(config.static_dir, PathBuf::from("./web/static"));
        assert!(!config.echo);
    }
}
