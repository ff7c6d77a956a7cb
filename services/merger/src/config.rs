use serde_derive::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_SOCKET: &str = "/tmp/llmerger";

#[derive(Serialize, Deserialize)]
pub struct Server {
    /// Unix socket the merger always listens on.
    #[serde(default = "default_socket")]
    pub socket: PathBuf,
    /// Optional TCP listener.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_true")]
    pub ipv6: bool,
    /// PEM file (certificate + key) enabling TLS on the TCP listener.
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,
}

#[derive(Serialize, Deserialize)]
pub struct MergerConfig {
    pub server: Server,
}

fn default_socket() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET)
}

fn default_true() -> bool {
    true
}

impl Default for MergerConfig {
    fn default() -> MergerConfig {
        MergerConfig {
            server: Server {
                socket: default_socket(),
                port: None,
                ipv6: true,
                tls_cert: None,
            },
        }
    }
}

impl MergerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> MergerConfig {
        serdeconv::from_toml_file(path).expect("Error loading merger configuration file")
    }
}
