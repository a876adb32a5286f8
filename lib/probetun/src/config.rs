use crate::net::link::NETLINK_GROUP;
use crate::net::server::MAX_CONNECTIONS_LIMIT;
use serde_derive::{Deserialize, Serialize};
use serdeconv;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_SRV_ID: u8 = 9;

#[derive(Serialize, Deserialize)]
pub struct ServerConfig {
    /// Logical server id announced to clients, 1..15.
    pub srv_id: u8,
    /// Concurrent client cap, 1..7.
    pub max_connections: usize,
    /// Kernel multicast group the firmware publishes probe-requests on.
    pub netlink_group: u32,
    /// Whether the firmware may put a vendor IE into probe-responses.
    pub tx_vendor_ie: bool,
    /// Reset open connections after this many quiet seconds; absent
    /// disables the sweep.
    pub idle_timeout_secs: Option<u64>,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            srv_id: DEFAULT_SRV_ID,
            max_connections: MAX_CONNECTIONS_LIMIT,
            netlink_group: NETLINK_GROUP,
            tx_vendor_ie: true,
            idle_timeout_secs: None,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> ServerConfig {
        serdeconv::from_toml_file(path).expect("Error loading server configuration file")
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}
