//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default address the server listens on.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:2323";

/// Everything a [`MapServer`](crate::MapServer) needs to know at
/// construction time.
///
/// Usually filled in through [`MapServerBuilder`](crate::MapServerBuilder)
/// rather than by hand.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the listener to.
    pub bind_addr: String,
    /// Init file holding the client preamble. `None` means no preamble.
    pub init_file: Option<PathBuf>,
    /// How often authenticated clients are sent `MARCO`. Zero disables
    /// the ping loop.
    pub ping_interval: Duration,
    /// Queue depth for the registry and game state actors.
    pub channel_size: usize,
    /// Log every inbound and outbound protocol line at `trace` level.
    pub trace_messages: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_owned(),
            init_file: None,
            ping_interval: Duration::from_secs(60),
            channel_size: 256,
            trace_messages: false,
        }
    }
}
