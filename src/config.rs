use std::time::Duration;

use crate::proto::wire::DEFAULT_MAX_ELEMENT_LEN;

/// Per-connection tuning knobs. The defaults are the protocol's nominal values; tests
///  shrink the keepalive timings so idle/timeout scenarios don't take minutes.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// interval at which the pinger loop wakes up and checks for idleness
    pub tick: Duration,
    /// stream idle time after which the peer is actively probed
    pub ping_idle: Duration,
    /// a keepalive probe not answered within this bound means the peer is dead
    pub ping_timeout: Duration,
    /// upper bound for any single length prefix accepted off the wire
    pub max_element_len: usize,
}

impl Default for ConnectionConfig {
    fn default() -> ConnectionConfig {
        ConnectionConfig {
            tick: Duration::from_secs(1),
            ping_idle: Duration::from_secs(5 * 60),
            ping_timeout: Duration::from_secs(30),
            max_element_len: DEFAULT_MAX_ELEMENT_LEN,
        }
    }
}
