use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Settings for a [`Relay`](crate::relay::Relay). The listening port is
/// supplied separately to `initialize`.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Interface to listen on. Defaults to all interfaces.
    pub bind_address: IpAddr,
    /// How long `send` waits for a correlated reply.
    pub reply_timeout: Duration,
    /// Largest undelimited frame a client may send before its connection is
    /// dropped. `None` accepts frames of any size.
    pub max_frame_len: Option<usize>,
    /// Buffer size of the inbound application event stream.
    pub event_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            max_frame_len: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}
