use std::time::Duration;

/// Runtime configuration for the networking core.
#[derive(Clone, Debug)]
pub struct NetConfig {
    /// Upper bound on a single TCP connect attempt.
    pub dial_timeout: Duration,
    /// Inbound substreams buffered per session before backpressure.
    pub substream_backlog: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            substream_backlog: 32,
        }
    }
}
