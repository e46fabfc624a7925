use std::env;
use std::time::Duration;

use rand::Rng;

/// Lower bound of the randomized election window, milliseconds.
pub const LOW_TIMEOUT: u64 = 150;
/// Upper bound of the randomized election window, milliseconds.
pub const HIGH_TIMEOUT: u64 = 300;
/// Pace of the leader's heartbeat loop, milliseconds.
pub const HB_TIME: u64 = 50;
/// How long a write waits for quorum before it is rejected, milliseconds.
pub const MAX_LOG_WAIT: u64 = 150;
/// Bound on every outbound connect/read/write, milliseconds.
pub const REQUESTS_TIMEOUT: u64 = 50;

/// Catch-up replication sends the missing log tail in batches of this size.
pub const REPLICATION_CHUNK: usize = 4;

/// Timing knobs for one node. `from_env` applies the `LOW_TIMEOUT`,
/// `HIGH_TIMEOUT`, `HB_TIME` and `MAX_LOG_WAIT` environment overrides;
/// tests inject explicit values instead.
#[derive(Clone, Copy, Debug)]
pub struct Timing {
    pub low_timeout_ms: u64,
    pub high_timeout_ms: u64,
    pub heartbeat_ms: u64,
    pub max_log_wait_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            low_timeout_ms: LOW_TIMEOUT,
            high_timeout_ms: HIGH_TIMEOUT,
            heartbeat_ms: HB_TIME,
            max_log_wait_ms: MAX_LOG_WAIT,
            request_timeout_ms: REQUESTS_TIMEOUT,
        }
    }
}

impl Timing {
    pub fn from_env() -> Self {
        Timing {
            low_timeout_ms: env_ms("LOW_TIMEOUT", LOW_TIMEOUT),
            high_timeout_ms: env_ms("HIGH_TIMEOUT", HIGH_TIMEOUT),
            heartbeat_ms: env_ms("HB_TIME", HB_TIME),
            max_log_wait_ms: env_ms("MAX_LOG_WAIT", MAX_LOG_WAIT),
            request_timeout_ms: REQUESTS_TIMEOUT,
        }
    }

    /// A fresh election deadline offset, drawn uniformly from the window.
    pub fn election_timeout(&self) -> Duration {
        // a degenerate override still yields a non-empty window
        let high = self.high_timeout_ms.max(self.low_timeout_ms + 1);
        let ms = rand::thread_rng().gen_range(self.low_timeout_ms..high);
        Duration::from_millis(ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn max_log_wait(&self) -> Duration {
        Duration::from_millis(self.max_log_wait_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// A redirected client request rides out the leader's own quorum wait.
    pub fn redirect_timeout(&self) -> Duration {
        Duration::from_millis(self.max_log_wait_ms + 500)
    }
}

fn env_ms(key: &str, default: u64) -> u64 {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or(default),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn election_timeout_stays_in_window() {
        let timing = Timing::default();
        for _ in 0..100 {
            let t = timing.election_timeout();
            assert!(t >= Duration::from_millis(timing.low_timeout_ms));
            assert!(t < Duration::from_millis(timing.high_timeout_ms));
        }
    }
}
