use std::time::Duration;

use crate::config::ConfigError;

/// Tuning for one WebSocket session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Deadline for a single frame write.
    pub write_wait: Duration,
    /// Read deadline, re-armed on every pong.
    pub pong_wait: Duration,
    /// Interval between server pings. Must be shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Largest accepted inbound frame, in bytes.
    pub max_message_size: usize,
    /// Capacity of the inbound and outbound queues.
    pub buffer_size: usize,
    /// Backpressure starts once more than this many frames are queued.
    pub buffer_high_water: usize,
    /// Backpressure ends at or below this many queued frames.
    pub buffer_low_water: usize,
    /// Poll interval of the backpressure monitor.
    pub monitor_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            write_wait: Duration::from_secs(5),
            pong_wait: Duration::from_secs(45),
            ping_period: Duration::from_secs(30),
            max_message_size: 4096,
            buffer_size: 512,
            buffer_high_water: 256,
            buffer_low_water: 64,
            monitor_interval: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ping_period >= self.pong_wait {
            return Err(ConfigError::Invalid {
                name: "WS_PING_PERIOD_SECONDS",
                reason: format!(
                    "ping period {:?} must be shorter than pong wait {:?}",
                    self.ping_period, self.pong_wait
                ),
            });
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid {
                name: "WS_BUFFER_SIZE",
                reason: "buffer size must be positive".into(),
            });
        }
        if self.buffer_low_water >= self.buffer_high_water
            || self.buffer_high_water > self.buffer_size
        {
            return Err(ConfigError::Invalid {
                name: "WS_BUFFER_HIGH_WATER",
                reason: format!(
                    "expected low water {} < high water {} <= buffer size {}",
                    self.buffer_low_water, self.buffer_high_water, self.buffer_size
                ),
            });
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid {
                name: "WS_MAX_MESSAGE_SIZE",
                reason: "max message size must be positive".into(),
            });
        }
        Ok(())
    }
}
