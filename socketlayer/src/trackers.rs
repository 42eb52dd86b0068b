//! Time-based trackers that drive a connection's state transitions. They do no I/O and read
//!  no clock: the connection passes in the tick's timestamp, which keeps them deterministic
//!  under test.

use std::time::Duration;
use tokio::time::Instant;
use crate::config::SocketLayerConfig;

/// Connect attempts of a connection that is connecting
pub struct ConnectingTracker {
    attempt_interval: Duration,
    max_attempts: u32,
    attempt_count: u32,
    last_attempt: Option<Instant>,
}
impl ConnectingTracker {
    pub fn new(config: &SocketLayerConfig) -> ConnectingTracker {
        ConnectingTracker {
            attempt_interval: config.connect_attempt_interval,
            max_attempts: config.max_connect_attempts,
            attempt_count: 0,
            last_attempt: None,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// The first attempt is due right away, later ones after the configured interval
    pub fn time_attempt(&self, now: Instant) -> bool {
        match self.last_attempt {
            None => true,
            Some(last) => last + self.attempt_interval < now,
        }
    }

    pub fn max_attempts(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    pub fn on_attempt(&mut self, now: Instant) {
        self.attempt_count += 1;
        self.last_attempt = Some(now);
    }
}

/// Receive side liveness: silence for longer than the timeout means the peer is gone
pub struct TimeoutTracker {
    timeout: Duration,
    last_receive: Instant,
}
impl TimeoutTracker {
    pub fn new(config: &SocketLayerConfig, now: Instant) -> TimeoutTracker {
        TimeoutTracker {
            timeout: config.timeout_duration,
            last_receive: now,
        }
    }

    pub fn set_receive_time(&mut self, now: Instant) {
        self.last_receive = now;
    }

    pub fn time_to_disconnect(&self, now: Instant) -> bool {
        self.last_receive + self.timeout < now
    }
}

/// Send side liveness: if nothing was sent for a while, a keep-alive keeps the peer's
///  [TimeoutTracker] from firing
pub struct KeepAliveTracker {
    interval: Duration,
    last_send: Instant,
}
impl KeepAliveTracker {
    pub fn new(config: &SocketLayerConfig, now: Instant) -> KeepAliveTracker {
        KeepAliveTracker {
            interval: config.keep_alive_interval,
            last_send: now,
        }
    }

    pub fn set_send_time(&mut self, now: Instant) {
        self.last_send = now;
    }

    pub fn time_to_send(&self, now: Instant) -> bool {
        self.last_send + self.interval < now
    }
}

/// Grace period between disconnecting and removing a connection. Packets arriving in this
///  period find the disconnected connection and are ignored instead of opening a new one.
pub struct DisconnectedTracker {
    wait_time: Duration,
    disconnected_at: Option<Instant>,
}
impl DisconnectedTracker {
    pub fn new(config: &SocketLayerConfig) -> DisconnectedTracker {
        DisconnectedTracker {
            wait_time: config.disconnected_wait_time,
            disconnected_at: None,
        }
    }

    pub fn on_disconnect(&mut self, now: Instant) {
        self.disconnected_at = Some(now);
    }

    pub fn time_to_remove(&self, now: Instant) -> bool {
        match self.disconnected_at {
            None => false,
            Some(at) => at + self.wait_time < now,
        }
    }
}
