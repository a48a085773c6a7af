//! Session-wide configuration: every named knob a game needs to tune, plus
//! the operational constants that need a concrete default value (tick rate,
//! heartbeat cadence, retry/timeout thresholds).

use std::time::Duration;

use crate::error::LifecycleError;

/// `[min, max]` interval, used for both the simulated loss and lag knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Interval {
    /// Lower bound, inclusive.
    pub min: f32,
    /// Upper bound, inclusive.
    pub max: f32,
}

impl Interval {
    /// A `[0, 0]` interval, under which the conditioner is bypassed entirely.
    pub const ZERO: Interval = Interval { min: 0.0, max: 0.0 };

    /// Whether this interval is the zero interval.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.min == 0.0 && self.max == 0.0
    }
}

impl Default for Interval {
    fn default() -> Self {
        Interval::ZERO
    }
}

/// Every configuration knob the session core exposes.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionConfig {
    /// Per-session peer cap.
    pub max_connections: usize,
    /// Dispatch table size.
    pub max_protocol_defns: usize,
    /// Packet-level reliable message cap.
    pub max_reliables_per_packet: usize,
    /// Per-connection retry-bookkeeping ring size.
    pub max_ack_bundles: usize,
    /// Sliding window half-width.
    pub reliable_range_radius: u16,
    /// Simulated one-way lag, in milliseconds.
    pub simulated_lag_ms: Interval,
    /// Simulated packet loss, as a probability in `[0, 1]`.
    pub simulated_loss_pct: Interval,

    /// How often the session ticks all connections.
    pub tick_rate: Duration,
    /// Heartbeat coalescing gap `π`, fixed within the allowed `[1s, 5s]` range.
    pub heartbeat_interval: Duration,
    /// How long a reliable waits since its last send before it's eligible
    /// for retransmission.
    pub reliable_retry_after: Duration,
    /// Seconds-since-last-recv threshold after which a connection is marked
    /// bad.
    pub bad_after: Duration,
    /// Seconds-since-last-recv threshold after which a connection is
    /// disconnected.
    pub disconnect_after: Duration,
    /// Wall-clock timeout on the `Joining` sub-state.
    pub join_timeout: Duration,
    /// First port `PacketChannel` attempts to bind.
    pub preferred_port: u16,
    /// Number of additional ports scanned after `preferred_port` on bind failure.
    pub port_scan_range: u16,
}

impl SessionConfig {
    /// Default heartbeat cadence: `2.0` seconds, inside the allowed `[1s, 5s]`
    /// range (see DESIGN.md's Open Question decisions).
    pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2000);

    /// Validates the cross-field invariants named below.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidConfig`] if any named ceiling is exceeded.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.max_connections > 64 {
            return Err(LifecycleError::InvalidConfig("max_connections must be <= 64"));
        }
        if self.max_protocol_defns > 256 {
            return Err(LifecycleError::InvalidConfig("max_protocol_defns must be <= 256"));
        }
        if self.max_reliables_per_packet > 32 {
            return Err(LifecycleError::InvalidConfig(
                "max_reliables_per_packet must be <= 32",
            ));
        }
        if self.max_ack_bundles != crate::ack::MAX_ACK_BUNDLES {
            return Err(LifecycleError::InvalidConfig(
                "max_ack_bundles must equal the compiled-in ring size",
            ));
        }
        if self.heartbeat_interval < Duration::from_secs(1) || self.heartbeat_interval > Duration::from_secs(5) {
            return Err(LifecycleError::InvalidConfig(
                "heartbeat_interval must be within [1s, 5s]",
            ));
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_connections: 64,
            max_protocol_defns: 256,
            max_reliables_per_packet: 32,
            max_ack_bundles: crate::ack::MAX_ACK_BUNDLES,
            reliable_range_radius: crate::reliable::RELIABLE_RANGE_RADIUS,
            simulated_lag_ms: Interval::ZERO,
            simulated_loss_pct: Interval::ZERO,
            tick_rate: Duration::from_millis(50),
            heartbeat_interval: Self::DEFAULT_HEARTBEAT_INTERVAL,
            reliable_retry_after: Duration::from_millis(200),
            bad_after: Duration::from_secs(5),
            disconnect_after: Duration::from_secs(15),
            join_timeout: Duration::from_secs(15),
            preferred_port: 0,
            port_scan_range: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_too_many_connections() {
        let mut cfg = SessionConfig::default();
        cfg.max_connections = 65;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_heartbeat_outside_spec_range() {
        let mut cfg = SessionConfig::default();
        cfg.heartbeat_interval = std::time::Duration::from_millis(500);
        assert!(cfg.validate().is_err());
    }
}
