//! Session state types
//!
//! The lifecycle state is owned by the platform VPN subsystem and pushed to
//! the controller; everything here is a plain value type.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Tunnel lifecycle state as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No usable profile (or no status observed yet)
    #[default]
    Invalid,
    /// Profile registered, tunnel down
    Disconnected,
    /// Tunnel start requested, waiting for the platform
    Connecting,
    /// Tunnel is up
    Connected,
    /// Tunnel stop requested, waiting for the platform
    Disconnecting,
}

impl SessionState {
    /// Check if the tunnel is up
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }

    /// Check if no tunnel is open (the connection handle is invalid)
    pub fn is_inactive(&self) -> bool {
        matches!(self, SessionState::Invalid | SessionState::Disconnected)
    }

    /// Check if the platform is mid-transition
    pub fn is_transient(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Disconnecting)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Invalid => "invalid",
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Cumulative bytes transferred since the current connection began
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSample {
    /// Bytes sent through the tunnel
    pub upload_bytes: u64,
    /// Bytes received through the tunnel
    pub download_bytes: u64,
}

impl StatsSample {
    pub fn new(upload_bytes: u64, download_bytes: u64) -> Self {
        Self {
            upload_bytes,
            download_bytes,
        }
    }

    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "TX: {:.2}MB, RX: {:.2}MB",
            self.upload_bytes as f64 / (1024.0 * 1024.0),
            self.download_bytes as f64 / (1024.0 * 1024.0),
        )
    }
}

/// How a settings change is applied to a running tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartDecision {
    /// Tear the tunnel down and start a new one
    FullRestart,
    /// Ask the running engine to re-read its configuration
    LiveReload,
}

impl fmt::Display for RestartDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartDecision::FullRestart => f.write_str("full restart"),
            RestartDecision::LiveReload => f.write_str("live reload"),
        }
    }
}

/// What the poll loop republishes every tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionSnapshot {
    /// Last observed lifecycle state
    pub state: SessionState,
    /// Latest stats for the current connection epoch
    pub stats: StatsSample,
    /// Time since the last successful connect
    pub elapsed: Duration,
    /// Any VPN-like interface is up system-wide (not only ours)
    pub any_vpn_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(SessionState::Connected.is_connected());
        assert!(!SessionState::Connecting.is_connected());

        assert!(SessionState::Invalid.is_inactive());
        assert!(SessionState::Disconnected.is_inactive());
        assert!(!SessionState::Disconnecting.is_inactive());

        assert!(SessionState::Connecting.is_transient());
        assert!(SessionState::Disconnecting.is_transient());
        assert!(!SessionState::Connected.is_transient());
    }

    #[test]
    fn test_state_starts_invalid() {
        assert_eq!(SessionState::default(), SessionState::Invalid);
        assert_eq!(SessionSnapshot::default().stats, StatsSample::new(0, 0));
    }

    #[test]
    fn test_stats_format() {
        let stats = StatsSample::new(1024 * 1024, 3 * 1024 * 1024);
        assert_eq!(stats.format(), "TX: 1.00MB, RX: 3.00MB");
    }
}
