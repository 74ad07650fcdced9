//! Stack-wide configuration knobs: timers, concurrency limits, and the
//! policy flags that gate the handful of behaviors the state machine leaves
//! switchable, centralized into one struct rather than scattered constants.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct StackConfig {
    /// RFC 3261 Timer T1 (round-trip time estimate).
    pub t1: Duration,
    /// RFC 3261 Timer T2 (maximum retransmission interval for non-INVITE and
    /// INVITE response retransmissions).
    pub t2: Duration,
    /// RFC 3261 Timer T4 (maximum duration a message remains in the network).
    pub t4: Duration,
    /// How long an EARLY dialog may remain unconfirmed before
    /// `DialogError::EarlyStateTimeout` is raised. Default 180s.
    pub early_dialog_timeout: Duration,
    /// How long a TERMINATED dialog is kept reachable for late ACK/BYE.
    /// Default 8s; 0 executes the linger task inline.
    pub connection_linger_timer: Duration,
    /// Multiplier applied to `t1` to derive the ACK-wait timeout after a
    /// final 2xx is sent. Default 64 (64 x 500ms = 32s, i.e. Timer H).
    pub dialog_timeout_factor: u32,
    /// Absolute ceiling on an INVITE transaction's lifetime.
    pub max_tx_lifetime_invite: Duration,
    /// Absolute ceiling on a non-INVITE transaction's lifetime.
    pub max_tx_lifetime_non_invite: Duration,
    /// Whether a dialog's remote tag may be reassigned while EARLY (needed
    /// to observe forking). Preserved as a stack-wide policy flag rather
    /// than hardcoded, per the source system's `isRemoteTagReassignmentAllowed`.
    pub remote_tag_reassignment_allowed: bool,
    /// Whether a SUBSCRIBE dialog may accept one route-set update carried by
    /// its 202 response, despite CONFIRMED route-set immutability.
    pub pending_route_update_on_202: bool,
    /// Occupancy thresholds (0.0-1.0) between which `new_server_request`
    /// sheds load probabilistically rather than admitting every request.
    /// Below `load_shed_low_water` every request is admitted; at or above
    /// `load_shed_high_water` every request is shed.
    pub load_shed_low_water: f32,
    pub load_shed_high_water: f32,
    /// The server transaction table size `load_shed_low_water`/
    /// `load_shed_high_water` are fractions of.
    pub server_transaction_capacity: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_millis(4000),
            t4: Duration::from_millis(5000),
            early_dialog_timeout: Duration::from_secs(180),
            connection_linger_timer: Duration::from_secs(8),
            dialog_timeout_factor: 64,
            max_tx_lifetime_invite: Duration::from_secs(180),
            max_tx_lifetime_non_invite: Duration::from_secs(64),
            remote_tag_reassignment_allowed: true,
            pending_route_update_on_202: true,
            load_shed_low_water: 0.8,
            load_shed_high_water: 1.0,
            server_transaction_capacity: 65_536,
        }
    }
}

impl StackConfig {
    pub fn ack_wait_timeout(&self) -> Duration {
        self.t1 * self.dialog_timeout_factor
    }
}
