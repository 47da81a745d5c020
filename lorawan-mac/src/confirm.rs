//! Tracking of confirmed uplinks awaiting acknowledgement and of confirmed
//! downlinks the device still owes an ACK for.

use std::time::{Duration, Instant};

/// Total transmissions of a confirmed payload before giving up.
pub(crate) const MAX_RETRIES: u8 = 8;

/// Pause between retransmissions of an unacknowledged confirmed uplink.
pub(crate) const RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmState {
    /// Nothing outstanding.
    None,
    /// A confirmed uplink is out, the network has not acknowledged yet.
    WaitingAck,
    /// A confirmed downlink arrived; the next uplink carries the ACK bit.
    AckPending,
}

/// What the MAC core should do on this tick.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RetryAction {
    None,
    /// Retransmit the stashed payload as a confirmed uplink. The tracker has
    /// already stepped aside; re-arm it through `on_confirmed_sent` (or
    /// `restore_waiting` if the transmission fails).
    Resend(Vec<u8>, u8),
    /// Retry budget exhausted; surface `NotConfirmed` to the application.
    GiveUp,
}

#[derive(Debug)]
pub(crate) struct ConfirmTracker {
    state: ConfirmState,
    retries_used: u8,
    last_attempt: Option<Instant>,
    pending_payload: Vec<u8>,
    pending_port: u8,
}

impl Default for ConfirmTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfirmTracker {
    pub fn new() -> Self {
        ConfirmTracker {
            state: ConfirmState::None,
            retries_used: 0,
            last_attempt: None,
            pending_payload: Vec::new(),
            pending_port: 0,
        }
    }

    pub fn state(&self) -> ConfirmState {
        self.state
    }

    pub fn retries_used(&self) -> u8 {
        self.retries_used
    }

    /// A confirmed uplink just went out.
    pub fn on_confirmed_sent(&mut self, payload: &[u8], port: u8, now: Instant) {
        self.state = ConfirmState::WaitingAck;
        self.retries_used += 1;
        self.last_attempt = Some(now);
        self.pending_payload = payload.to_vec();
        self.pending_port = port;
    }

    /// A downlink with the ACK bit arrived.
    pub fn ack_received(&mut self) -> bool {
        if self.state == ConfirmState::WaitingAck {
            self.reset();
            true
        } else {
            false
        }
    }

    /// A confirmed downlink arrived; we owe the network an ACK.
    pub fn on_confirmed_downlink(&mut self) {
        self.state = ConfirmState::AckPending;
    }

    /// The ACK bit went out on an uplink.
    pub fn ack_sent(&mut self) {
        if self.state == ConfirmState::AckPending {
            self.reset();
        }
    }

    /// Puts the tracker back into WaitingAck after a failed retransmission.
    pub fn restore_waiting(&mut self) {
        self.state = ConfirmState::WaitingAck;
    }

    /// Drives the retry schedule.
    pub fn poll(&mut self, now: Instant) -> RetryAction {
        if self.state != ConfirmState::WaitingAck {
            return RetryAction::None;
        }
        if self.retries_used >= MAX_RETRIES {
            self.reset();
            return RetryAction::GiveUp;
        }
        match self.last_attempt {
            Some(last) if now.duration_since(last) >= RETRY_INTERVAL => {
                // step aside so the retransmission passes the WaitingAck
                // refusal check in send()
                self.state = ConfirmState::None;
                RetryAction::Resend(self.pending_payload.clone(), self.pending_port)
            }
            _ => RetryAction::None,
        }
    }

    pub fn reset(&mut self) {
        self.state = ConfirmState::None;
        self.retries_used = 0;
        self.last_attempt = None;
        self.pending_payload.clear();
        self.pending_port = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_ends_the_exchange() {
        let mut tracker = ConfirmTracker::new();
        let t0 = Instant::now();
        tracker.on_confirmed_sent(b"x", 1, t0);
        assert_eq!(tracker.state(), ConfirmState::WaitingAck);

        assert!(tracker.ack_received());
        assert_eq!(tracker.state(), ConfirmState::None);
        assert_eq!(tracker.retries_used(), 0);
    }

    #[test]
    fn no_retry_before_the_interval() {
        let mut tracker = ConfirmTracker::new();
        let t0 = Instant::now();
        tracker.on_confirmed_sent(b"x", 1, t0);
        assert_eq!(tracker.poll(t0 + Duration::from_secs(4)), RetryAction::None);
    }

    #[test]
    fn lost_uplink_is_retried_at_most_eight_times() {
        let mut tracker = ConfirmTracker::new();
        let mut now = Instant::now();
        tracker.on_confirmed_sent(b"payload", 2, now);

        let mut transmissions = 1;
        loop {
            now += RETRY_INTERVAL;
            match tracker.poll(now) {
                RetryAction::Resend(payload, port) => {
                    assert_eq!(payload, b"payload");
                    assert_eq!(port, 2);
                    tracker.on_confirmed_sent(&payload, port, now);
                    transmissions += 1;
                }
                RetryAction::GiveUp => break,
                RetryAction::None => panic!("tracker stalled"),
            }
            assert!(transmissions <= MAX_RETRIES, "retry cap exceeded");
        }

        assert_eq!(transmissions, MAX_RETRIES);
        assert_eq!(tracker.state(), ConfirmState::None);
        // no further automatic transmissions
        assert_eq!(tracker.poll(now + RETRY_INTERVAL), RetryAction::None);
    }

    #[test]
    fn failed_resend_is_restored() {
        let mut tracker = ConfirmTracker::new();
        let t0 = Instant::now();
        tracker.on_confirmed_sent(b"x", 1, t0);

        let later = t0 + RETRY_INTERVAL;
        assert!(matches!(tracker.poll(later), RetryAction::Resend(..)));
        assert_eq!(tracker.state(), ConfirmState::None);
        tracker.restore_waiting();
        assert_eq!(tracker.state(), ConfirmState::WaitingAck);
    }

    #[test]
    fn confirmed_downlink_marks_ack_pending() {
        let mut tracker = ConfirmTracker::new();
        tracker.on_confirmed_downlink();
        assert_eq!(tracker.state(), ConfirmState::AckPending);

        tracker.ack_sent();
        assert_eq!(tracker.state(), ConfirmState::None);
    }
}
