//! The RX1/RX2 receive-window state machine.
//!
//! Driven by explicit timestamps from `update()` ticks, so the timing
//! behavior is testable without a radio or a wall clock.

use std::time::Instant;

use crate::region::Region;

/// Delay from TX end to the opening of RX1, unless rewritten by
/// RXTimingSetupReq.
pub const RECEIVE_DELAY1_MS: u64 = 1000;

/// How long each receive window stays open. Comfortably above the 5-symbol
/// minimum at every supported data rate.
pub const WINDOW_DURATION_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    Idle,
    Wait1,
    Window1,
    Wait2,
    Window2,
    Continuous,
}

/// Radio-facing transition requested by a scheduler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RxAction {
    None,
    OpenRx1,
    OpenRx2,
    /// Class A: both windows closed, radio goes to standby.
    CloseToIdle,
    /// Class C: window 2 expired, stay in continuous RX2 reception.
    CloseToContinuous,
}

/// Downlink reception parameters, adjustable via RXParamSetupReq.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct RxParams {
    pub rx1_dr_offset: u8,
    pub rx2_frequency_mhz: f32,
    /// RX2 data rate override; `None` keeps the regional default.
    pub rx2_data_rate: Option<u8>,
}

impl RxParams {
    pub fn defaults(region: Region) -> Self {
        RxParams {
            rx1_dr_offset: 0,
            rx2_frequency_mhz: region.plan().rx2_freq_mhz,
            rx2_data_rate: None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct RxWindows {
    state: RxState,
    tx_end: Option<Instant>,
    window_open: Option<Instant>,
    pub rx1_delay_ms: u64,
}

impl Default for RxWindows {
    fn default() -> Self {
        Self::new()
    }
}

impl RxWindows {
    pub fn new() -> Self {
        RxWindows {
            state: RxState::Idle,
            tx_end: None,
            window_open: None,
            rx1_delay_ms: RECEIVE_DELAY1_MS,
        }
    }

    pub fn state(&self) -> RxState {
        self.state
    }

    /// RECEIVE_DELAY2 is always one second after RECEIVE_DELAY1.
    pub fn rx2_delay_ms(&self) -> u64 {
        self.rx1_delay_ms + 1000
    }

    /// Arms the window schedule at the end of an uplink transmission.
    pub fn on_tx_done(&mut self, now: Instant) {
        self.state = RxState::Wait1;
        self.tx_end = Some(now);
        self.window_open = None;
    }

    /// A downlink was received; Class A devices are done until the next
    /// uplink, Class C devices fall back to continuous reception.
    pub fn on_rx_packet(&mut self, continuous: bool) {
        self.state = if continuous { RxState::Continuous } else { RxState::Idle };
        self.window_open = None;
    }

    /// Class C entry: park in continuous reception.
    pub fn force_continuous(&mut self) {
        self.state = RxState::Continuous;
        self.window_open = None;
    }

    pub fn set_idle(&mut self) {
        self.state = RxState::Idle;
        self.window_open = None;
    }

    /// Advances the machine; the caller performs the returned radio action.
    pub fn poll(&mut self, now: Instant, continuous: bool) -> RxAction {
        let Some(tx_end) = self.tx_end else {
            return RxAction::None;
        };
        let since_tx = now.duration_since(tx_end).as_millis() as u64;

        match self.state {
            RxState::Wait1 => {
                if since_tx >= self.rx1_delay_ms {
                    self.state = RxState::Window1;
                    self.window_open = Some(now);
                    RxAction::OpenRx1
                } else {
                    RxAction::None
                }
            }
            RxState::Window1 => {
                if self.window_elapsed(now) {
                    if since_tx < self.rx2_delay_ms() {
                        self.state = RxState::Wait2;
                        RxAction::None
                    } else {
                        // the tick arrived late; open RX2 immediately
                        self.state = RxState::Window2;
                        self.window_open = Some(now);
                        RxAction::OpenRx2
                    }
                } else {
                    RxAction::None
                }
            }
            RxState::Wait2 => {
                if since_tx >= self.rx2_delay_ms() {
                    self.state = RxState::Window2;
                    self.window_open = Some(now);
                    RxAction::OpenRx2
                } else {
                    RxAction::None
                }
            }
            RxState::Window2 => {
                if self.window_elapsed(now) {
                    if continuous {
                        self.state = RxState::Continuous;
                        RxAction::CloseToContinuous
                    } else {
                        self.state = RxState::Idle;
                        RxAction::CloseToIdle
                    }
                } else {
                    RxAction::None
                }
            }
            RxState::Idle | RxState::Continuous => RxAction::None,
        }
    }

    fn window_elapsed(&self, now: Instant) -> bool {
        match self.window_open {
            Some(open) => now.duration_since(open).as_millis() as u64 >= WINDOW_DURATION_MS,
            None => true,
        }
    }
}
