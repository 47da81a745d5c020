//! Adaptive-data-rate bookkeeping: the ADRACKReq counter protocol and the
//! link statistics that back DevStatusAns.

use std::collections::VecDeque;

pub(crate) const ADR_ACK_LIMIT: u32 = 64;
pub(crate) const ADR_ACK_DELAY: u32 = 32;

const STATS_WINDOW: usize = 10;

/// Device-side ADR state.
#[derive(Debug, Default)]
pub(crate) struct Adr {
    pub enabled: bool,
    ack_counter: u32,
}

impl Adr {
    pub fn new() -> Self {
        Adr::default()
    }

    /// Counts an uplink. No-op while ADR is disabled.
    pub fn on_uplink(&mut self) {
        if self.enabled {
            self.ack_counter += 1;
        }
    }

    /// Any accepted downlink proves the network still hears us.
    pub fn on_downlink(&mut self) {
        self.ack_counter = 0;
    }

    /// Whether the next uplink must carry the ADRACKReq bit.
    pub fn ack_requested(&self) -> bool {
        self.enabled && self.ack_counter >= ADR_ACK_LIMIT
    }

    /// Whether the device should fall back to a more robust data rate.
    pub fn needs_fallback(&self) -> bool {
        self.enabled && self.ack_counter >= ADR_ACK_LIMIT + ADR_ACK_DELAY
    }

    /// Called after stepping the data rate down; spreads further retries by
    /// rewinding the counter to the request threshold only.
    pub fn fallback_applied(&mut self) {
        self.ack_counter = ADR_ACK_LIMIT;
    }

    pub fn reset(&mut self) {
        self.ack_counter = 0;
    }

    #[cfg(test)]
    pub fn counter(&self) -> u32 {
        self.ack_counter
    }
}

/// Rolling downlink signal statistics.
#[derive(Debug, Default)]
pub(crate) struct LinkStats {
    snr: VecDeque<f32>,
    rssi: VecDeque<i16>,
}

impl LinkStats {
    pub fn new() -> Self {
        LinkStats::default()
    }

    pub fn record(&mut self, snr: f32, rssi: i16) {
        self.snr.push_back(snr);
        if self.snr.len() > STATS_WINDOW {
            self.snr.pop_front();
        }
        self.rssi.push_back(rssi);
        if self.rssi.len() > STATS_WINDOW {
            self.rssi.pop_front();
        }
    }

    pub fn average_snr(&self) -> f32 {
        if self.snr.is_empty() {
            return 0.0;
        }
        self.snr.iter().sum::<f32>() / self.snr.len() as f32
    }

    pub fn average_rssi(&self) -> i16 {
        if self.rssi.is_empty() {
            return -120;
        }
        (self.rssi.iter().map(|r| *r as i32).sum::<i32>() / self.rssi.len() as i32) as i16
    }

    pub fn clear(&mut self) {
        self.snr.clear();
        self.rssi.clear();
    }
}
