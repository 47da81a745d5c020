//! Per-channel air-time accounting against the 1 % regulatory duty cycle.

use std::time::Instant;

use crate::region::MAX_CHANNELS;

/// Regulatory per-channel duty cycle for EU-style sub-bands.
const REGULATORY_CAP: f32 = 0.01;

/// One hour, after which a channel's air-time ledger decays to zero.
const DECAY_MS: u64 = 3_600_000;

/// Air-time budget per channel and hour at the 1 % cap, in milliseconds.
const BUDGET_MS_PER_HOUR: f32 = 36_000.0;

/// Outcome of a duty-cycle check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    /// Milliseconds to wait before the channel may be used again.
    Wait(u64),
}

/// Computes the LoRa time-on-air in milliseconds for a MAC payload of
/// `payload_len` bytes (13 bytes of LoRaWAN framing overhead are added).
///
/// T_sym = 2^SF / BW; n_payload = 8 + max(ceil((8*(len+13) - 4*SF + 28 + 16)
/// / (4*SF)) * CR, 0) with CR the coding-rate denominator.
pub fn time_on_air_ms(
    payload_len: usize,
    sf: u8,
    bw_khz: f32,
    cr_denom: u8,
    preamble_symbols: u16,
) -> f32 {
    let bw_hz = bw_khz * 1000.0;
    let t_sym_s = (1u32 << sf) as f32 / bw_hz;
    let n_preamble = preamble_symbols as f32 + 4.25;

    let packet_bits = 8.0 * (payload_len as f32 + 13.0);
    let numerator = packet_bits - 4.0 * sf as f32 + 28.0 + 16.0;
    let n_payload = 8.0 + ((numerator / (4.0 * sf as f32)).ceil() * cr_denom as f32).max(0.0);

    (n_preamble + n_payload) * t_sym_s * 1000.0
}

#[derive(Debug, Clone, Copy)]
struct ChannelUsage {
    last_use: Option<Instant>,
    airtime_ms: f32,
}

/// Tracks recent air time per channel and derives the mandatory TX gap.
#[derive(Debug)]
pub struct DutyCycleLedger {
    channels: [ChannelUsage; MAX_CHANNELS],
    network_cap: f32,
}

impl Default for DutyCycleLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl DutyCycleLedger {
    pub fn new() -> Self {
        DutyCycleLedger {
            channels: [ChannelUsage { last_use: None, airtime_ms: 0.0 }; MAX_CHANNELS],
            network_cap: 1.0,
        }
    }

    /// Applies a DutyCycleReq aggregate cap of `1 / 2^max_duty_cycle`.
    pub fn set_network_cap(&mut self, cap: f32) {
        self.network_cap = cap.clamp(0.0, 1.0);
    }

    /// The effective duty cycle: the regulatory 1 % or a stricter
    /// network-imposed cap.
    pub fn cap(&self) -> f32 {
        REGULATORY_CAP.min(self.network_cap)
    }

    /// Checks whether a transmission of `airtime_ms` may start now on the
    /// given channel. The required gap after the previous transmission is
    /// `airtime / cap - airtime`.
    pub fn check(&self, channel: usize, airtime_ms: f32, now: Instant) -> Verdict {
        let Some(usage) = self.channels.get(channel) else {
            return Verdict::Allowed;
        };
        let Some(last_use) = usage.last_use else {
            return Verdict::Allowed;
        };
        let elapsed_ms = now.duration_since(last_use).as_millis() as f32;
        let required_gap_ms = airtime_ms / self.cap() - airtime_ms;
        if elapsed_ms >= required_gap_ms {
            Verdict::Allowed
        } else {
            Verdict::Wait((required_gap_ms - elapsed_ms).ceil() as u64)
        }
    }

    /// Records a completed transmission on the channel.
    pub fn record(&mut self, channel: usize, airtime_ms: f32, now: Instant) {
        let Some(usage) = self.channels.get_mut(channel) else {
            return;
        };
        if let Some(last_use) = usage.last_use {
            if now.duration_since(last_use).as_millis() as u64 > DECAY_MS {
                usage.airtime_ms = 0.0;
            }
        }
        usage.airtime_ms += airtime_ms;
        usage.last_use = Some(now);
    }

    /// Percentage of the hourly 1 % budget consumed on the channel.
    pub fn usage(&self, channel: usize, now: Instant) -> f32 {
        let Some(usage) = self.channels.get(channel) else {
            return 0.0;
        };
        let Some(last_use) = usage.last_use else {
            return 0.0;
        };
        if now.duration_since(last_use).as_millis() as u64 > DECAY_MS {
            return 0.0;
        }
        usage.airtime_ms / BUDGET_MS_PER_HOUR * 100.0
    }

    /// Clears all accumulated air time.
    pub fn reset(&mut self) {
        self.channels = [ChannelUsage { last_use: None, airtime_ms: 0.0 }; MAX_CHANNELS];
    }
}
