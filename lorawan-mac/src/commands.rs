//! Interpretation of downlink MAC commands and collection of the uplink
//! answers to piggy-back on the next frame.

use heapless::Vec as HVec;
use log::{debug, warn};
use lorawan_codec::commands::{DownlinkCommand, DownlinkCommands, UplinkCommand};
use lorawan_codec::frame::MAX_FOPTS;

use crate::adr::Adr;
use crate::duty_cycle::DutyCycleLedger;
use crate::radio::Shadow;
use crate::region::{ChannelPlan, Region, MAX_CHANNELS};
use crate::rx_window::{RxParams, RxWindows};
use crate::Event;

/// Answers awaiting the next uplink, already serialized (CID + payload).
#[derive(Debug, Default)]
pub(crate) struct PendingResponses {
    buf: HVec<u8, MAX_FOPTS>,
}

impl PendingResponses {
    pub fn new() -> Self {
        PendingResponses::default()
    }

    /// Appends one answer; answers that no longer fit the FOpts field are
    /// dropped.
    pub fn push(&mut self, command: &UplinkCommand) -> bool {
        if !command.encode_into(&mut self.buf) {
            warn!("pending MAC answers exceed the FOpts field, dropping CID {:#04x}", command.cid());
            return false;
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Removes and returns everything queued so far.
    pub fn take(&mut self) -> HVec<u8, MAX_FOPTS> {
        core::mem::take(&mut self.buf)
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Mutable slices of MAC state a batch of downlink commands may touch.
pub(crate) struct Downstream<'a> {
    pub region: Region,
    pub shadow: &'a mut Shadow,
    pub channels: &'a mut ChannelPlan,
    pub windows: &'a mut RxWindows,
    pub rx_params: &'a mut RxParams,
    pub ledger: &'a mut DutyCycleLedger,
    pub adr: &'a mut Adr,
    pub nb_rep: &'a mut u8,
    /// Average downlink SNR, reported by DevStatusAns.
    pub snr: f32,
    /// Battery level byte, reported by DevStatusAns.
    pub battery: u8,
}

/// Processes the commands in order, mutating the MAC state and queueing
/// answers. Decoding stops at the first unknown CID (the codec iterator ends
/// there), keeping the answers accrued so far.
pub(crate) fn handle_downlink_commands(
    commands: DownlinkCommands<'_>,
    ctx: &mut Downstream<'_>,
    pending: &mut PendingResponses,
) -> Vec<Event> {
    let mut events = Vec::new();

    for command in commands {
        match command {
            DownlinkCommand::LinkCheckAns { margin, gateway_count } => {
                debug!("LinkCheckAns: margin {margin} dB, {gateway_count} gateway(s)");
                events.push(Event::LinkCheck { margin, gateway_count });
            }
            DownlinkCommand::LinkAdrReq {
                data_rate,
                tx_power,
                channel_mask,
                ch_mask_cntl,
                nb_trans,
            } => {
                let ans =
                    handle_link_adr(data_rate, tx_power, channel_mask, ch_mask_cntl, nb_trans, ctx);
                pending.push(&ans);
            }
            DownlinkCommand::DutyCycleReq { max_duty_cycle } => {
                let cap = 1.0 / (1u32 << max_duty_cycle) as f32;
                debug!("DutyCycleReq: cap {cap}");
                ctx.ledger.set_network_cap(cap);
                pending.push(&UplinkCommand::DutyCycleAns);
            }
            DownlinkCommand::RxParamSetupReq { rx1_dr_offset, rx2_data_rate, frequency_hz } => {
                let ans = handle_rx_param_setup(rx1_dr_offset, rx2_data_rate, frequency_hz, ctx);
                pending.push(&ans);
            }
            DownlinkCommand::DevStatusReq => {
                let margin = ctx.snr.round() as i8;
                debug!("DevStatusReq: battery {}, margin {margin}", ctx.battery);
                pending.push(&UplinkCommand::DevStatusAns { battery: ctx.battery, margin });
            }
            DownlinkCommand::NewChannelReq {
                channel_index,
                frequency_hz,
                min_data_rate,
                max_data_rate,
            } => {
                let ans =
                    handle_new_channel(channel_index, frequency_hz, min_data_rate, max_data_rate, ctx);
                pending.push(&ans);
            }
            DownlinkCommand::RxTimingSetupReq { delay } => {
                ctx.windows.rx1_delay_ms = if delay == 0 { 1000 } else { delay as u64 * 1000 };
                debug!("RxTimingSetupReq: RECEIVE_DELAY1 = {} ms", ctx.windows.rx1_delay_ms);
                pending.push(&UplinkCommand::RxTimingSetupAns);
            }
        }
    }

    events
}

/// Validates the three LinkAdrReq aspects and commits them atomically: a
/// single failing aspect leaves every current setting untouched.
fn handle_link_adr(
    data_rate: u8,
    tx_power: u8,
    channel_mask: u16,
    ch_mask_cntl: u8,
    nb_trans: u8,
    ctx: &mut Downstream<'_>,
) -> UplinkCommand {
    let sf_bw = ctx.region.dr_to_sf_bw(data_rate);
    let dbm = ctx.region.tx_power_dbm(tx_power);
    let resolved = ctx.channels.resolve_mask(ch_mask_cntl, channel_mask);

    debug!(
        "LinkAdrReq: DR{data_rate} TXPower {tx_power} ChMask {channel_mask:#06x} \
         Cntl {ch_mask_cntl} NbTrans {nb_trans}"
    );

    if let (Some((sf, bw)), Some(dbm), Some(mask)) = (sf_bw, dbm, resolved) {
        ctx.shadow.sf = sf;
        ctx.shadow.bw_khz = bw;
        ctx.shadow.power_dbm = dbm;
        ctx.channels.apply_mask(mask);
        *ctx.nb_rep = nb_trans.clamp(1, 15);
        ctx.adr.on_downlink();
        debug!("LinkAdrReq applied: SF{sf} BW{bw} kHz {dbm} dBm NbTrans {}", *ctx.nb_rep);
    } else {
        debug!("LinkAdrReq rejected, nothing committed");
    }

    UplinkCommand::LinkAdrAns {
        channel_mask_ack: resolved.is_some(),
        data_rate_ack: sf_bw.is_some(),
        power_ack: dbm.is_some(),
    }
}

fn handle_rx_param_setup(
    rx1_dr_offset: u8,
    rx2_data_rate: u8,
    frequency_hz: u32,
    ctx: &mut Downstream<'_>,
) -> UplinkCommand {
    let freq_mhz = frequency_hz as f32 / 1_000_000.0;

    let offset_ok = rx1_dr_offset <= 5;
    let dr_ok = ctx.region.dr_to_sf_bw(rx2_data_rate).is_some();
    let channel_ok = (100.0..1000.0).contains(&freq_mhz);

    if offset_ok && dr_ok && channel_ok {
        ctx.rx_params.rx1_dr_offset = rx1_dr_offset;
        ctx.rx_params.rx2_data_rate = Some(rx2_data_rate);
        ctx.rx_params.rx2_frequency_mhz = freq_mhz;
        debug!("RxParamSetupReq applied: offset {rx1_dr_offset}, RX2 DR{rx2_data_rate} at {freq_mhz} MHz");
    } else {
        debug!("RxParamSetupReq rejected: offset {rx1_dr_offset}, RX2 DR{rx2_data_rate} at {freq_mhz} MHz");
    }

    UplinkCommand::RxParamSetupAns {
        channel_ack: channel_ok,
        rx2_data_rate_ack: dr_ok,
        rx1_dr_offset_ack: offset_ok,
    }
}

fn handle_new_channel(
    channel_index: u8,
    frequency_hz: u32,
    min_data_rate: u8,
    max_data_rate: u8,
    ctx: &mut Downstream<'_>,
) -> UplinkCommand {
    let index = channel_index as usize;
    let freq_mhz = frequency_hz as f32 / 1_000_000.0;

    // frequency 0 disables the channel
    let freq_ok = index < MAX_CHANNELS && (frequency_hz == 0 || (100.0..1000.0).contains(&freq_mhz));
    let range_ok =
        min_data_rate <= max_data_rate && ctx.region.dr_to_sf_bw(max_data_rate).is_some();

    if freq_ok && range_ok {
        ctx.channels.set_frequency(index, if frequency_hz == 0 { 0.0 } else { freq_mhz });
        debug!("NewChannelReq: channel {index} -> {freq_mhz} MHz");
    } else {
        debug!("NewChannelReq rejected for channel {index}");
    }

    UplinkCommand::NewChannelAns { channel_freq_ack: freq_ok, data_rate_range_ack: range_ok }
}
