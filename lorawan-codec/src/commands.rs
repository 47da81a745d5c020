//! MAC commands (CID 0x02..=0x08) as plain values.
//!
//! Downlink requests decode into field structs; the answers a device sends
//! back serialize straight into the FOpts buffer. One CID means different
//! things per direction, so the two sides get separate enums.

use heapless::Vec;

use crate::frame::frequency_hz;

/// Commands the network sends to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownlinkCommand {
    LinkCheckAns {
        margin: u8,
        gateway_count: u8,
    },
    LinkAdrReq {
        data_rate: u8,
        tx_power: u8,
        channel_mask: u16,
        ch_mask_cntl: u8,
        nb_trans: u8,
    },
    DutyCycleReq {
        max_duty_cycle: u8,
    },
    RxParamSetupReq {
        rx1_dr_offset: u8,
        rx2_data_rate: u8,
        frequency_hz: u32,
    },
    DevStatusReq,
    NewChannelReq {
        channel_index: u8,
        frequency_hz: u32,
        min_data_rate: u8,
        max_data_rate: u8,
    },
    RxTimingSetupReq {
        delay: u8,
    },
}

/// Payload length of a downlink command, by CID.
fn downlink_payload_len(cid: u8) -> Option<usize> {
    match cid {
        0x02 => Some(2), // LinkCheckAns
        0x03 => Some(4), // LinkAdrReq
        0x04 => Some(1), // DutyCycleReq
        0x05 => Some(4), // RxParamSetupReq
        0x06 => Some(0), // DevStatusReq
        0x07 => Some(5), // NewChannelReq
        0x08 => Some(1), // RxTimingSetupReq
        _ => None,
    }
}

fn decode_downlink(cid: u8, payload: &[u8]) -> DownlinkCommand {
    match cid {
        0x02 => DownlinkCommand::LinkCheckAns { margin: payload[0], gateway_count: payload[1] },
        0x03 => DownlinkCommand::LinkAdrReq {
            data_rate: payload[0] >> 4,
            tx_power: payload[0] & 0x0f,
            channel_mask: u16::from_le_bytes([payload[1], payload[2]]),
            ch_mask_cntl: (payload[3] >> 4) & 0x07,
            nb_trans: payload[3] & 0x0f,
        },
        0x04 => DownlinkCommand::DutyCycleReq { max_duty_cycle: payload[0] & 0x0f },
        0x05 => DownlinkCommand::RxParamSetupReq {
            rx1_dr_offset: (payload[0] >> 4) & 0x07,
            rx2_data_rate: payload[0] & 0x0f,
            frequency_hz: frequency_hz(&payload[1..4]),
        },
        0x06 => DownlinkCommand::DevStatusReq,
        0x07 => DownlinkCommand::NewChannelReq {
            channel_index: payload[0],
            frequency_hz: frequency_hz(&payload[1..4]),
            min_data_rate: payload[4] & 0x0f,
            max_data_rate: payload[4] >> 4,
        },
        // downlink_payload_len admits nothing else
        _ => DownlinkCommand::RxTimingSetupReq { delay: payload[0] & 0x0f },
    }
}

/// Iterator over the downlink commands in an FOpts field or a port-0
/// FRMPayload.
///
/// Stops at the first unknown CID or truncated command; everything decoded
/// up to that point stays valid.
pub struct DownlinkCommands<'a> {
    rest: &'a [u8],
}

/// Begins decoding a downlink command sequence.
pub fn parse_downlink_commands(bytes: &[u8]) -> DownlinkCommands<'_> {
    DownlinkCommands { rest: bytes }
}

impl Iterator for DownlinkCommands<'_> {
    type Item = DownlinkCommand;

    fn next(&mut self) -> Option<DownlinkCommand> {
        let (&cid, payload) = self.rest.split_first()?;
        let len = match downlink_payload_len(cid) {
            Some(len) if len <= payload.len() => len,
            _ => {
                self.rest = &[];
                return None;
            }
        };
        let command = decode_downlink(cid, &payload[..len]);
        self.rest = &payload[len..];
        Some(command)
    }
}

/// Commands the device sends to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkCommand {
    LinkCheckReq,
    LinkAdrAns {
        channel_mask_ack: bool,
        data_rate_ack: bool,
        power_ack: bool,
    },
    DutyCycleAns,
    RxParamSetupAns {
        channel_ack: bool,
        rx2_data_rate_ack: bool,
        rx1_dr_offset_ack: bool,
    },
    DevStatusAns {
        battery: u8,
        /// Demodulation margin in dB; clamped to the 6-bit signed range
        /// [-32, 31] on the wire.
        margin: i8,
    },
    NewChannelAns {
        channel_freq_ack: bool,
        data_rate_range_ack: bool,
    },
    RxTimingSetupAns,
}

impl UplinkCommand {
    pub fn cid(&self) -> u8 {
        match self {
            UplinkCommand::LinkCheckReq => 0x02,
            UplinkCommand::LinkAdrAns { .. } => 0x03,
            UplinkCommand::DutyCycleAns => 0x04,
            UplinkCommand::RxParamSetupAns { .. } => 0x05,
            UplinkCommand::DevStatusAns { .. } => 0x06,
            UplinkCommand::NewChannelAns { .. } => 0x07,
            UplinkCommand::RxTimingSetupAns => 0x08,
        }
    }

    /// Serialized size including the CID byte.
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            UplinkCommand::LinkAdrAns { .. }
            | UplinkCommand::RxParamSetupAns { .. }
            | UplinkCommand::NewChannelAns { .. } => 1,
            UplinkCommand::DevStatusAns { .. } => 2,
            _ => 0,
        }
    }

    /// Appends CID and payload to an answer buffer; false when the command
    /// no longer fits.
    pub fn encode_into<const N: usize>(&self, out: &mut Vec<u8, N>) -> bool {
        if out.len() + self.encoded_len() > N {
            return false;
        }
        out.push(self.cid()).unwrap();
        match *self {
            UplinkCommand::LinkAdrAns { channel_mask_ack, data_rate_ack, power_ack } => {
                out.push(status_bits(channel_mask_ack, data_rate_ack, power_ack)).unwrap();
            }
            UplinkCommand::RxParamSetupAns {
                channel_ack,
                rx2_data_rate_ack,
                rx1_dr_offset_ack,
            } => {
                out.push(status_bits(channel_ack, rx2_data_rate_ack, rx1_dr_offset_ack)).unwrap();
            }
            UplinkCommand::DevStatusAns { battery, margin } => {
                out.push(battery).unwrap();
                out.push((margin.clamp(-32, 31) as u8) & 0x3f).unwrap();
            }
            UplinkCommand::NewChannelAns { channel_freq_ack, data_rate_range_ack } => {
                out.push(status_bits(channel_freq_ack, data_rate_range_ack, false)).unwrap();
            }
            UplinkCommand::LinkCheckReq
            | UplinkCommand::DutyCycleAns
            | UplinkCommand::RxTimingSetupAns => {}
        }
        true
    }
}

fn status_bits(bit0: bool, bit1: bool, bit2: bool) -> u8 {
    u8::from(bit0) | (u8::from(bit1) << 1) | (u8::from(bit2) << 2)
}
