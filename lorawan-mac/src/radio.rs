//! Radio-control capability consumed by the MAC core.
//!
//! The concrete SX127x register driver (and the SPI bridge underneath it)
//! lives outside this crate; the MAC owns an injected implementation of
//! [`Radio`] and never touches the bus directly.

use crate::region::{ChannelPlan, Region};

/// SX127x IRQ flag bits as reported by [`Radio::read_irq_flags`].
pub mod irq {
    pub const RX_DONE: u8 = 0x40;
    pub const PAYLOAD_CRC_ERROR: u8 = 0x20;
    pub const VALID_HEADER: u8 = 0x10;
    pub const TX_DONE: u8 = 0x08;
    pub const RX_TIMEOUT: u8 = 0x04;
    pub const CAD_DETECTED: u8 = 0x02;
    pub const CAD_DONE: u8 = 0x01;
}

/// LNA gain register presets.
pub mod lna {
    pub const MAX_GAIN: u8 = 0x23;
    pub const HIGH_GAIN: u8 = 0x20;
    pub const MED_GAIN: u8 = 0x13;
    pub const LOW_GAIN: u8 = 0x03;
    pub const OFF: u8 = 0x00;
}

/// Sync word for public LoRaWAN networks.
pub const LORAWAN_SYNC_WORD: u8 = 0x34;

/// Operations the MAC requires from an SX127x-family radio driver.
///
/// `send` blocks until the TX-done interrupt fires or the driver gives up.
/// Receive is driven through `set_continuous_receive` plus polling of
/// `read_irq_flags`.
pub trait Radio {
    type Error: core::fmt::Debug;

    fn set_frequency(&mut self, mhz: f32) -> Result<(), Self::Error>;
    fn set_tx_power(&mut self, dbm: i8, pa_boost: bool) -> Result<(), Self::Error>;
    fn set_spreading_factor(&mut self, sf: u8) -> Result<(), Self::Error>;
    fn set_bandwidth(&mut self, khz: f32) -> Result<(), Self::Error>;
    fn set_coding_rate(&mut self, denominator: u8) -> Result<(), Self::Error>;
    fn set_preamble_length(&mut self, length: u16) -> Result<(), Self::Error>;
    fn set_sync_word(&mut self, sync_word: u8) -> Result<(), Self::Error>;
    fn set_lna(&mut self, gain: u8, boost: bool) -> Result<(), Self::Error>;
    fn set_invert_iq(&mut self, invert: bool) -> Result<(), Self::Error>;

    /// Transmits the packet, returning once the radio reports TX done.
    fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;
    fn set_continuous_receive(&mut self) -> Result<(), Self::Error>;
    fn standby(&mut self) -> Result<(), Self::Error>;
    fn sleep(&mut self) -> Result<(), Self::Error>;

    fn clear_irq_flags(&mut self) -> Result<(), Self::Error>;
    fn read_irq_flags(&mut self) -> Result<u8, Self::Error>;
    fn read_payload(&mut self) -> Result<Vec<u8>, Self::Error>;

    fn rssi(&mut self) -> Result<i16, Self::Error>;
    fn snr(&mut self) -> Result<f32, Self::Error>;

    /// Raw register access, for diagnostics and driver calibration.
    fn register_read(&mut self, addr: u8) -> Result<u8, Self::Error>;
    fn register_write(&mut self, addr: u8, value: u8) -> Result<(), Self::Error>;
}

/// Mirror of the radio's programmed transmit state.
///
/// Every radio session (uplink, RX1, RX2, continuous receive) is programmed
/// from this shadow, so it matches the hardware after each MAC operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Shadow {
    pub channel: usize,
    pub sf: u8,
    pub bw_khz: f32,
    pub cr_denom: u8,
    pub preamble: u16,
    pub sync_word: u8,
    pub power_dbm: i8,
    pub lna_gain: u8,
    pub invert_iq: bool,
}

impl Shadow {
    pub fn defaults(region: Region) -> Self {
        let plan = region.plan();
        Shadow {
            channel: 0,
            sf: 9,
            bw_khz: 125.0,
            cr_denom: 5,
            preamble: 8,
            sync_word: LORAWAN_SYNC_WORD,
            power_dbm: plan.max_eirp_dbm.min(14),
            lna_gain: lna::MAX_GAIN,
            invert_iq: false,
        }
    }

    /// The uplink data rate index currently mirrored by the shadow.
    pub fn data_rate(&self, region: Region) -> Option<u8> {
        region.dr_from_sf_bw(self.sf, self.bw_khz)
    }

    /// Programs the full transmit configuration on the given frequency.
    pub fn program<R: Radio>(&self, radio: &mut R, freq_mhz: f32) -> Result<(), R::Error> {
        radio.set_frequency(freq_mhz)?;
        radio.set_spreading_factor(self.sf)?;
        radio.set_bandwidth(self.bw_khz)?;
        radio.set_coding_rate(self.cr_denom)?;
        radio.set_preamble_length(self.preamble)?;
        radio.set_sync_word(self.sync_word)?;
        radio.set_tx_power(self.power_dbm, true)?;
        radio.set_lna(self.lna_gain, true)?;
        radio.set_invert_iq(self.invert_iq)?;
        Ok(())
    }

    /// The uplink frequency for the shadowed channel.
    pub fn frequency(&self, channels: &ChannelPlan) -> f32 {
        channels.frequency(self.channel).unwrap_or_else(|| channels.frequency(0).unwrap_or(0.0))
    }
}
