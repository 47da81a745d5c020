//! Host-side LoRaWAN 1.0.x Class A/C MAC for SX127x-family radios.
//!
//! The MAC owns an injected [`radio::Radio`] capability (the register driver
//! and its SPI transport live elsewhere) and drives the full end-device
//! protocol: OTAA/ABP activation, frame building and parsing through
//! [`lorawan_codec`], millisecond-scheduled RX1/RX2 windows, per-channel
//! duty-cycle accounting, MAC-command handling with ADR, confirmed-uplink
//! retries, and a JSON session file that survives restarts.
//!
//! # Example
//! ```no_run
//! use lorawan_mac::{JoinMode, MacDevice, Prng, Region};
//! # struct MyRadio;
//! # impl lorawan_mac::Radio for MyRadio {
//! #     type Error = ();
//! #     fn set_frequency(&mut self, _: f32) -> Result<(), ()> { Ok(()) }
//! #     fn set_tx_power(&mut self, _: i8, _: bool) -> Result<(), ()> { Ok(()) }
//! #     fn set_spreading_factor(&mut self, _: u8) -> Result<(), ()> { Ok(()) }
//! #     fn set_bandwidth(&mut self, _: f32) -> Result<(), ()> { Ok(()) }
//! #     fn set_coding_rate(&mut self, _: u8) -> Result<(), ()> { Ok(()) }
//! #     fn set_preamble_length(&mut self, _: u16) -> Result<(), ()> { Ok(()) }
//! #     fn set_sync_word(&mut self, _: u8) -> Result<(), ()> { Ok(()) }
//! #     fn set_lna(&mut self, _: u8, _: bool) -> Result<(), ()> { Ok(()) }
//! #     fn set_invert_iq(&mut self, _: bool) -> Result<(), ()> { Ok(()) }
//! #     fn send(&mut self, _: &[u8]) -> Result<(), ()> { Ok(()) }
//! #     fn set_continuous_receive(&mut self) -> Result<(), ()> { Ok(()) }
//! #     fn standby(&mut self) -> Result<(), ()> { Ok(()) }
//! #     fn sleep(&mut self) -> Result<(), ()> { Ok(()) }
//! #     fn clear_irq_flags(&mut self) -> Result<(), ()> { Ok(()) }
//! #     fn read_irq_flags(&mut self) -> Result<u8, ()> { Ok(0) }
//! #     fn read_payload(&mut self) -> Result<Vec<u8>, ()> { Ok(vec![]) }
//! #     fn rssi(&mut self) -> Result<i16, ()> { Ok(-90) }
//! #     fn snr(&mut self) -> Result<f32, ()> { Ok(7.0) }
//! #     fn register_read(&mut self, _: u8) -> Result<u8, ()> { Ok(0) }
//! #     fn register_write(&mut self, _: u8, _: u8) -> Result<(), ()> { Ok(()) }
//! # }
//! # fn radio() -> MyRadio { MyRadio }
//! let mut device = MacDevice::new(radio(), Prng::from_system_time(), Region::EU868);
//! device.init().unwrap();
//! device.set_dev_eui("0004A30B001C0530").unwrap();
//! device.set_app_eui("70B3D57ED00201A6").unwrap();
//! device.set_app_key("8D7F3B4C5A6B7C8D9E0F1A2B3C4D5E6F").unwrap();
//! device.join(JoinMode::Otaa, 20_000).unwrap();
//! device.send(b"hello", 1, false, false).unwrap();
//! loop {
//!     device.update().unwrap();
//!     std::thread::sleep(std::time::Duration::from_millis(50));
//! }
//! ```

mod adr;
mod commands;
pub mod confirm;
mod device;
pub mod duty_cycle;
pub mod radio;
pub mod region;
mod rng;
pub mod rx_window;
pub mod session;

pub use confirm::ConfirmState;
pub use device::{Error, MacDevice};
pub use duty_cycle::Verdict;
pub use radio::Radio;
pub use region::Region;
pub use rng::{Prng, RngCore};
pub use rx_window::RxState;
pub use session::{Session, SessionStore};

pub use lorawan_codec as codec;

/// A decoded application downlink (or a payload handed to `send`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub payload: Vec<u8>,
    pub port: u8,
    pub confirmed: bool,
}

/// LoRaWAN device classes supported by this MAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    /// Receive windows only after an uplink.
    ClassA,
    /// Continuous reception on the RX2 parameters between windows.
    ClassC,
}

/// Network activation flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// Over-the-air activation through a Join-Request exchange.
    Otaa,
    /// Activation by personalization with preloaded session keys.
    Abp,
}

/// Asynchronous notifications surfaced by [`MacDevice::take_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Answer to a LinkCheckReq: demodulation margin in dB and the number of
    /// gateways that heard the request.
    LinkCheck { margin: u8, gateway_count: u8 },
    /// A confirmed uplink was abandoned after the retry budget ran out.
    NotConfirmed,
}
