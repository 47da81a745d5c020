//! Wire formats and cryptography for LoRaWAN 1.0.x end devices.
//!
//! Three layers, each usable on its own:
//!
//! - [`keys`]: owned fixed-width identifiers and key material, hex on the
//!   external surface.
//! - [`crypto`]: AES-128/CMAC primitives, the CTR payload cipher, and
//!   session-key derivation.
//! - [`frame`] and [`commands`]: physical payloads and MAC commands as plain
//!   structs and enums; parsing splits a buffer into fields, encoding
//!   re-assembles it and applies the MIC and payload cipher.
#![no_std]
#![deny(rust_2018_idioms)]

pub mod commands;
pub mod crypto;
pub mod frame;
pub mod keys;
