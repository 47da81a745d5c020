//! LoRaWAN 1.0.x physical payloads as owned message structs.
//!
//! Frames parse into plain fields and serialize back through a single
//! canonical layout, so MIC verification re-serializes instead of holding on
//! to the receive buffer. FRMPayload stays encrypted inside a parsed
//! [`DataFrame`] until [`DataFrame::decrypt_payload`] is asked for it.

use heapless::Vec;

use crate::crypto::{self, Direction, BLOCK_LEN};
use crate::keys::{AppKey, AppSKey, DevAddr, Eui, Mic, NwkSKey};

/// Largest physical payload the radio will hand us.
pub const MAX_PHY_PAYLOAD: usize = 255;

/// Largest FRMPayload that fits a physical payload.
pub const MAX_FRM_PAYLOAD: usize = 242;

/// FOpts field limit.
pub const MAX_FOPTS: usize = 15;

/// Message types carried in the MHDR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MType {
    JoinRequest,
    JoinAccept,
    UnconfirmedUp,
    UnconfirmedDown,
    ConfirmedUp,
    ConfirmedDown,
}

impl MType {
    /// Decodes an MHDR byte. The RFU bits and the major version must be
    /// zero, everything else is rejected.
    pub fn from_mhdr(mhdr: u8) -> Option<MType> {
        if mhdr & 0x1f != 0 {
            return None;
        }
        match mhdr >> 5 {
            0 => Some(MType::JoinRequest),
            1 => Some(MType::JoinAccept),
            2 => Some(MType::UnconfirmedUp),
            3 => Some(MType::UnconfirmedDown),
            4 => Some(MType::ConfirmedUp),
            5 => Some(MType::ConfirmedDown),
            _ => None,
        }
    }

    /// The MHDR byte for this message type (LoRaWAN R1).
    pub fn mhdr(self) -> u8 {
        let mtype = match self {
            MType::JoinRequest => 0,
            MType::JoinAccept => 1,
            MType::UnconfirmedUp => 2,
            MType::UnconfirmedDown => 3,
            MType::ConfirmedUp => 4,
            MType::ConfirmedDown => 5,
        };
        mtype << 5
    }

    pub fn is_uplink(self) -> bool {
        matches!(self, MType::JoinRequest | MType::UnconfirmedUp | MType::ConfirmedUp)
    }

    pub fn is_confirmed(self) -> bool {
        matches!(self, MType::ConfirmedUp | MType::ConfirmedDown)
    }

    pub fn direction(self) -> Direction {
        if self.is_uplink() {
            Direction::Uplink
        } else {
            Direction::Downlink
        }
    }
}

/// Reasons a received buffer is not an acceptable frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Shorter than the smallest frame of the expected kind.
    TooShort,
    /// Longer than a physical payload can be.
    TooLong,
    /// Unknown message type, RFU bits set, or unsupported major version.
    BadMhdr,
    /// The message integrity code did not verify.
    BadMic,
    /// The frame addresses a different device.
    WrongDevAddr,
}

/// Reasons a frame under construction cannot be serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// A non-empty FRMPayload requires an FPort.
    MissingPort,
    /// Header, FOpts, payload and MIC together exceed the physical payload.
    PayloadTooLong,
}

/// A join request: the credentials identify the device, the nonce makes the
/// exchange unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinRequest {
    pub app_eui: Eui,
    pub dev_eui: Eui,
    pub dev_nonce: u16,
}

impl JoinRequest {
    /// Serializes the 23-byte request: both EUIs and the nonce go out
    /// little-endian, the MIC is a plain CMAC under the AppKey.
    pub fn encode(&self, app_key: &AppKey) -> Vec<u8, 23> {
        let mut out: Vec<u8, 23> = Vec::new();
        out.push(MType::JoinRequest.mhdr()).unwrap();
        out.extend_from_slice(&self.app_eui.to_wire()).unwrap();
        out.extend_from_slice(&self.dev_eui.to_wire()).unwrap();
        out.extend_from_slice(&self.dev_nonce.to_le_bytes()).unwrap();

        let mic = crypto::join_mic(&app_key.0, &out);
        out.extend_from_slice(mic.as_bytes()).unwrap();
        out
    }
}

/// A decrypted join accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinAccept {
    pub app_nonce: [u8; 3],
    pub net_id: [u8; 3],
    pub dev_addr: DevAddr,
    pub rx1_dr_offset: u8,
    pub rx2_data_rate: u8,
    /// RxDelay field, seconds; 0 means the 1 s default.
    pub rx_delay: u8,
    /// Additional channel frequencies in Hz, when the accept carries a
    /// dynamic-channel CFList.
    pub cf_list: Option<[u32; 5]>,
}

impl JoinAccept {
    /// Decrypts and verifies a received join accept.
    ///
    /// The network encrypts with the AES *decrypt* primitive, so the device
    /// recovers the plaintext by block-encrypting everything after the
    /// cleartext MHDR. A MIC mismatch yields [`DecodeError::BadMic`] and no
    /// fields.
    pub fn decrypt(bytes: &[u8], app_key: &AppKey) -> Result<JoinAccept, DecodeError> {
        if bytes.len() != 17 && bytes.len() != 33 {
            return Err(DecodeError::TooShort);
        }
        if MType::from_mhdr(bytes[0]) != Some(MType::JoinAccept) {
            return Err(DecodeError::BadMhdr);
        }

        let mut buf: Vec<u8, 33> = Vec::from_slice(bytes).unwrap();
        for block in buf[1..].chunks_exact_mut(BLOCK_LEN) {
            // size asserted by chunks_exact_mut
            let block: &mut [u8; BLOCK_LEN] = block.try_into().unwrap();
            crypto::aes128_encrypt(&app_key.0, block);
        }

        let mic_start = buf.len() - 4;
        let expected = crypto::join_mic(&app_key.0, &buf[..mic_start]);
        if expected.as_bytes() != &buf[mic_start..] {
            return Err(DecodeError::BadMic);
        }

        let mut app_nonce = [0u8; 3];
        app_nonce.copy_from_slice(&buf[1..4]);
        let mut net_id = [0u8; 3];
        net_id.copy_from_slice(&buf[4..7]);

        let dl_settings = buf[11];
        let cf_list = if buf.len() == 33 && buf[28] == 0 {
            let mut frequencies = [0u32; 5];
            for (i, freq) in frequencies.iter_mut().enumerate() {
                *freq = frequency_hz(&buf[13 + 3 * i..16 + 3 * i]);
            }
            Some(frequencies)
        } else {
            None
        };

        Ok(JoinAccept {
            app_nonce,
            net_id,
            dev_addr: DevAddr::from_wire(&buf[7..11]),
            rx1_dr_offset: (dl_settings >> 4) & 0x07,
            rx2_data_rate: dl_settings & 0x0f,
            rx_delay: buf[12] & 0x0f,
            cf_list,
        })
    }

    /// Serializes and encrypts the accept the way a network server would.
    /// The MAC only needs this from its test fixtures.
    pub fn encode(&self, app_key: &AppKey) -> Vec<u8, 33> {
        let mut out: Vec<u8, 33> = Vec::new();
        out.push(MType::JoinAccept.mhdr()).unwrap();
        out.extend_from_slice(&self.app_nonce).unwrap();
        out.extend_from_slice(&self.net_id).unwrap();
        out.extend_from_slice(self.dev_addr.as_bytes()).unwrap();
        out.push(((self.rx1_dr_offset & 0x07) << 4) | (self.rx2_data_rate & 0x0f)).unwrap();
        out.push(self.rx_delay & 0x0f).unwrap();
        if let Some(frequencies) = &self.cf_list {
            for freq in frequencies {
                let units = freq / 100;
                out.push(units as u8).unwrap();
                out.push((units >> 8) as u8).unwrap();
                out.push((units >> 16) as u8).unwrap();
            }
            out.push(0).unwrap(); // CFListType: dynamic channels
        }

        let mic = crypto::join_mic(&app_key.0, &out);
        out.extend_from_slice(mic.as_bytes()).unwrap();

        for block in out[1..].chunks_exact_mut(BLOCK_LEN) {
            let block: &mut [u8; BLOCK_LEN] = block.try_into().unwrap();
            crypto::aes128_decrypt(&app_key.0, block);
        }
        out
    }
}

/// A data frame, confirmed or not, in either direction.
///
/// All header fields are plain values; `frm_payload` holds ciphertext for a
/// parsed frame and plaintext for a frame being assembled. `fcnt` is the
/// full 32-bit counter: [`parse`](DataFrame::parse) fills in the 16 on-air
/// bits and the caller may widen it before verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub mtype: MType,
    pub dev_addr: DevAddr,
    pub adr: bool,
    pub adr_ack_req: bool,
    pub ack: bool,
    pub frame_pending: bool,
    pub fcnt: u32,
    pub fport: Option<u8>,
    pub fopts: Vec<u8, MAX_FOPTS>,
    pub frm_payload: Vec<u8, MAX_FRM_PAYLOAD>,
    pub mic: Mic,
}

impl DataFrame {
    /// A blank uplink frame for the given device.
    pub fn uplink(confirmed: bool, dev_addr: DevAddr) -> Self {
        Self::blank(if confirmed { MType::ConfirmedUp } else { MType::UnconfirmedUp }, dev_addr)
    }

    /// A blank downlink frame for the given device.
    pub fn downlink(confirmed: bool, dev_addr: DevAddr) -> Self {
        Self::blank(
            if confirmed { MType::ConfirmedDown } else { MType::UnconfirmedDown },
            dev_addr,
        )
    }

    fn blank(mtype: MType, dev_addr: DevAddr) -> Self {
        DataFrame {
            mtype,
            dev_addr,
            adr: false,
            adr_ack_req: false,
            ack: false,
            frame_pending: false,
            fcnt: 0,
            fport: None,
            fopts: Vec::new(),
            frm_payload: Vec::new(),
            mic: Mic::default(),
        }
    }

    fn fctrl_byte(&self) -> u8 {
        let mut fctrl = self.fopts.len() as u8;
        if self.adr {
            fctrl |= 0x80;
        }
        if self.adr_ack_req {
            fctrl |= 0x40;
        }
        if self.ack {
            fctrl |= 0x20;
        }
        if self.frame_pending {
            fctrl |= 0x10;
        }
        fctrl
    }

    pub fn direction(&self) -> Direction {
        self.mtype.direction()
    }

    /// Splits a received buffer into its fields. The FRMPayload is kept
    /// encrypted and the MIC unchecked; see [`verify`](DataFrame::verify).
    pub fn parse(bytes: &[u8]) -> Result<DataFrame, DecodeError> {
        // MHDR + DevAddr + FCtrl + FCnt + MIC is the shortest data frame
        if bytes.len() < 12 {
            return Err(DecodeError::TooShort);
        }
        if bytes.len() > MAX_PHY_PAYLOAD {
            return Err(DecodeError::TooLong);
        }
        let mtype = MType::from_mhdr(bytes[0]).ok_or(DecodeError::BadMhdr)?;
        if matches!(mtype, MType::JoinRequest | MType::JoinAccept) {
            return Err(DecodeError::BadMhdr);
        }

        let fctrl = bytes[5];
        let fopts_len = (fctrl & 0x0f) as usize;
        let fhdr_end = 8 + fopts_len;
        if fhdr_end + 4 > bytes.len() {
            return Err(DecodeError::TooShort);
        }

        let mic_start = bytes.len() - 4;
        let body = &bytes[fhdr_end..mic_start];
        let (fport, frm_payload) = match body.split_first() {
            Some((&port, cipher)) => (Some(port), Vec::from_slice(cipher).unwrap()),
            None => (None, Vec::new()),
        };

        let mut mic = [0u8; 4];
        mic.copy_from_slice(&bytes[mic_start..]);

        Ok(DataFrame {
            mtype,
            dev_addr: DevAddr::from_wire(&bytes[1..5]),
            adr: fctrl & 0x80 != 0,
            adr_ack_req: fctrl & 0x40 != 0,
            ack: fctrl & 0x20 != 0,
            frame_pending: fctrl & 0x10 != 0,
            fcnt: u16::from_le_bytes([bytes[6], bytes[7]]) as u32,
            fport,
            fopts: Vec::from_slice(&bytes[8..fhdr_end]).unwrap(),
            frm_payload,
            mic: Mic(mic),
        })
    }

    /// Canonical layout without the MIC. Parsing and serializing are exact
    /// inverses, which is what lets the MIC be recomputed from the fields.
    fn serialize_without_mic(&self) -> Result<Vec<u8, MAX_PHY_PAYLOAD>, EncodeError> {
        if !self.frm_payload.is_empty() && self.fport.is_none() {
            return Err(EncodeError::MissingPort);
        }
        let port_len = usize::from(self.fport.is_some());
        if 8 + self.fopts.len() + port_len + self.frm_payload.len() + 4 > MAX_PHY_PAYLOAD {
            return Err(EncodeError::PayloadTooLong);
        }

        let mut out: Vec<u8, MAX_PHY_PAYLOAD> = Vec::new();
        out.push(self.mtype.mhdr()).unwrap();
        out.extend_from_slice(self.dev_addr.as_bytes()).unwrap();
        out.push(self.fctrl_byte()).unwrap();
        out.extend_from_slice(&(self.fcnt as u16).to_le_bytes()).unwrap();
        out.extend_from_slice(&self.fopts).unwrap();
        if let Some(port) = self.fport {
            out.push(port).unwrap();
        }
        out.extend_from_slice(&self.frm_payload).unwrap();
        Ok(out)
    }

    /// Encrypts the payload, serializes the frame and appends the MIC.
    ///
    /// FPort 0 selects the network session key for the payload cipher,
    /// anything else the application session key; the MIC is always under
    /// the network session key.
    pub fn encode(
        &self,
        nwk_skey: &NwkSKey,
        app_skey: &AppSKey,
    ) -> Result<Vec<u8, MAX_PHY_PAYLOAD>, EncodeError> {
        let mut cipher = self.clone();
        let key = if self.fport == Some(0) { &nwk_skey.0 } else { &app_skey.0 };
        crypto::ctr_xor(key, self.direction(), &self.dev_addr, self.fcnt, &mut cipher.frm_payload);

        let mut out = cipher.serialize_without_mic()?;
        let mic =
            crypto::data_mic(&nwk_skey.0, self.direction(), &self.dev_addr, self.fcnt, &out);
        out.extend_from_slice(mic.as_bytes()).unwrap();
        Ok(out)
    }

    /// Address and integrity check of a parsed frame.
    pub fn verify(&self, dev_addr: &DevAddr, nwk_skey: &NwkSKey) -> Result<(), DecodeError> {
        if self.dev_addr != *dev_addr {
            return Err(DecodeError::WrongDevAddr);
        }
        if !self.verify_mic(nwk_skey) {
            return Err(DecodeError::BadMic);
        }
        Ok(())
    }

    /// Recomputes the data MIC over the re-serialized frame and compares it
    /// with the received one.
    pub fn verify_mic(&self, nwk_skey: &NwkSKey) -> bool {
        match self.serialize_without_mic() {
            Ok(bytes) => {
                crypto::data_mic(&nwk_skey.0, self.direction(), &self.dev_addr, self.fcnt, &bytes)
                    == self.mic
            }
            Err(_) => false,
        }
    }

    /// Decrypted FRMPayload of a parsed frame; the key follows the FPort
    /// rule.
    pub fn decrypt_payload(
        &self,
        nwk_skey: &NwkSKey,
        app_skey: &AppSKey,
    ) -> Vec<u8, MAX_FRM_PAYLOAD> {
        let mut plain = self.frm_payload.clone();
        let key = if self.fport == Some(0) { &nwk_skey.0 } else { &app_skey.0 };
        crypto::ctr_xor(key, self.direction(), &self.dev_addr, self.fcnt, &mut plain);
        plain
    }
}

/// Decodes a 24-bit frequency field (little-endian, units of 100 Hz).
pub(crate) fn frequency_hz(bytes: &[u8]) -> u32 {
    (u32::from(bytes[0]) | u32::from(bytes[1]) << 8 | u32::from(bytes[2]) << 16) * 100
}
