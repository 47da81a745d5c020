//! Durable session state: DevAddr, session keys, frame counters and the
//! DevNonce history, persisted as a small JSON file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use lorawan_codec::keys::{AppSKey, DevAddr, NwkSKey};
use serde::{Deserialize, Serialize};

/// Cap on the DevNonce history; the oldest entry is evicted beyond this.
pub(crate) const MAX_NONCE_HISTORY: usize = 100;

/// Volatile view of the LoRaWAN session.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Session {
    pub dev_addr: DevAddr,
    pub nwk_skey: NwkSKey,
    pub app_skey: AppSKey,
    pub fcnt_up: u32,
    pub fcnt_down: u32,
    pub last_dev_nonce: u16,
    pub used_nonces: Vec<u16>,
    pub joined: bool,
}

impl Session {
    /// A session is usable iff the DevAddr and both keys are non-zero.
    pub fn has_keys(&self) -> bool {
        !self.dev_addr.is_zero() && !self.nwk_skey.is_zero() && !self.app_skey.is_zero()
    }

    pub fn has_nonce(&self, nonce: u16) -> bool {
        self.used_nonces.contains(&nonce)
    }

    /// Records a freshly used DevNonce, evicting the oldest entry when the
    /// history is full.
    pub fn register_nonce(&mut self, nonce: u16) {
        self.last_dev_nonce = nonce;
        self.used_nonces.push(nonce);
        if self.used_nonces.len() > MAX_NONCE_HISTORY {
            self.used_nonces.remove(0);
        }
    }

    /// Drops all key material and counters; the device is unjoined after.
    pub fn reset(&mut self) {
        *self = Session::default();
    }
}

/// On-disk representation. Byte arrays are hex strings; `devAddr` is stored
/// MSB-first, the way a network server displays it.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SessionFile {
    dev_addr: String,
    nwk_s_key: String,
    app_s_key: String,
    uplink_counter: u32,
    downlink_counter: u32,
    last_dev_nonce: u16,
    used_nonces: Vec<u16>,
    joined: bool,
}

/// Loads and saves the session file with atomic replacement.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        SessionStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the stored session. Returns `Ok(None)` when no file exists or
    /// it cannot be interpreted; missing fields default to zero/unjoined.
    pub fn load(&self) -> io::Result<Option<Session>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let file: SessionFile = match serde_json::from_str(&raw) {
            Ok(file) => file,
            Err(e) => {
                log::warn!("session file {} is unreadable: {e}", self.path.display());
                return Ok(None);
            }
        };

        let mut session = Session {
            fcnt_up: file.uplink_counter,
            fcnt_down: file.downlink_counter,
            last_dev_nonce: file.last_dev_nonce,
            used_nonces: file.used_nonces,
            joined: file.joined,
            ..Session::default()
        };
        // the file stores devAddr MSB-first, the wire order is LSB-first
        let mut dev_addr = [0u8; 4];
        if hex::decode_to_slice(&file.dev_addr, &mut dev_addr).is_ok() {
            session.dev_addr = DevAddr::from_msb(dev_addr);
        }
        let mut key = [0u8; 16];
        if hex::decode_to_slice(&file.nwk_s_key, &mut key).is_ok() {
            session.nwk_skey = NwkSKey::from(key);
        }
        if hex::decode_to_slice(&file.app_s_key, &mut key).is_ok() {
            session.app_skey = AppSKey::from(key);
        }
        Ok(Some(session))
    }

    /// Writes the session to a temporary file and renames it into place.
    pub fn save(&self, session: &Session) -> io::Result<()> {
        let file = SessionFile {
            dev_addr: hex::encode(session.dev_addr.to_msb()),
            nwk_s_key: hex::encode(session.nwk_skey.as_bytes()),
            app_s_key: hex::encode(session.app_skey.as_bytes()),
            uplink_counter: session.fcnt_up,
            downlink_counter: session.fcnt_down,
            last_dev_nonce: session.last_dev_nonce,
            used_nonces: session.used_nonces.clone(),
            joined: session.joined,
        };
        let json = serde_json::to_string_pretty(&file).expect("session serialization is total");

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)
    }

    /// Deletes the session file if present.
    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
