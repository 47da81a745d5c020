//! The MAC core: owns the radio capability and drives join, uplink,
//! receive-window and persistence behavior.

use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use lorawan_codec::commands::{parse_downlink_commands, UplinkCommand};
use lorawan_codec::crypto;
use lorawan_codec::frame::{DataFrame, DecodeError, JoinAccept, JoinRequest};
use lorawan_codec::keys::{AppKey, Eui};

use crate::adr::{Adr, LinkStats};
use crate::commands::{handle_downlink_commands, Downstream, PendingResponses};
use crate::confirm::{ConfirmState, ConfirmTracker, RetryAction, MAX_RETRIES};
use crate::duty_cycle::{time_on_air_ms, DutyCycleLedger, Verdict};
use crate::radio::{irq, Radio, Shadow};
use crate::region::{ChannelPlan, Region};
use crate::rng::RngCore;
use crate::rx_window::{RxAction, RxParams, RxState, RxWindows, WINDOW_DURATION_MS};
use crate::session::{Session, SessionStore};
use crate::{DeviceClass, Event, JoinMode, Message};

const DEFAULT_SESSION_FILE: &str = "lorawan_session.json";

/// Poll interval of the blocking loops in `join` and `receive`.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Errors surfaced by the MAC core. `E` is the radio driver's error type.
#[derive(Debug, thiserror::Error)]
pub enum Error<E: core::fmt::Debug> {
    #[error("radio failure: {0:?}")]
    Radio(E),
    #[error("device has not joined a network")]
    NotJoined,
    #[error("no join accept received before the deadline")]
    Timeout,
    #[error("a confirmed uplink is still awaiting its acknowledgement")]
    WaitingForAck,
    #[error("duty cycle requires waiting {0} ms")]
    DutyCycleBlocked(u64),
    #[error("missing or malformed credential: {0}")]
    Credentials(&'static str),
    #[error("payload too large for a single frame")]
    PayloadTooLong,
}

/// A LoRaWAN 1.0.x Class A/C end-device MAC over an SX127x-family radio.
///
/// Single-threaded and cooperative: the application must call
/// [`update`](MacDevice::update) at least every ~100 ms to keep the receive
/// windows on time and to drain radio interrupts.
pub struct MacDevice<R: Radio, G: RngCore> {
    radio: R,
    rng: G,
    region: Region,
    class: DeviceClass,

    shadow: Shadow,
    channels: ChannelPlan,
    rx_params: RxParams,
    windows: RxWindows,
    ledger: DutyCycleLedger,
    adr: Adr,
    stats: LinkStats,
    confirm: ConfirmTracker,
    pending: PendingResponses,
    nb_rep: u8,

    session: Session,
    store: SessionStore,

    dev_eui: Option<Eui>,
    app_eui: Option<Eui>,
    app_key: Option<AppKey>,

    single_channel_mhz: Option<f32>,
    battery_level: u8,
    duty_cycle_blocking: bool,

    receive_callback: Option<Box<dyn FnMut(&Message)>>,
    join_callback: Option<Box<dyn FnMut(bool)>>,
    rx_queue: VecDeque<Message>,
    events: VecDeque<Event>,

    last_rssi: i16,
    last_snr: f32,
}

impl<R: Radio, G: RngCore> MacDevice<R, G> {
    /// Creates an unjoined device. The radio is owned by the MAC from here
    /// on; nothing else may touch it.
    pub fn new(radio: R, rng: G, region: Region) -> Self {
        MacDevice {
            radio,
            rng,
            region,
            class: DeviceClass::ClassA,
            shadow: Shadow::defaults(region),
            channels: ChannelPlan::new(region),
            rx_params: RxParams::defaults(region),
            windows: RxWindows::new(),
            ledger: DutyCycleLedger::new(),
            adr: Adr::new(),
            stats: LinkStats::new(),
            confirm: ConfirmTracker::new(),
            pending: PendingResponses::new(),
            nb_rep: 1,
            session: Session::default(),
            store: SessionStore::new(DEFAULT_SESSION_FILE),
            dev_eui: None,
            app_eui: None,
            app_key: None,
            single_channel_mhz: None,
            battery_level: 255,
            duty_cycle_blocking: true,
            receive_callback: None,
            join_callback: None,
            rx_queue: VecDeque::new(),
            events: VecDeque::new(),
            last_rssi: -120,
            last_snr: 0.0,
        }
    }

    /// Programs the radio with the regional defaults (channel 0, SF9/125 kHz,
    /// CR 4/5, preamble 8, public sync word, max LNA, upright IQ).
    pub fn init(&mut self) -> Result<(), Error<R::Error>> {
        self.shadow = Shadow::defaults(self.region);
        let freq = self.shadow.frequency(&self.channels);
        self.radio.standby().map_err(Error::Radio)?;
        self.shadow.program(&mut self.radio, freq).map_err(Error::Radio)?;
        self.radio.clear_irq_flags().map_err(Error::Radio)?;
        debug!("radio initialized for {:?} at {freq} MHz", self.region);
        Ok(())
    }

    // --- credentials -----------------------------------------------------

    /// Stores the DevEUI from its hex form (MSB first, as displayed by the
    /// network server).
    pub fn set_dev_eui(&mut self, hex: &str) -> Result<(), Error<R::Error>> {
        self.dev_eui = Some(hex.parse().map_err(|_| Error::Credentials("DevEUI"))?);
        Ok(())
    }

    /// Stores the AppEUI/JoinEUI from its hex form.
    pub fn set_app_eui(&mut self, hex: &str) -> Result<(), Error<R::Error>> {
        self.app_eui = Some(hex.parse().map_err(|_| Error::Credentials("AppEUI"))?);
        Ok(())
    }

    /// Stores the OTAA root key from its hex form.
    pub fn set_app_key(&mut self, hex: &str) -> Result<(), Error<R::Error>> {
        self.app_key = Some(hex.parse().map_err(|_| Error::Credentials("AppKey"))?);
        Ok(())
    }

    /// ABP: stores the device address from its hex form (MSB first).
    pub fn set_dev_addr(&mut self, hex: &str) -> Result<(), Error<R::Error>> {
        self.session.dev_addr = hex.parse().map_err(|_| Error::Credentials("DevAddr"))?;
        Ok(())
    }

    /// ABP: stores the network session key from its hex form.
    pub fn set_nwk_skey(&mut self, hex: &str) -> Result<(), Error<R::Error>> {
        self.session.nwk_skey = hex.parse().map_err(|_| Error::Credentials("NwkSKey"))?;
        Ok(())
    }

    /// ABP: stores the application session key from its hex form.
    pub fn set_app_skey(&mut self, hex: &str) -> Result<(), Error<R::Error>> {
        self.session.app_skey = hex.parse().map_err(|_| Error::Credentials("AppSKey"))?;
        Ok(())
    }

    // --- configuration ---------------------------------------------------

    /// Moves the session file somewhere other than the working directory.
    pub fn set_session_file<P: Into<std::path::PathBuf>>(&mut self, path: P) {
        self.store = SessionStore::new(path);
    }

    /// Class A sleeps between windows, Class C listens continuously on RX2.
    pub fn set_device_class(&mut self, class: DeviceClass) -> Result<(), Error<R::Error>> {
        self.class = class;
        if class == DeviceClass::ClassC && self.session.joined {
            self.enter_rx2_continuous().map_err(Error::Radio)?;
            self.windows.force_continuous();
        }
        Ok(())
    }

    pub fn device_class(&self) -> DeviceClass {
        self.class
    }

    /// Pins all traffic to one frequency, for single-channel gateways.
    pub fn set_single_channel(&mut self, freq_mhz: Option<f32>) {
        self.single_channel_mhz = freq_mhz;
    }

    /// Selects the uplink data rate.
    pub fn set_data_rate(&mut self, dr: u8) -> bool {
        match self.region.dr_to_sf_bw(dr) {
            Some((sf, bw)) => {
                self.shadow.sf = sf;
                self.shadow.bw_khz = bw;
                true
            }
            None => false,
        }
    }

    /// Sets the TX power in dBm, clamped to [2, regional EIRP limit].
    pub fn set_tx_power(&mut self, dbm: i8) {
        self.shadow.power_dbm = dbm.clamp(2, self.region.plan().max_eirp_dbm);
    }

    /// Pins the next uplink to a specific enabled channel.
    pub fn set_channel(&mut self, channel: usize) -> bool {
        match self.channels.frequency(channel) {
            Some(_) => {
                self.shadow.channel = channel;
                true
            }
            None => false,
        }
    }

    /// Battery byte reported by DevStatusAns (0 external, 1..=254 level,
    /// 255 unknown).
    pub fn set_battery_level(&mut self, battery: u8) {
        self.battery_level = battery;
    }

    /// When disabled, `send` returns [`Error::DutyCycleBlocked`] instead of
    /// sleeping through the mandatory gap.
    pub fn set_duty_cycle_blocking(&mut self, blocking: bool) {
        self.duty_cycle_blocking = blocking;
    }

    pub fn enable_adr(&mut self, enable: bool) {
        self.adr.enabled = enable;
        debug!("ADR {}", if enable { "enabled" } else { "disabled" });
    }

    /// Queues a LinkCheckReq for the next uplink.
    pub fn request_link_check(&mut self) {
        self.pending.push(&UplinkCommand::LinkCheckReq);
    }

    /// Applies a data rate and TX power index pair as a LinkADRReq would.
    pub fn apply_adr_settings(&mut self, data_rate: u8, tx_power_index: u8) -> bool {
        match (self.region.dr_to_sf_bw(data_rate), self.region.tx_power_dbm(tx_power_index)) {
            (Some((sf, bw)), Some(dbm)) => {
                self.shadow.sf = sf;
                self.shadow.bw_khz = bw;
                self.shadow.power_dbm = dbm;
                true
            }
            _ => false,
        }
    }

    pub fn on_receive<F: FnMut(&Message) + 'static>(&mut self, callback: F) {
        self.receive_callback = Some(Box::new(callback));
    }

    pub fn on_join<F: FnMut(bool) + 'static>(&mut self, callback: F) {
        self.join_callback = Some(Box::new(callback));
    }

    // --- accessors -------------------------------------------------------

    pub fn is_joined(&self) -> bool {
        self.session.joined
    }

    pub fn fcnt_up(&self) -> u32 {
        self.session.fcnt_up
    }

    pub fn set_fcnt_up(&mut self, fcnt: u32) {
        self.session.fcnt_up = fcnt;
    }

    /// DevAddr in display (MSB-first) order, once joined.
    pub fn dev_addr(&self) -> Option<[u8; 4]> {
        if self.session.joined {
            Some(self.session.dev_addr.to_msb())
        } else {
            None
        }
    }

    /// RSSI of the last received downlink, dBm.
    pub fn rssi(&self) -> i16 {
        self.last_rssi
    }

    /// SNR of the last received downlink, dB.
    pub fn snr(&self) -> f32 {
        self.last_snr
    }

    /// Rolling average SNR over the last downlinks, dB.
    pub fn average_snr(&self) -> f32 {
        self.stats.average_snr()
    }

    /// Rolling average RSSI over the last downlinks, dBm.
    pub fn average_rssi(&self) -> i16 {
        self.stats.average_rssi()
    }

    /// Percentage of the hourly duty-cycle budget consumed on a channel.
    pub fn duty_cycle_usage(&self, channel: usize) -> f32 {
        self.ledger.usage(channel, Instant::now())
    }

    /// Margin and gateway count of the most recent LinkCheckAns.
    pub fn take_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn sleep(&mut self) -> Result<(), Error<R::Error>> {
        self.radio.sleep().map_err(Error::Radio)
    }

    pub fn wake(&mut self) -> Result<(), Error<R::Error>> {
        self.radio.standby().map_err(Error::Radio)
    }

    // --- join ------------------------------------------------------------

    /// Joins the network. A stored session short-circuits the handshake;
    /// otherwise OTAA transmits join requests until one is accepted or the
    /// timeout expires. ABP only validates the preloaded keys.
    pub fn join(&mut self, mode: JoinMode, timeout_ms: u64) -> Result<(), Error<R::Error>> {
        if self.session.joined {
            return Ok(());
        }

        match self.store.load() {
            Ok(Some(stored)) if stored.joined && stored.has_keys() => {
                info!("restored previous session from {}", self.store.path().display());
                self.session = stored;
                self.notify_join(true);
                if self.class == DeviceClass::ClassC {
                    self.enter_rx2_continuous().map_err(Error::Radio)?;
                    self.windows.force_continuous();
                }
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => warn!("could not read session file: {e}"),
        }

        match mode {
            JoinMode::Abp => {
                if !self.session.has_keys() {
                    return Err(Error::Credentials("ABP needs DevAddr, NwkSKey and AppSKey"));
                }
                self.session.joined = true;
                self.persist();
                info!("ABP session activated");
                self.notify_join(true);
                if self.class == DeviceClass::ClassC {
                    self.enter_rx2_continuous().map_err(Error::Radio)?;
                    self.windows.force_continuous();
                }
                Ok(())
            }
            JoinMode::Otaa => self.join_otaa(timeout_ms),
        }
    }

    fn join_otaa(&mut self, timeout_ms: u64) -> Result<(), Error<R::Error>> {
        let dev_eui = self.dev_eui.ok_or(Error::Credentials("DevEUI not set"))?;
        let app_eui = self.app_eui.ok_or(Error::Credentials("AppEUI not set"))?;
        let app_key = self.app_key.ok_or(Error::Credentials("AppKey not set"))?;
        if app_key.is_zero() {
            return Err(Error::Credentials("AppKey is zero"));
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if self.join_attempt(dev_eui, app_eui, &app_key)? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.notify_join(false);
                return Err(Error::Timeout);
            }
            debug!("no join accept, trying again");
        }
    }

    /// One join-request / join-accept exchange over RX1 and RX2.
    fn join_attempt(
        &mut self,
        dev_eui: Eui,
        app_eui: Eui,
        app_key: &AppKey,
    ) -> Result<bool, Error<R::Error>> {
        // a fresh DevNonce not present in the history
        let nonce = loop {
            let candidate = (self.rng.next_u32() % 0xffff) as u16 + 1;
            if !self.session.has_nonce(candidate) {
                break candidate;
            }
            trace!("DevNonce {candidate:#06x} already used, drawing another");
        };
        self.session.register_nonce(nonce);

        // join requests go out at SF9/125 on a random active channel (or the
        // pinned single-channel frequency) at the regional power limit
        let (channel, freq) = match self.single_channel_mhz {
            Some(freq) => (self.channels.channel_for_frequency(freq).unwrap_or(0), freq),
            None => {
                let active: Vec<(usize, f32)> = self.channels.enabled().collect();
                if active.is_empty() {
                    (0, self.region.plan().base_freq_mhz)
                } else {
                    active[self.rng.next_u32() as usize % active.len()]
                }
            }
        };
        self.shadow.channel = channel;
        self.shadow.sf = 9;
        self.shadow.bw_khz = 125.0;
        self.shadow.cr_denom = 5;
        self.shadow.preamble = 8;
        self.shadow.power_dbm = self.region.plan().max_eirp_dbm;
        self.shadow.invert_iq = false;

        self.radio.standby().map_err(Error::Radio)?;
        self.shadow.program(&mut self.radio, freq).map_err(Error::Radio)?;
        self.radio.clear_irq_flags().map_err(Error::Radio)?;

        let request = JoinRequest { app_eui, dev_eui, dev_nonce: nonce };
        let packet = request.encode(app_key);

        debug!("join request on {freq} MHz, DevNonce {nonce:#06x}");
        self.radio.send(&packet).map_err(Error::Radio)?;
        let tx_end = Instant::now();

        // RX1: same channel and data rate, inverted IQ, listening from now
        // through the end of the first window
        self.program_rx1().map_err(Error::Radio)?;
        let rx1_deadline =
            tx_end + Duration::from_millis(self.windows.rx1_delay_ms + WINDOW_DURATION_MS);
        if let Some(payload) = self.wait_for_frame(rx1_deadline)? {
            if self.process_join_accept(&payload, nonce, app_key) {
                return Ok(true);
            }
        }

        // RX2 on the regional downlink parameters
        self.program_rx2().map_err(Error::Radio)?;
        let rx2_deadline =
            tx_end + Duration::from_millis(self.windows.rx2_delay_ms() + WINDOW_DURATION_MS);
        if let Some(payload) = self.wait_for_frame(rx2_deadline)? {
            if self.process_join_accept(&payload, nonce, app_key) {
                return Ok(true);
            }
        }

        self.radio.standby().map_err(Error::Radio)?;
        Ok(false)
    }

    /// Polls for an RX-done interrupt until the deadline; CRC failures are
    /// dropped without disturbing any state.
    fn wait_for_frame(&mut self, deadline: Instant) -> Result<Option<Vec<u8>>, Error<R::Error>> {
        while Instant::now() < deadline {
            let flags = self.radio.read_irq_flags().map_err(Error::Radio)?;
            if flags & irq::RX_DONE != 0 {
                let crc_error = flags & irq::PAYLOAD_CRC_ERROR != 0;
                self.radio.clear_irq_flags().map_err(Error::Radio)?;
                if crc_error {
                    warn!("CRC error in receive window");
                } else {
                    let payload = self.radio.read_payload().map_err(Error::Radio)?;
                    if !payload.is_empty() {
                        return Ok(Some(payload));
                    }
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
        Ok(None)
    }

    /// Decodes a join accept; on a valid MIC derives the session keys,
    /// applies the downlink settings and persists the session. A MIC failure
    /// changes nothing.
    fn process_join_accept(&mut self, payload: &[u8], nonce: u16, app_key: &AppKey) -> bool {
        let accept = match JoinAccept::decrypt(payload, app_key) {
            Ok(accept) => accept,
            Err(DecodeError::BadMic) => {
                warn!("join accept failed MIC verification");
                return false;
            }
            Err(e) => {
                trace!("not a join accept: {e:?}");
                return false;
            }
        };

        let (nwk_skey, app_skey) =
            crypto::derive_session_keys(app_key, &accept.app_nonce, &accept.net_id, nonce);

        self.rx_params.rx1_dr_offset = accept.rx1_dr_offset;
        // a zero RX2 data rate keeps the configured regional default
        if accept.rx2_data_rate != 0 {
            self.rx_params.rx2_data_rate = Some(accept.rx2_data_rate);
        }
        self.windows.rx1_delay_ms =
            if accept.rx_delay == 0 { 1000 } else { accept.rx_delay as u64 * 1000 };
        if let Some(cf_list) = &accept.cf_list {
            self.channels.apply_cf_list(cf_list);
        }

        self.session.dev_addr = accept.dev_addr;
        self.session.nwk_skey = nwk_skey;
        self.session.app_skey = app_skey;
        self.session.fcnt_up = 0;
        self.session.fcnt_down = 0;
        self.session.joined = true;
        self.persist();

        info!("joined, DevAddr {}", hex::encode(accept.dev_addr.to_msb()));
        self.notify_join(true);

        if self.class == DeviceClass::ClassC {
            if let Err(e) = self.enter_rx2_continuous() {
                warn!("could not enter continuous receive: {e:?}");
            }
            self.windows.force_continuous();
        }
        true
    }

    // --- uplink ----------------------------------------------------------

    /// Builds and transmits one uplink.
    ///
    /// Pending MAC answers ride in FOpts, the ACK bit is set while a
    /// confirmed downlink is outstanding, and the per-channel duty cycle is
    /// enforced unless `force_duty_cycle` is set.
    pub fn send(
        &mut self,
        data: &[u8],
        port: u8,
        confirmed: bool,
        force_duty_cycle: bool,
    ) -> Result<(), Error<R::Error>> {
        if !self.session.joined {
            return Err(Error::NotJoined);
        }
        if confirmed && self.confirm.state() == ConfirmState::WaitingAck {
            return Err(Error::WaitingForAck);
        }
        let ack_bit = self.confirm.state() == ConfirmState::AckPending;

        let now = Instant::now();
        let (channel, freq) = self.select_channel(now);
        let airtime = time_on_air_ms(
            data.len(),
            self.shadow.sf,
            self.shadow.bw_khz,
            self.shadow.cr_denom,
            self.shadow.preamble,
        );

        if !force_duty_cycle {
            if let Verdict::Wait(ms) = self.ledger.check(channel, airtime, now) {
                if !self.duty_cycle_blocking {
                    return Err(Error::DutyCycleBlocked(ms));
                }
                debug!("duty cycle gate: sleeping {ms} ms before using channel {channel}");
                thread::sleep(Duration::from_millis(ms));
            }
        }

        self.shadow.channel = channel;
        self.shadow.invert_iq = false;
        self.radio.standby().map_err(Error::Radio)?;
        self.shadow.program(&mut self.radio, freq).map_err(Error::Radio)?;
        self.radio.clear_irq_flags().map_err(Error::Radio)?;

        let mut frame = DataFrame::uplink(confirmed, self.session.dev_addr);
        frame.adr = self.adr.enabled;
        if self.adr.ack_requested() {
            debug!("requesting ADR acknowledgement");
            frame.adr_ack_req = true;
        }
        if ack_bit {
            debug!("acknowledging confirmed downlink");
            frame.ack = true;
        }
        frame.fcnt = self.session.fcnt_up;
        if !self.pending.is_empty() {
            debug!("piggy-backing {} bytes of MAC answers", self.pending.as_slice().len());
        }
        frame.fopts = self.pending.take();
        if !data.is_empty() {
            frame.fport = Some(port);
            frame.frm_payload =
                heapless::Vec::from_slice(data).map_err(|_| Error::PayloadTooLong)?;
        }
        let packet = frame
            .encode(&self.session.nwk_skey, &self.session.app_skey)
            .map_err(|_| Error::PayloadTooLong)?;

        debug!(
            "uplink FCnt {} on channel {channel} ({freq} MHz), {} bytes",
            frame.fcnt,
            packet.len()
        );
        self.radio.send(&packet).map_err(Error::Radio)?;
        let tx_end = Instant::now();

        self.ledger.record(channel, airtime, tx_end);
        self.session.fcnt_up = self.session.fcnt_up.wrapping_add(1);
        self.adr.on_uplink();
        if self.adr.needs_fallback() {
            self.adr_fallback();
        }
        if confirmed {
            self.confirm.on_confirmed_sent(data, port, tx_end);
            debug!("confirmed uplink attempt {}/{MAX_RETRIES}", self.confirm.retries_used());
        }
        if ack_bit {
            self.confirm.ack_sent();
        }
        self.windows.on_tx_done(tx_end);

        // until RX1 opens: Class C listens on RX2, Class A rests
        if self.class == DeviceClass::ClassC {
            self.enter_rx2_continuous().map_err(Error::Radio)?;
        } else {
            self.radio.standby().map_err(Error::Radio)?;
        }

        self.persist();
        Ok(())
    }

    /// Picks the enabled channel with the lowest duty-cycle usage.
    fn select_channel(&self, now: Instant) -> (usize, f32) {
        if let Some(freq) = self.single_channel_mhz {
            return (self.channels.channel_for_frequency(freq).unwrap_or(0), freq);
        }
        let mut best = (0, self.region.plan().base_freq_mhz);
        let mut lowest = f32::MAX;
        for (index, freq) in self.channels.enabled() {
            let usage = self.ledger.usage(index, now);
            if usage < lowest {
                lowest = usage;
                best = (index, freq);
            }
        }
        best
    }

    /// One SF step toward robustness after prolonged ADR silence.
    fn adr_fallback(&mut self) {
        if let Some(dr) = self.shadow.data_rate(self.region) {
            if dr > 0 {
                if let Some((sf, bw)) = self.region.dr_to_sf_bw(dr - 1) {
                    self.shadow.sf = sf;
                    self.shadow.bw_khz = bw;
                    debug!("ADR fallback: stepping down to DR{}", dr - 1);
                }
            }
        }
        let max = self.region.plan().max_eirp_dbm;
        if self.shadow.power_dbm < max {
            self.shadow.power_dbm = (self.shadow.power_dbm + 2).min(max);
        }
        self.adr.fallback_applied();
    }

    // --- cooperative tick ------------------------------------------------

    /// Cooperative tick: drives the receive windows, the confirmed-uplink
    /// retry schedule and the radio interrupt flags. Non-blocking.
    pub fn update(&mut self) -> Result<(), Error<R::Error>> {
        if !self.session.joined {
            return Ok(());
        }
        let now = Instant::now();
        let continuous = self.class == DeviceClass::ClassC;

        match self.windows.poll(now, continuous) {
            RxAction::OpenRx1 => self.program_rx1().map_err(Error::Radio)?,
            RxAction::OpenRx2 => self.program_rx2().map_err(Error::Radio)?,
            RxAction::CloseToIdle => {
                debug!("receive windows closed, radio to standby");
                self.radio.standby().map_err(Error::Radio)?;
            }
            // window 2 and continuous reception share the RX2 parameters
            RxAction::CloseToContinuous => {}
            RxAction::None => {}
        }

        match self.confirm.poll(now) {
            RetryAction::Resend(payload, port) => {
                debug!("no ACK yet, retransmitting confirmed uplink");
                match self.send(&payload, port, true, false) {
                    Ok(()) => {}
                    Err(Error::DutyCycleBlocked(ms)) => {
                        trace!("retry blocked by duty cycle for {ms} ms");
                        self.confirm.restore_waiting();
                    }
                    Err(e) => {
                        self.confirm.restore_waiting();
                        return Err(e);
                    }
                }
            }
            RetryAction::GiveUp => {
                warn!("confirmed uplink unacknowledged after {MAX_RETRIES} attempts");
                self.events.push_back(Event::NotConfirmed);
            }
            RetryAction::None => {}
        }

        let flags = self.radio.read_irq_flags().map_err(Error::Radio)?;
        if flags & irq::RX_DONE != 0 {
            if flags & irq::PAYLOAD_CRC_ERROR != 0 {
                warn!("CRC error on received packet");
            } else {
                self.last_rssi = self.radio.rssi().map_err(Error::Radio)?;
                self.last_snr = self.radio.snr().map_err(Error::Radio)?;
                let payload = self.radio.read_payload().map_err(Error::Radio)?;
                if !payload.is_empty() {
                    self.process_downlink(payload);
                }
            }
            self.radio.clear_irq_flags().map_err(Error::Radio)?;

            if self.windows.state() != RxState::Continuous {
                self.windows.on_rx_packet(continuous);
            }
            if continuous {
                self.enter_rx2_continuous().map_err(Error::Radio)?;
                // Class C answers confirmed downlinks right away
                if self.confirm.state() == ConfirmState::AckPending {
                    if let Err(e) = self.send(&[], 0, false, true) {
                        warn!("could not send immediate ACK: {e}");
                    }
                }
            } else if self.windows.state() == RxState::Idle {
                self.radio.standby().map_err(Error::Radio)?;
            }
        }
        Ok(())
    }

    /// Parses, verifies and dispatches one received downlink frame.
    fn process_downlink(&mut self, payload: Vec<u8>) {
        let frame = match DataFrame::parse(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                trace!("unparseable downlink: {e:?}");
                return;
            }
        };
        if frame.mtype.is_uplink() {
            trace!("ignoring uplink frame");
            return;
        }
        match frame.verify(&self.session.dev_addr, &self.session.nwk_skey) {
            Ok(()) => {}
            Err(DecodeError::WrongDevAddr) => {
                trace!("DevAddr mismatch, dropping frame");
                return;
            }
            Err(_) => {
                warn!("downlink failed MIC verification, dropping");
                return;
            }
        }

        let confirmed = frame.mtype.is_confirmed();
        let plain = frame.decrypt_payload(&self.session.nwk_skey, &self.session.app_skey);

        debug!(
            "downlink FCnt {}, RSSI {} dBm, SNR {} dB{}",
            frame.fcnt,
            self.last_rssi,
            self.last_snr,
            if confirmed { ", confirmed" } else { "" }
        );

        self.session.fcnt_down = frame.fcnt;
        self.adr.on_downlink();
        self.stats.record(self.last_snr, self.last_rssi);

        if frame.ack && self.confirm.ack_received() {
            debug!("uplink acknowledged by the network");
        }
        if confirmed {
            self.confirm.on_confirmed_downlink();
        }

        // MAC commands piggy-backed in FOpts
        let mut events = handle_downlink_commands(
            parse_downlink_commands(&frame.fopts),
            &mut Downstream {
                region: self.region,
                shadow: &mut self.shadow,
                channels: &mut self.channels,
                windows: &mut self.windows,
                rx_params: &mut self.rx_params,
                ledger: &mut self.ledger,
                adr: &mut self.adr,
                nb_rep: &mut self.nb_rep,
                snr: self.stats.average_snr(),
                battery: self.battery_level,
            },
            &mut self.pending,
        );

        match frame.fport {
            // port 0 carries MAC commands in the FRMPayload
            Some(0) => {
                events.extend(handle_downlink_commands(
                    parse_downlink_commands(&plain),
                    &mut Downstream {
                        region: self.region,
                        shadow: &mut self.shadow,
                        channels: &mut self.channels,
                        windows: &mut self.windows,
                        rx_params: &mut self.rx_params,
                        ledger: &mut self.ledger,
                        adr: &mut self.adr,
                        nb_rep: &mut self.nb_rep,
                        snr: self.stats.average_snr(),
                        battery: self.battery_level,
                    },
                    &mut self.pending,
                ));
            }
            Some(port) => {
                self.deliver(Message { payload: plain.to_vec(), port, confirmed });
            }
            None => {}
        }

        self.events.extend(events);
    }

    fn deliver(&mut self, message: Message) {
        if let Some(callback) = self.receive_callback.as_mut() {
            callback(&message);
        } else {
            self.rx_queue.push_back(message);
        }
    }

    // --- receive ---------------------------------------------------------

    /// Synchronous alternative to the receive callback: pumps `update` until
    /// a downlink arrives or the timeout expires.
    pub fn receive(
        &mut self,
        message: &mut Message,
        timeout_ms: u64,
    ) -> Result<bool, Error<R::Error>> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            self.update()?;
            if let Some(received) = self.rx_queue.pop_front() {
                *message = received;
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    // --- session ---------------------------------------------------------

    /// Zeroizes keys and counters, clears the DevNonce history and deletes
    /// the session file. The device must join again afterwards.
    pub fn reset_session(&mut self) {
        self.session.reset();
        if let Err(e) = self.store.clear() {
            warn!("could not delete session file: {e}");
        }
        self.pending.clear();
        self.confirm.reset();
        self.adr.reset();
        self.stats.clear();
        self.ledger.reset();
        self.windows.set_idle();
        info!("session reset");
    }

    fn persist(&mut self) {
        if let Err(e) = self.store.save(&self.session) {
            // the in-memory session stays authoritative
            warn!("session persist failed: {e}");
        }
    }

    fn notify_join(&mut self, success: bool) {
        if let Some(callback) = self.join_callback.as_mut() {
            callback(success);
        }
    }

    // --- radio programming ------------------------------------------------

    /// RX1: uplink channel, uplink data rate lowered by RX1DRoffset,
    /// inverted IQ.
    fn program_rx1(&mut self) -> Result<(), R::Error> {
        let freq = self.shadow.frequency(&self.channels);
        let uplink_dr = self.shadow.data_rate(self.region).unwrap_or(0);
        let rx1_dr = uplink_dr.saturating_sub(self.rx_params.rx1_dr_offset);
        let (sf, bw) =
            self.region.dr_to_sf_bw(rx1_dr).unwrap_or((self.shadow.sf, self.shadow.bw_khz));

        self.radio.standby()?;
        self.radio.set_frequency(freq)?;
        self.radio.set_spreading_factor(sf)?;
        self.radio.set_bandwidth(bw)?;
        self.radio.set_coding_rate(self.shadow.cr_denom)?;
        self.radio.set_preamble_length(self.shadow.preamble)?;
        self.radio.set_sync_word(self.shadow.sync_word)?;
        self.radio.set_lna(self.shadow.lna_gain, true)?;
        self.radio.set_invert_iq(true)?;
        self.radio.set_continuous_receive()?;
        debug!("RX1 open at {freq} MHz, SF{sf}");
        Ok(())
    }

    /// RX2: regional frequency and data rate unless overridden by
    /// RXParamSetupReq, inverted IQ.
    fn program_rx2(&mut self) -> Result<(), R::Error> {
        let plan = self.region.plan();
        let (sf, bw) = match self.rx_params.rx2_data_rate {
            Some(dr) => {
                self.region.dr_to_sf_bw(dr).unwrap_or((plan.rx2_sf, plan.rx2_bw_khz))
            }
            None => (plan.rx2_sf, plan.rx2_bw_khz),
        };
        let freq = self.rx_params.rx2_frequency_mhz;

        self.radio.standby()?;
        self.radio.set_frequency(freq)?;
        self.radio.set_spreading_factor(sf)?;
        self.radio.set_bandwidth(bw)?;
        self.radio.set_coding_rate(plan.rx2_cr_denom)?;
        self.radio.set_preamble_length(plan.rx2_preamble)?;
        self.radio.set_sync_word(self.shadow.sync_word)?;
        self.radio.set_lna(self.shadow.lna_gain, true)?;
        self.radio.set_invert_iq(true)?;
        self.radio.set_continuous_receive()?;
        debug!("RX2 open at {freq} MHz, SF{sf}");
        Ok(())
    }

    /// Class C resting state: continuous reception on the RX2 parameters.
    fn enter_rx2_continuous(&mut self) -> Result<(), R::Error> {
        self.program_rx2()
    }
}
