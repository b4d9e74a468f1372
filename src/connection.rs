//! # Persistent Link Connection
//!
//! One [`PersistentConnection`] owns the session to one physical address and
//! serves every logical device behind it (hub mode). Requests are
//! serialized by an async lock; responses are collected from notification
//! fragments pushed by the transport into a shared receive buffer.
//!
//! ## State machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> AwaitingResponse -> Connected
//!                                   \______ link lost ______/ -> Disconnected
//! ```
//!
//! Nothing here returns an error to the caller: connect failures become
//! `false`, read failures become `None`, and a device poll that yields
//! nothing becomes an empty map.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::PollingConfig;
use crate::error::{RenogyError, RenogyResult};
use crate::logging::{describe_request, describe_response, obfuscate_address};
use crate::parsers::{parse_response, Telemetry, TelemetryExt};
use crate::protocol::{
    build_request, validate_response, ModbusFunction, RegisterAddress, UnitId, MIN_RESPONSE_LEN,
};
use crate::registers::DeviceIdentity;
use crate::utils::validation::validate_word_count;
use crate::transport::{
    log_packet, BleTransport, CharacteristicPair, LinkEvents, TransportFactory, TransportStats,
};

/// Metadata key carrying the device name in a polled record
pub const TAG_DEVICE: &str = "__device";
/// Metadata key carrying the physical address in a polled record
pub const TAG_ADDRESS: &str = "__address";
/// Metadata key carrying the device type in a polled record
pub const TAG_DEVICE_TYPE: &str = "__device_type";

/// Returns `true` for metadata keys added by [`PersistentConnection::poll_device`]
pub fn is_tag(key: &str) -> bool {
    key.starts_with("__")
}

/// Link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    AwaitingResponse,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::AwaitingResponse => write!(f, "AwaitingResponse"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct RxBuffer {
    data: Vec<u8>,
    ready: bool,
}

/// Receive rendezvous shared with the transport's delivery path
pub(crate) struct LinkShared {
    address: String,
    rx: Mutex<RxBuffer>,
    ready: Notify,
    connected: AtomicBool,
}

impl LinkShared {
    pub(crate) fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            rx: Mutex::new(RxBuffer::default()),
            ready: Notify::new(),
            connected: AtomicBool::new(false),
        }
    }

    pub(crate) fn reset(&self) {
        let mut rx = lock(&self.rx);
        rx.data.clear();
        rx.ready = false;
    }

    fn is_ready(&self) -> bool {
        lock(&self.rx).ready
    }

    /// Resolves once at least one fragment has arrived since the last reset
    pub(crate) async fn wait_ready(&self) {
        loop {
            if self.is_ready() {
                return;
            }
            self.ready.notified().await;
        }
    }

    fn take(&self) -> Vec<u8> {
        let mut rx = lock(&self.rx);
        rx.ready = false;
        std::mem::take(&mut rx.data)
    }

    /// Copy of everything received so far; re-arms the ready signal
    pub(crate) fn snapshot(&self) -> Vec<u8> {
        let mut rx = lock(&self.rx);
        rx.ready = false;
        rx.data.clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl LinkEvents for LinkShared {
    fn on_notification(&self, data: &[u8]) {
        debug!(
            "[{}] Notification: {}",
            obfuscate_address(&self.address),
            hex::encode(data)
        );
        {
            let mut rx = lock(&self.rx);
            rx.data.extend_from_slice(data);
            rx.ready = true;
        }
        self.ready.notify_one();
    }

    fn on_disconnect(&self) {
        warn!("[{}] Disconnected!", obfuscate_address(&self.address));
        self.set_connected(false);
    }
}

#[derive(Default)]
struct Session {
    transport: Option<Box<dyn BleTransport>>,
    chars: CharacteristicPair,
}

/// Persistent session to one physical address
pub struct PersistentConnection {
    address: String,
    devices: Vec<DeviceIdentity>,
    factory: Arc<dyn TransportFactory>,
    polling: PollingConfig,
    link: Arc<LinkShared>,
    session: AsyncMutex<Session>,
    state: Mutex<ConnectionState>,
    stats: Mutex<TransportStats>,
}

impl PersistentConnection {
    /// Create a disconnected connection for `devices`, all sharing `address`
    pub fn new(
        address: impl Into<String>,
        devices: Vec<DeviceIdentity>,
        factory: Arc<dyn TransportFactory>,
        polling: PollingConfig,
    ) -> Self {
        let address = address.into();
        Self {
            link: Arc::new(LinkShared::new(&address)),
            address,
            devices,
            factory,
            polling,
            session: AsyncMutex::new(Session::default()),
            state: Mutex::new(ConnectionState::Disconnected),
            stats: Mutex::new(TransportStats::default()),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Logical devices served by this link
    pub fn devices(&self) -> &[DeviceIdentity] {
        &self.devices
    }

    /// Current link state; a reported link loss reads as `Disconnected`
    pub fn state(&self) -> ConnectionState {
        let state = *lock(&self.state);
        match state {
            ConnectionState::Connected | ConnectionState::AwaitingResponse
                if !self.link.is_connected() =>
            {
                ConnectionState::Disconnected
            }
            other => other,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::AwaitingResponse
        )
    }

    /// Snapshot of the traffic counters
    pub fn stats(&self) -> TransportStats {
        lock(&self.stats).clone()
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    fn finish_request(&self) {
        if self.link.is_connected() {
            self.set_state(ConnectionState::Connected);
        } else {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn mark_lost(&self) {
        self.link.set_connected(false);
        self.set_state(ConnectionState::Disconnected);
    }

    fn tag(&self) -> String {
        obfuscate_address(&self.address)
    }

    /// Establish the session, retrying with a fixed backoff
    ///
    /// Returns `true` if connected (or already connected).
    pub async fn connect(&self) -> bool {
        let mut session = self.session.lock().await;
        self.connect_locked(&mut session).await
    }

    async fn connect_locked(&self, session: &mut Session) -> bool {
        if self.is_connected() {
            return true;
        }

        if let Some(mut stale) = session.transport.take() {
            if let Err(e) = stale.disconnect().await {
                debug!("[{}] Closing stale session: {}", self.tag(), e);
            }
        }

        let attempts = self.polling.connect_attempts.max(1);
        for attempt in 0..attempts {
            if attempt > 0 {
                info!("[{}] Retry {}/{}...", self.tag(), attempt + 1, attempts);
                sleep(self.polling.retry_delay).await;
            }

            info!("[{}] Connecting...", self.tag());
            self.set_state(ConnectionState::Connecting);

            match self.open_session().await {
                Ok((transport, chars)) => {
                    session.transport = Some(transport);
                    session.chars = chars;
                    self.link.set_connected(true);
                    self.set_state(ConnectionState::Connected);
                    info!("[{}] Connected successfully", self.tag());
                    return true;
                }
                Err(e) => {
                    warn!("[{}] Connect error (attempt {}): {}", self.tag(), attempt + 1, e);
                    lock(&self.stats).record_error();
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        error!("[{}] Failed to connect after {} attempts", self.tag(), attempts);
        false
    }

    /// One connect attempt; a failed attempt closes its partial session
    async fn open_session(&self) -> RenogyResult<(Box<dyn BleTransport>, CharacteristicPair)> {
        let mut transport = self.factory.create(&self.address)?;
        match self.setup_session(transport.as_mut()).await {
            Ok(chars) => Ok((transport, chars)),
            Err(e) => {
                if let Err(close_err) = transport.disconnect().await {
                    debug!("[{}] Teardown after failed attempt: {}", self.tag(), close_err);
                }
                Err(e)
            }
        }
    }

    async fn setup_session(&self, transport: &mut dyn BleTransport) -> RenogyResult<CharacteristicPair> {
        self.link.reset();
        let events: Arc<dyn LinkEvents> = self.link.clone();
        transport.connect(events).await?;
        if !transport.is_connected() {
            return Err(RenogyError::connection("Connection failed"));
        }

        debug!("[{}] Discovering characteristics...", self.tag());
        let chars = match transport.characteristics().await {
            Ok(found) => CharacteristicPair::by_known_uuid(&found),
            Err(e) => {
                warn!("[{}] Characteristic discovery failed, using defaults: {}", self.tag(), e);
                CharacteristicPair::default()
            }
        };

        transport.start_notify(&chars.notify).await?;
        Ok(chars)
    }

    /// Unsubscribe and close; always ends `Disconnected`
    pub async fn disconnect(&self) {
        let mut session = self.session.lock().await;
        self.link.set_connected(false);
        if let Some(mut transport) = session.transport.take() {
            if let Err(e) = transport.stop_notify(&session.chars.notify).await {
                debug!("[{}] stop_notify failed: {}", self.tag(), e);
            }
            if let Err(e) = transport.disconnect().await {
                debug!("[{}] disconnect failed: {}", self.tag(), e);
            }
        }
        self.set_state(ConnectionState::Disconnected);
        info!("[{}] Disconnected", self.tag());
    }

    /// Read `word_count` registers from `unit_id` starting at `address`
    ///
    /// Returns the raw response bytes (at least 5) or `None` on any failure.
    /// Concurrent callers are served one at a time.
    pub async fn read_registers(
        &self,
        unit_id: UnitId,
        address: RegisterAddress,
        word_count: u16,
    ) -> Option<Vec<u8>> {
        if let Err(e) = validate_word_count(word_count) {
            warn!("[{}] {}", self.tag(), e);
            return None;
        }

        let mut session = self.session.lock().await;

        if !self.is_connected() {
            warn!("[{}] Not connected, attempting reconnect...", self.tag());
            if !self.connect_locked(&mut session).await {
                return None;
            }
        }

        self.link.reset();

        let function = ModbusFunction::ReadHoldingRegisters.to_u8();
        let request = build_request(unit_id, function, address, word_count);
        debug!("[{}] {}", self.tag(), describe_request(unit_id, function, address, word_count));
        log_packet("TX", &request, &self.address, Some(unit_id));

        let write_uuid = session.chars.write.clone();
        let transport = match session.transport.as_mut() {
            Some(transport) => transport,
            None => {
                error!("[{}] No session; connection was lost before write", self.tag());
                self.mark_lost();
                return None;
            }
        };

        self.set_state(ConnectionState::AwaitingResponse);
        if let Err(e) = transport.write(&write_uuid, &request).await {
            error!("[{}] Write failed: {}", self.tag(), e);
            lock(&self.stats).record_error();
            self.mark_lost();
            return None;
        }
        lock(&self.stats).record_request(request.len());

        if timeout(self.polling.response_timeout, self.link.wait_ready())
            .await
            .is_err()
        {
            warn!(
                "[{}] Timeout waiting for response (reg={}, unit={})",
                self.tag(),
                address,
                unit_id
            );
            lock(&self.stats).record_timeout();
            self.finish_request();
            return None;
        }

        // trailing fragments
        sleep(self.polling.settle_delay).await;

        let response = self.link.take();
        self.finish_request();

        if response.len() < MIN_RESPONSE_LEN {
            debug!("[{}] Short response ({} bytes)", self.tag(), response.len());
            lock(&self.stats).record_error();
            return None;
        }

        log_packet("RX", &response, &self.address, Some(unit_id));
        debug!("[{}] {}", self.tag(), describe_response(&response));
        lock(&self.stats).record_response(response.len());
        Some(response)
    }

    /// Read every register group of `device` and merge the decoded fields
    ///
    /// A non-empty result carries the [`TAG_DEVICE`], [`TAG_ADDRESS`] and
    /// [`TAG_DEVICE_TYPE`] metadata keys.
    pub async fn poll_device(&self, device: &DeviceIdentity) -> Telemetry {
        let groups = device.device_type.registers();
        debug!(
            "[{}] Device type: {}, reading {} register groups",
            device.name,
            device.device_type,
            groups.len()
        );

        let mut all_data = Telemetry::new();

        for group in groups {
            debug!(
                "[{}] Reading {} (reg={}, words={})",
                device.name, group.name, group.address, group.words
            );

            match self
                .read_registers(device.unit_id, group.address, group.words)
                .await
            {
                Some(response) if validate_response(&response, Some(device.unit_id)) => {
                    let parsed = parse_response(device.device_type, group.address, &response);
                    debug!("[{}] {}: parsed {} fields", device.name, group.name, parsed.len());
                    all_data.extend(parsed);
                }
                Some(response) => {
                    warn!(
                        "[{}] Invalid response for {}: {}",
                        device.name,
                        group.name,
                        hex::encode(&response)
                    );
                }
                None => debug!("[{}] No response for {}", device.name, group.name),
            }

            sleep(self.polling.group_delay).await;
        }

        if all_data.is_empty() {
            warn!("[{}] No data received from any registers", device.name);
            return all_data;
        }

        let fields = all_data.len();
        all_data.put(TAG_DEVICE, device.name.as_str());
        all_data.put(TAG_ADDRESS, device.address.as_str());
        all_data.put(TAG_DEVICE_TYPE, device.device_type.as_str());
        info!("[{}] Got {} data fields", device.name, fields);
        all_data
    }
}

impl fmt::Debug for PersistentConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentConnection")
            .field("address", &self.tag())
            .field("devices", &self.devices.len())
            .field("state", &self.state())
            .finish()
    }
}
