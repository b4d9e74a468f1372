//! In-memory device simulator
//!
//! [`SimulatedLink`] plays the remote side of one physical address: it keeps
//! a register image per unit id, answers read requests with CRC-framed
//! responses split into notification-sized fragments, and can be told to
//! misbehave (refuse connects, fail discovery, drop writes, stay silent,
//! lose the link).
//! [`SimulatorFactory`] hands out sessions to registered links and is what
//! tests and the `sim_poll` binary plug into the connection layer.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{RenogyError, RenogyResult};
use crate::protocol::{
    build_exception, build_response, crc16, ModbusFunction, RegisterAddress, UnitId, REQUEST_LEN,
};
use crate::transport::{
    BleTransport, CharProperties, Characteristic, LinkEvents, TransportFactory, NOTIFY_CHAR_UUID,
    WRITE_CHAR_UUID,
};
use crate::utils::MAX_REGISTERS_PER_REQUEST;

/// Illegal Function
const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;
/// Illegal Data Address
const EXCEPTION_ILLEGAL_ADDRESS: u8 = 0x02;
/// Illegal Data Value
const EXCEPTION_ILLEGAL_VALUE: u8 = 0x03;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Register image of one simulated unit
///
/// Reads of any address that was never set fail with Illegal Data Address,
/// like a real device outside its map.
#[derive(Debug, Clone, Default)]
pub struct RegisterBank {
    registers: Arc<RwLock<HashMap<RegisterAddress, u16>>>,
}

impl RegisterBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one register
    pub fn set_register(&self, address: RegisterAddress, value: u16) {
        let mut registers = self.registers.write().unwrap_or_else(|p| p.into_inner());
        registers.insert(address, value);
    }

    /// Set consecutive registers starting at `address`
    pub fn set_registers(&self, address: RegisterAddress, values: &[u16]) {
        let mut registers = self.registers.write().unwrap_or_else(|p| p.into_inner());
        for (i, &value) in values.iter().enumerate() {
            registers.insert(address.wrapping_add(i as u16), value);
        }
    }

    /// Zero `count` registers starting at `address`
    pub fn fill(&self, address: RegisterAddress, count: u16) {
        self.set_registers(address, &vec![0; count as usize]);
    }

    /// Store `text` as space-padded ASCII over `words` registers
    pub fn set_ascii(&self, address: RegisterAddress, text: &str, words: u16) {
        let mut bytes = text.as_bytes().to_vec();
        bytes.resize(words as usize * 2, b' ');
        let values: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        self.set_registers(address, &values);
    }

    /// Store a 32-bit value high word first
    pub fn set_u32(&self, address: RegisterAddress, value: u32) {
        self.set_registers(address, &[(value >> 16) as u16, value as u16]);
    }

    /// Read holding registers (function code 0x03)
    pub fn read_holding_registers(
        &self,
        address: RegisterAddress,
        quantity: u16,
    ) -> RenogyResult<Vec<u16>> {
        let registers = self.registers.read().unwrap_or_else(|p| p.into_inner());
        (0..quantity)
            .map(|i| {
                registers
                    .get(&address.wrapping_add(i))
                    .copied()
                    .ok_or_else(|| {
                        RenogyError::exception(
                            ModbusFunction::ReadHoldingRegisters.to_u8(),
                            EXCEPTION_ILLEGAL_ADDRESS,
                        )
                    })
            })
            .collect()
    }

    /// Number of populated registers
    pub fn len(&self) -> usize {
        self.registers.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A charge controller mid-afternoon: 13.2 V battery at 85%, 18.6 V PV
    pub fn controller(unit_id: UnitId) -> Self {
        let bank = Self::new();
        bank.set_ascii(12, "RNG-CTRL-RVR40", 8);
        bank.set_register(26, (unit_id as u16) << 8);

        bank.fill(256, 35);
        bank.set_registers(
            256,
            &[
                85,     // battery soc
                132,    // battery voltage x0.1
                512,    // charging current x0.01
                0x1A19, // controller 26 C, battery 25 C
                132,    // load voltage
                150,    // load current x0.01
                19,     // load power
                186,    // pv voltage x0.1
                350,    // pv current x0.01
                65,     // pv power
            ],
        );
        bank.set_registers(267, &[125, 144, 300, 20, 65, 19, 410, 45]);
        bank.set_u32(284, 12_345);
        bank.set_register(288, 0x8002); // load on, mppt

        bank.set_register(57348, 4); // lithium

        bank.fill(60000, 21);
        bank.set_registers(60000, &[40, 42, 38, 41, 39, 44, 43]);
        bank
    }

    /// A 4-cell lithium battery discharging at 2.5 A
    pub fn battery() -> Self {
        let bank = Self::new();

        bank.fill(5000, 17);
        bank.set_registers(5000, &[4, 33, 33, 33, 33]);

        bank.fill(5017, 17);
        bank.set_registers(5017, &[2, 250, 245]);

        bank.set_registers(5042, &[(-250i16) as u16, 132]);
        bank.set_u32(5044, 50_000);
        bank.set_u32(5046, 100_000);
        bank.fill(5048, 2);

        bank.fill(5100, 10);
        bank.set_register(5100 + 6, 0x0006); // both mosfets on

        bank.set_ascii(5122, "RBT100LFP12S-G1", 8);
        bank
    }

    /// An inverter on line power, 120 V in and out
    pub fn inverter() -> Self {
        let bank = Self::new();

        bank.set_registers(4000, &[1200, 250, 1200, 210, 6000, 132, 350, 0, 0, 6000]);

        bank.set_ascii(4303, "RENOGY", 8);
        bank.set_ascii(4311, "RIV1230RCH-SPS", 8);
        bank.set_ascii(4319, "V1.0.5", 8);

        bank.set_registers(4327, &[80, 150, 186, 50, 93, 2, 0]);

        bank.fill(4398, 20);
        bank.set_register(4398, 2);
        bank.set_registers(4407, &[1330, 40, 480, 500]);

        bank.set_registers(4441, &[0, 6000, 0, 0]);

        bank.fill(4543, 25);
        bank.set_registers(4543, &[12, 8, 15, 22]);
        bank
    }
}

struct LinkInner {
    address: String,
    units: RwLock<HashMap<UnitId, RegisterBank>>,
    characteristics: Vec<Characteristic>,
    fail_discovery: AtomicBool,
    active: Mutex<Option<(u64, Arc<dyn LinkEvents>)>>,
    generation: AtomicU64,
    fragment_size: AtomicUsize,
    response_delay: Mutex<Duration>,
    fail_connects: AtomicU32,
    fail_subscribe: AtomicBool,
    fail_writes: AtomicBool,
    silent: AtomicBool,
    connect_attempts: AtomicU32,
    sessions_opened: AtomicU32,
    open_sessions: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    requests: Mutex<Vec<Vec<u8>>>,
}

/// Remote side of one physical address
#[derive(Clone)]
pub struct SimulatedLink {
    inner: Arc<LinkInner>,
}

impl SimulatedLink {
    /// An empty link exposing the well-known characteristics
    pub fn new(address: impl Into<String>) -> Self {
        let write = CharProperties {
            write: true,
            write_without_response: true,
            ..Default::default()
        };
        let notify = CharProperties {
            notify: true,
            ..Default::default()
        };
        Self {
            inner: Arc::new(LinkInner {
                address: address.into(),
                units: RwLock::new(HashMap::new()),
                characteristics: vec![
                    Characteristic::new("00002a00-0000-1000-8000-00805f9b34fb", CharProperties::default()),
                    Characteristic::new(WRITE_CHAR_UUID, write),
                    Characteristic::new(NOTIFY_CHAR_UUID, notify),
                ],
                fail_discovery: AtomicBool::new(false),
                active: Mutex::new(None),
                generation: AtomicU64::new(0),
                fragment_size: AtomicUsize::new(0),
                response_delay: Mutex::new(Duration::ZERO),
                fail_connects: AtomicU32::new(0),
                fail_subscribe: AtomicBool::new(false),
                fail_writes: AtomicBool::new(false),
                silent: AtomicBool::new(false),
                connect_attempts: AtomicU32::new(0),
                sessions_opened: AtomicU32::new(0),
                open_sessions: AtomicU32::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A link with a single charge controller at `unit_id`
    pub fn with_controller(unit_id: UnitId) -> Self {
        let link = Self::new("sim");
        link.add_unit(unit_id, RegisterBank::controller(unit_id));
        link
    }

    /// A link with a single battery at `unit_id`
    pub fn with_battery(unit_id: UnitId) -> Self {
        let link = Self::new("sim");
        link.add_unit(unit_id, RegisterBank::battery());
        link
    }

    /// A link with a single inverter at `unit_id`
    pub fn with_inverter(unit_id: UnitId) -> Self {
        let link = Self::new("sim");
        link.add_unit(unit_id, RegisterBank::inverter());
        link
    }

    /// Attach a unit; an existing bank at `unit_id` is replaced
    pub fn add_unit(&self, unit_id: UnitId, bank: RegisterBank) {
        self.inner
            .units
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(unit_id, bank);
    }

    /// Register image of `unit_id`, if attached
    pub fn unit(&self, unit_id: UnitId) -> Option<RegisterBank> {
        self.inner
            .units
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&unit_id)
            .cloned()
    }

    /// Fail service discovery on every session
    pub fn set_fail_discovery(&self, fail: bool) {
        self.inner.fail_discovery.store(fail, Ordering::SeqCst);
    }

    /// Split responses into notifications of at most `size` bytes (0 = whole)
    pub fn set_fragment_size(&self, size: usize) {
        self.inner.fragment_size.store(size, Ordering::SeqCst);
    }

    /// Deliver responses after `delay` instead of during the write
    pub fn set_response_delay(&self, delay: Duration) {
        *lock(&self.inner.response_delay) = delay;
    }

    /// Refuse the next `count` connect attempts
    pub fn set_fail_connects(&self, count: u32) {
        self.inner.fail_connects.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.inner.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Accept writes but never answer
    pub fn set_silent(&self, silent: bool) {
        self.inner.silent.store(silent, Ordering::SeqCst);
    }

    /// Drop the active session and report link loss to its subscriber
    pub fn drop_link(&self) {
        let active = lock(&self.inner.active).take();
        if let Some((generation, events)) = active {
            if self.inner.generation.load(Ordering::SeqCst) == generation {
                self.inner.generation.fetch_add(1, Ordering::SeqCst);
                self.close_session();
            }
            events.on_disconnect();
        }
    }

    pub fn connect_attempts(&self) -> u32 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> u32 {
        self.inner.sessions_opened.load(Ordering::SeqCst)
    }

    /// Sessions currently open (connected and not yet closed)
    pub fn open_sessions(&self) -> u32 {
        self.inner.open_sessions.load(Ordering::SeqCst)
    }

    /// Highest number of requests awaiting their response at once
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    /// Every request frame written so far
    pub fn requests(&self) -> Vec<Vec<u8>> {
        lock(&self.inner.requests).clone()
    }

    fn close_session(&self) {
        let _ = self
            .inner
            .open_sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Answer one request frame; `None` means the addressed unit is absent
    fn respond(&self, frame: &[u8]) -> Option<Vec<u8>> {
        if frame.len() != REQUEST_LEN {
            warn!("Simulator: malformed request length {}", frame.len());
            return None;
        }
        let received = u16::from_le_bytes([frame[6], frame[7]]);
        if crc16(&frame[..6]) != received {
            warn!("Simulator: request CRC mismatch");
            return None;
        }

        let unit_id = frame[0];
        let function = frame[1];
        let address = u16::from_be_bytes([frame[2], frame[3]]);
        let quantity = u16::from_be_bytes([frame[4], frame[5]]);

        let bank = self.unit(unit_id)?;

        if ModbusFunction::from_u8(function).is_err() {
            return Some(build_exception(unit_id, function, EXCEPTION_ILLEGAL_FUNCTION));
        }
        if quantity == 0 || quantity > MAX_REGISTERS_PER_REQUEST {
            return Some(build_exception(unit_id, function, EXCEPTION_ILLEGAL_VALUE));
        }

        match bank.read_holding_registers(address, quantity) {
            Ok(values) => {
                let mut payload = BytesMut::with_capacity(values.len() * 2);
                for value in values {
                    payload.put_u16(value);
                }
                Some(build_response(unit_id, function, &payload))
            }
            Err(RenogyError::Exception { code, .. }) => Some(build_exception(unit_id, function, code)),
            Err(e) => {
                debug!("Simulator: read failed: {}", e);
                Some(build_exception(unit_id, function, EXCEPTION_ILLEGAL_ADDRESS))
            }
        }
    }

    fn fragments(&self, response: Vec<u8>) -> Vec<Bytes> {
        let size = self.inner.fragment_size.load(Ordering::SeqCst);
        let mut remaining = Bytes::from(response);
        if size == 0 {
            return vec![remaining];
        }
        let mut fragments = Vec::new();
        while !remaining.is_empty() {
            let take = size.min(remaining.len());
            fragments.push(remaining.split_to(take));
        }
        fragments
    }

    fn begin_request(&self) {
        let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn end_request(&self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One client session against a [`SimulatedLink`]
pub struct SimulatedSession {
    link: SimulatedLink,
    events: Option<Arc<dyn LinkEvents>>,
    generation: Option<u64>,
    subscribed: Option<String>,
}

impl SimulatedSession {
    pub fn new(link: SimulatedLink) -> Self {
        Self {
            link,
            events: None,
            generation: None,
            subscribed: None,
        }
    }
}

#[async_trait]
impl BleTransport for SimulatedSession {
    async fn connect(&mut self, events: Arc<dyn LinkEvents>) -> RenogyResult<()> {
        let inner = &self.link.inner;
        inner.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let refused = inner
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(RenogyError::connection(format!(
                "Device {} not reachable",
                inner.address
            )));
        }

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&inner.active) = Some((generation, events.clone()));
        inner.sessions_opened.fetch_add(1, Ordering::SeqCst);
        inner.open_sessions.fetch_add(1, Ordering::SeqCst);

        self.events = Some(events);
        self.generation = Some(generation);
        Ok(())
    }

    async fn characteristics(&mut self) -> RenogyResult<Vec<Characteristic>> {
        if self.link.inner.fail_discovery.load(Ordering::SeqCst) {
            return Err(RenogyError::connection("Services not resolved"));
        }
        Ok(self.link.inner.characteristics.clone())
    }

    async fn start_notify(&mut self, uuid: &str) -> RenogyResult<()> {
        if !self.is_connected() {
            return Err(RenogyError::connection("Not connected"));
        }
        if self.link.inner.fail_subscribe.load(Ordering::SeqCst) {
            return Err(RenogyError::connection(format!("Subscribe to {} rejected", uuid)));
        }
        self.subscribed = Some(uuid.to_string());
        Ok(())
    }

    async fn stop_notify(&mut self, _uuid: &str) -> RenogyResult<()> {
        self.subscribed = None;
        Ok(())
    }

    async fn write(&mut self, uuid: &str, data: &[u8]) -> RenogyResult<()> {
        if !self.is_connected() {
            return Err(RenogyError::connection("Not connected"));
        }
        if self.link.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(RenogyError::connection("Write failed"));
        }
        if !uuid.eq_ignore_ascii_case(WRITE_CHAR_UUID) {
            return Err(RenogyError::protocol(format!(
                "Characteristic {} is not writable",
                uuid
            )));
        }

        lock(&self.link.inner.requests).push(data.to_vec());

        if self.link.inner.silent.load(Ordering::SeqCst) {
            return Ok(());
        }
        let (Some(events), Some(_)) = (self.events.clone(), self.subscribed.as_ref()) else {
            return Ok(());
        };
        let Some(response) = self.link.respond(data) else {
            return Ok(());
        };

        let fragments = self.link.fragments(response);
        let delay = *lock(&self.link.inner.response_delay);
        let link = self.link.clone();
        link.begin_request();

        if delay.is_zero() {
            for fragment in &fragments {
                events.on_notification(fragment);
            }
            link.end_request();
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                for fragment in &fragments {
                    events.on_notification(fragment);
                }
                link.end_request();
            });
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> RenogyResult<()> {
        if let Some(generation) = self.generation.take() {
            let inner = &self.link.inner;
            if inner.generation.load(Ordering::SeqCst) == generation {
                inner.generation.fetch_add(1, Ordering::SeqCst);
                lock(&inner.active).take();
                self.link.close_session();
            }
        }
        self.events = None;
        self.subscribed = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        match self.generation {
            Some(generation) => self.link.inner.generation.load(Ordering::SeqCst) == generation,
            None => false,
        }
    }
}

/// Hands out [`SimulatedSession`]s for registered addresses
#[derive(Clone, Default)]
pub struct SimulatorFactory {
    links: Arc<RwLock<HashMap<String, SimulatedLink>>>,
    created: Arc<AtomicU32>,
}

impl SimulatorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `link` under `address` (case-insensitive)
    pub fn add_link(&self, address: &str, link: SimulatedLink) {
        self.links
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(address.to_ascii_uppercase(), link);
    }

    pub fn link(&self, address: &str) -> Option<SimulatedLink> {
        self.links
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&address.to_ascii_uppercase())
            .cloned()
    }

    /// Sessions created so far across all addresses
    pub fn sessions_created(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }
}

impl TransportFactory for SimulatorFactory {
    fn create(&self, address: &str) -> RenogyResult<Box<dyn BleTransport>> {
        let link = self
            .link(address)
            .ok_or_else(|| RenogyError::connection(format!("Device {} not found", address)))?;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedSession::new(link)))
    }
}
