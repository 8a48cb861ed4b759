//! Common test utilities: a simulated firmware behind the `Bus` trait

#![allow(dead_code)]

pub mod sink;
pub use sink::RecordingSink;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use acx_wlan::command::{IeHeader, IE_HEADER_LEN, MAILBOX_PARAM_OFFSET, MAILBOX_PARAM_SIZE};
use acx_wlan::{
    Bus, Clock, Command, Device, DeviceConfig, DeviceRef, FirmwareStatus, IrqReason, Parameter,
    RateMask, Reg, SharedSlots, SlotStatus, StatusFlags,
};

pub type TestDevice = Device<SimBus, RecordingSink>;

/// Version string the simulated firmware reports.
pub const FW_VERSION: &str = "Rev 1.9.8.b";
pub const FW_HW_ID: u32 = 0x0001_0111;

const MAILBOX_LEN: usize = MAILBOX_PARAM_OFFSET + MAILBOX_PARAM_SIZE;

/// One host region mapped for DMA.
struct Mapping {
    device_base: u32,
    host: usize,
    len: usize,
}

struct SimState {
    irq_status: u16,
    irq_mask: u16,
    mailbox: [u8; MAILBOX_LEN],
    params: HashMap<u16, Vec<u8>>,
    responsive: bool,
    fail_next: Option<FirmwareStatus>,
    commands: Vec<Command>,
    tx_doorbells: u32,
    tx: Option<SharedSlots>,
    rx: Option<SharedSlots>,
    tx_cursor: usize,
    rx_cursor: usize,
    mappings: Vec<Mapping>,
    next_dma: u32,
    sent: Vec<Vec<u8>>,
}

/// In-memory device: registers, mailbox, DMA window and a firmware that
/// answers commands as soon as the doorbell rings.
#[derive(Clone)]
pub struct SimBus {
    state: Arc<Mutex<SimState>>,
    epoch: Instant,
}

impl SimBus {
    pub fn new() -> Self {
        let mut params = HashMap::new();
        let mut rev = vec![0u8; 24];
        rev[..FW_VERSION.len()].copy_from_slice(FW_VERSION.as_bytes());
        rev[20..].copy_from_slice(&FW_HW_ID.to_le_bytes());
        params.insert(Parameter::FirmwareRevision.id(), rev);

        Self {
            state: Arc::new(Mutex::new(SimState {
                irq_status: 0,
                irq_mask: 0xffff,
                mailbox: [0; MAILBOX_LEN],
                params,
                responsive: true,
                fail_next: None,
                commands: Vec::new(),
                tx_doorbells: 0,
                tx: None,
                rx: None,
                tx_cursor: 0,
                rx_cursor: 0,
                mappings: Vec::new(),
                next_dma: 0x0010_0000,
                sent: Vec::new(),
            })),
            epoch: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    // ─── firmware knobs ────────────────────────────────────────────────

    /// An unresponsive firmware never completes commands.
    pub fn set_responsive(&self, responsive: bool) {
        self.lock().responsive = responsive;
    }

    /// Complete the next command with `status` instead of running it.
    pub fn fail_next(&self, status: FirmwareStatus) {
        self.lock().fail_next = Some(status);
    }

    /// Stored value of an information element.
    pub fn param(&self, param: Parameter) -> Option<Vec<u8>> {
        self.lock().params.get(&param.id()).cloned()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.lock().commands.clone()
    }

    pub fn tx_doorbells(&self) -> u32 {
        self.lock().tx_doorbells
    }

    // ─── interrupt line ────────────────────────────────────────────────

    pub fn raise(&self, reason: IrqReason) {
        self.lock().irq_status |= reason.bits();
    }

    /// An unmasked reason is pending.
    pub fn irq_pending(&self) -> bool {
        let s = self.lock();
        s.irq_status & !s.irq_mask != 0
    }

    pub fn irq_mask(&self) -> u16 {
        self.lock().irq_mask
    }

    pub fn irq_status(&self) -> u16 {
        self.lock().irq_status
    }

    // ─── rings ─────────────────────────────────────────────────────────

    pub fn rings_attached(&self) -> bool {
        let s = self.lock();
        s.tx.is_some() && s.rx.is_some()
    }

    /// Device-owned Tx slots.
    pub fn tx_pending(&self) -> usize {
        let s = self.lock();
        s.tx
            .as_ref()
            .map_or(0, |slots| slots.iter().filter(|d| d.device().owned()).count())
    }

    /// Device-owned (posted) Rx slots.
    pub fn rx_posted(&self) -> usize {
        let s = self.lock();
        s.rx
            .as_ref()
            .map_or(0, |slots| slots.iter().filter(|d| d.device().owned()).count())
    }

    /// Frames the device has transmitted, in completion order.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.lock().sent.clone()
    }

    /// Restart the device-side cursors at slot 0 (after a ring reset).
    pub fn reset_cursors(&self) {
        let mut s = self.lock();
        s.tx_cursor = 0;
        s.rx_cursor = 0;
    }

    /// Complete up to `count` Tx slots in FIFO order with `status` and
    /// raise `TX_COMPLETE`. Returns how many were completed.
    pub fn complete_tx(&self, count: usize, status: SlotStatus) -> usize {
        let mut s = self.lock();
        let Some(slots) = s.tx.clone() else {
            return 0;
        };
        let mut done = 0;
        while done < count {
            let slot = &slots[s.tx_cursor];
            let dev = slot.device();
            if !dev.owned() {
                break;
            }
            let frame = s.dma_read(dev.buffer_ref(), dev.length() as usize);
            s.sent.push(frame);
            dev.complete(status);
            s.tx_cursor = (s.tx_cursor + 1) % slots.len();
            done += 1;
        }
        if done > 0 {
            s.irq_status |= IrqReason::TX_COMPLETE.bits();
        }
        done
    }

    /// Complete `count` Tx slots as delivered at `rate`.
    pub fn ack_tx(&self, count: usize, rate: RateMask) -> usize {
        self.complete_tx(
            count,
            SlotStatus {
                rate,
                ..SlotStatus::default()
            },
        )
    }

    /// Write `frame` into the next posted Rx buffer and raise
    /// `RX_COMPLETE`. Returns false if no buffer is posted.
    pub fn deliver_rx(&self, frame: &[u8], status: SlotStatus) -> bool {
        let mut s = self.lock();
        let Some(slots) = s.rx.clone() else {
            return false;
        };
        let slot = &slots[s.rx_cursor];
        let dev = slot.device();
        if !dev.owned() || frame.len() > dev.length() as usize {
            return false;
        }
        s.dma_write(dev.buffer_ref(), frame);
        dev.complete(SlotStatus {
            length: frame.len() as u16,
            ..status
        });
        s.rx_cursor = (s.rx_cursor + 1) % slots.len();
        s.irq_status |= IrqReason::RX_COMPLETE.bits();
        true
    }

    /// Scribble an invalid ownership byte over a Tx slot.
    pub fn corrupt_tx(&self, index: usize, raw: u8) {
        let s = self.lock();
        if let Some(slots) = s.tx.as_ref() {
            slots[index].device().mirror_owner(raw);
        }
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimState {
    fn host_addr(&self, dref: DeviceRef) -> usize {
        let raw = dref.raw();
        let map = self
            .mappings
            .iter()
            .find(|m| raw >= m.device_base && ((raw - m.device_base) as usize) < m.len)
            .expect("device reference outside every mapping");
        map.host + (raw - map.device_base) as usize
    }

    fn dma_read(&self, dref: DeviceRef, len: usize) -> Vec<u8> {
        let host = self.host_addr(dref) as *const u8;
        // SAFETY: the slot is device-owned, so the host isn't touching the
        // buffer, and the mapping covers it.
        unsafe { std::slice::from_raw_parts(host, len).to_vec() }
    }

    fn dma_write(&self, dref: DeviceRef, data: &[u8]) {
        let host = self.host_addr(dref) as *mut u8;
        // SAFETY: as above.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), host, data.len()) };
    }

    fn run_command(&mut self) {
        if !self.responsive {
            return;
        }
        let code = u16::from_le_bytes([self.mailbox[0], self.mailbox[1]]);
        let cmd = Command::from_code(code);
        let status = match (self.fail_next.take(), cmd) {
            (Some(status), Some(cmd)) => {
                self.commands.push(cmd);
                status
            }
            (_, None) => FirmwareStatus::UnknownCommand,
            (None, Some(cmd)) => {
                self.commands.push(cmd);
                self.apply(cmd)
            }
        };
        self.mailbox[2..4].copy_from_slice(&status.to_raw().to_le_bytes());
        self.irq_status |= IrqReason::CMD_COMPLETE.bits();
    }

    fn apply(&mut self, cmd: Command) -> FirmwareStatus {
        let params = &self.mailbox[MAILBOX_PARAM_OFFSET..];
        match cmd {
            Command::Configure => {
                let Some(header) = IeHeader::decode(params) else {
                    return FirmwareStatus::InvalidParameter;
                };
                if header.id == Parameter::FirmwareRevision.id() {
                    return FirmwareStatus::ReadOnly;
                }
                let data = params[IE_HEADER_LEN..IE_HEADER_LEN + header.len as usize].to_vec();
                self.params.insert(header.id, data);
                FirmwareStatus::Success
            }
            Command::Interrogate => {
                let Some(header) = IeHeader::decode(params) else {
                    return FirmwareStatus::InvalidParameter;
                };
                let len = header.len as usize;
                let mut value = self.params.get(&header.id).cloned().unwrap_or_default();
                value.resize(len, 0);
                let start = MAILBOX_PARAM_OFFSET + IE_HEADER_LEN;
                self.mailbox[start..start + len].copy_from_slice(&value);
                FirmwareStatus::Success
            }
            _ => FirmwareStatus::Success,
        }
    }
}

impl Clock for SimBus {
    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    fn sleep_us(&self, us: u64) {
        thread::sleep(Duration::from_micros(us));
    }
}

impl Bus for SimBus {
    fn read_reg(&self, reg: Reg) -> u32 {
        let s = self.lock();
        match reg {
            Reg::IrqStatus => u32::from(s.irq_status),
            Reg::IrqMask => u32::from(s.irq_mask),
            _ => 0,
        }
    }

    fn write_reg(&self, reg: Reg, value: u32) {
        let mut s = self.lock();
        match reg {
            Reg::IrqAck => s.irq_status &= !(value as u16),
            Reg::IrqMask => s.irq_mask = value as u16,
            Reg::CommandDoorbell => s.run_command(),
            Reg::TxDoorbell => s.tx_doorbells += 1,
            Reg::IrqStatus => {}
        }
    }

    fn write_mailbox(&self, offset: usize, data: &[u8]) {
        self.lock().mailbox[offset..offset + data.len()].copy_from_slice(data);
    }

    fn read_mailbox(&self, offset: usize, out: &mut [u8]) {
        let len = out.len();
        out.copy_from_slice(&self.lock().mailbox[offset..offset + len]);
    }

    fn map_buffer(&self, host: *mut u8, len: usize) -> DeviceRef {
        let mut s = self.lock();
        let device_base = s.next_dma;
        s.next_dma += (len as u32 + 0xfff) & !0xfff;
        s.mappings.push(Mapping {
            device_base,
            host: host as usize,
            len,
        });
        DeviceRef::from_raw(device_base)
    }

    fn attach_rings(&self, tx: SharedSlots, rx: SharedSlots) {
        let mut s = self.lock();
        s.tx = Some(tx);
        s.rx = Some(rx);
        s.tx_cursor = 0;
        s.rx_cursor = 0;
    }

    fn detach_rings(&self) {
        let mut s = self.lock();
        s.tx = None;
        s.rx = None;
        s.mappings.clear();
    }
}

// ─── helpers ───────────────────────────────────────────────────────────────

/// Small config with short timeouts for tests.
pub fn test_config() -> DeviceConfig {
    DeviceConfig {
        command_timeout_us: 50_000,
        command_poll_us: 50,
        ..DeviceConfig::default()
    }
}

/// Device over a fresh `SimBus`; returns the device and a handle on the bus.
pub fn device(config: DeviceConfig) -> (Arc<TestDevice>, SimBus) {
    let bus = SimBus::new();
    let dev = Device::new(bus.clone(), RecordingSink::default(), config).unwrap();
    (Arc::new(dev), bus)
}

/// Device already brought up.
pub fn up_device(config: DeviceConfig) -> (Arc<TestDevice>, SimBus) {
    let (dev, bus) = device(config);
    dev.bring_up().unwrap();
    (dev, bus)
}

/// Thread standing in for the interrupt line: runs the top half whenever
/// an unmasked reason is pending. Stops on drop.
pub struct IrqLine {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl IrqLine {
    pub fn spawn(dev: Arc<TestDevice>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::Relaxed) {
                if dev.bus().irq_pending() {
                    dev.handle_interrupt();
                } else {
                    thread::sleep(Duration::from_micros(20));
                }
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for IrqLine {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Status for a failed Tx slot.
pub fn failed_status(rate: RateMask) -> SlotStatus {
    SlotStatus {
        flags: StatusFlags::ERROR,
        rate,
        ..SlotStatus::default()
    }
}
