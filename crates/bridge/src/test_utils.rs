//! Test doubles for the peripheral, storage and restart seams
//!
//! Used by the unit tests and by the integration tests under `tests/`.

use bytes::Bytes;
use protocol::LineCoding;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::restart::Restarter;
use crate::storage::pipeline::{ChunkRead, ChunkSource};
use crate::storage::region::{ERASED, StorageRegion, check_bounds};
use crate::storage::target::{ContentStoreTarget, ReplacementTarget, TargetFactory, TargetKind};
use crate::usb::{DeviceError, DeviceOpener, SerialDevice};

/// Generous upper bound for waits in tests
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[derive(Default)]
struct MockState {
    inbound: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    line_coding: Option<LineCoding>,
    fail_line_coding: bool,
    max_write: Option<usize>,
    unplugged: bool,
    opened: bool,
    released: bool,
}

type Shared = Arc<(Mutex<MockState>, Condvar)>;

/// In-memory serial peripheral
pub struct MockSerialDevice {
    name: String,
    shared: Shared,
}

/// Test-side control of a [`MockSerialDevice`]
#[derive(Clone)]
pub struct MockDeviceHandle {
    shared: Shared,
}

impl MockSerialDevice {
    /// A device already counted as open
    pub fn new(name: &str) -> (Self, MockDeviceHandle) {
        let (device, handle) = Self::unopened(name);
        lock(&device.shared.0).opened = true;
        (device, handle)
    }

    fn unopened(name: &str) -> (Self, MockDeviceHandle) {
        let shared: Shared = Arc::new((Mutex::new(MockState::default()), Condvar::new()));
        (
            Self {
                name: name.to_string(),
                shared: shared.clone(),
            },
            MockDeviceHandle { shared },
        )
    }
}

impl Drop for MockSerialDevice {
    fn drop(&mut self) {
        lock(&self.shared.0).released = true;
    }
}

impl SerialDevice for MockSerialDevice {
    fn apply_line_coding(&self, coding: &LineCoding) -> Result<(), DeviceError> {
        let mut state = lock(&self.shared.0);
        if state.fail_line_coding {
            return Err(DeviceError::Io("control transfer stalled".into()));
        }
        state.line_coding = Some(*coding);
        Ok(())
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, DeviceError> {
        let (mutex, cond) = &*self.shared;
        let state = lock(mutex);
        let (mut state, _) = cond
            .wait_timeout_while(state, timeout, |s| s.inbound.is_empty() && !s.unplugged)
            .unwrap_or_else(PoisonError::into_inner);

        if state.unplugged {
            return Err(DeviceError::Disconnected);
        }
        let Some(mut chunk) = state.inbound.pop_front() else {
            return Err(DeviceError::Timeout);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            state.inbound.push_front(chunk.split_off(n));
        }
        Ok(n)
    }

    fn write(&self, data: &[u8], _timeout: Duration) -> Result<usize, DeviceError> {
        let mut state = lock(&self.shared.0);
        if state.unplugged {
            return Err(DeviceError::Disconnected);
        }
        let n = state.max_write.map_or(data.len(), |max| data.len().min(max));
        state.written.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn describe(&self) -> String {
        format!("mock:{}", self.name)
    }
}

impl MockDeviceHandle {
    /// Queue one inbound chunk
    pub fn push(&self, data: &[u8]) {
        let (mutex, cond) = &*self.shared;
        lock(mutex).inbound.push_back(data.to_vec());
        cond.notify_all();
    }

    /// Simulate device removal
    pub fn unplug(&self) {
        let (mutex, cond) = &*self.shared;
        lock(mutex).unplugged = true;
        cond.notify_all();
    }

    /// Everything written to the device so far
    pub fn written(&self) -> Vec<u8> {
        lock(&self.shared.0).written.clone()
    }

    /// Line coding applied at open, if any
    pub fn line_coding(&self) -> Option<LineCoding> {
        lock(&self.shared.0).line_coding
    }

    /// Make the next line coding request fail
    pub fn fail_line_coding(&self) {
        lock(&self.shared.0).fail_line_coding = true;
    }

    /// Accept at most `max` bytes per write call
    pub fn limit_write(&self, max: usize) {
        lock(&self.shared.0).max_write = Some(max);
    }

    /// Handed out by an opener, not yet released and not unplugged
    pub fn is_open(&self) -> bool {
        let state = lock(&self.shared.0);
        state.opened && !state.released && !state.unplugged
    }
}

#[derive(Default)]
struct Script {
    failures: usize,
    devices: VecDeque<MockSerialDevice>,
    open_calls: usize,
}

/// Opener that hands out queued mock devices
pub struct ScriptedOpener {
    script: Arc<Mutex<Script>>,
}

/// Test-side control of a [`ScriptedOpener`]
#[derive(Clone)]
pub struct OpenerScript {
    script: Arc<Mutex<Script>>,
}

impl ScriptedOpener {
    pub fn new() -> (Self, OpenerScript) {
        let script = Arc::new(Mutex::new(Script::default()));
        (
            Self {
                script: script.clone(),
            },
            OpenerScript { script },
        )
    }
}

impl DeviceOpener for ScriptedOpener {
    fn open(&mut self, timeout: Duration) -> Result<Box<dyn SerialDevice>, DeviceError> {
        let next = {
            let mut script = lock(&self.script);
            script.open_calls += 1;
            if script.failures > 0 {
                script.failures -= 1;
                None
            } else {
                script.devices.pop_front()
            }
        };

        match next {
            Some(device) => {
                lock(&device.shared.0).opened = true;
                Ok(Box::new(device))
            }
            None => {
                std::thread::sleep(timeout);
                Err(DeviceError::NotFound)
            }
        }
    }
}

impl OpenerScript {
    /// Fail the next `n` open attempts regardless of queued devices
    pub fn fail_next(&self, n: usize) {
        lock(&self.script).failures += n;
    }

    /// Queue a device for a later open
    pub fn push_device(&self, name: &str) -> MockDeviceHandle {
        let (device, handle) = MockSerialDevice::unopened(name);
        lock(&self.script).devices.push_back(device);
        handle
    }

    pub fn open_calls(&self) -> usize {
        lock(&self.script).open_calls
    }
}

#[derive(Debug)]
struct RegionState {
    data: Vec<u8>,
    erases: usize,
    writes_left: Option<usize>,
    fail_erase: bool,
    corrupt: bool,
}

/// In-memory storage region; clones share content
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    capacity: u64,
    state: Arc<Mutex<RegionState>>,
}

impl MemoryRegion {
    /// A fully erased region
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            state: Arc::new(Mutex::new(RegionState {
                data: vec![ERASED; capacity as usize],
                erases: 0,
                writes_left: None,
                fail_erase: false,
                corrupt: false,
            })),
        }
    }

    /// Overwrite the start of the region outside any job
    pub fn fill(&self, content: &[u8]) {
        lock(&self.state).data[..content.len()].copy_from_slice(content);
    }

    pub fn contents(&self) -> Vec<u8> {
        lock(&self.state).data.clone()
    }

    pub fn erase_count(&self) -> usize {
        lock(&self.state).erases
    }

    /// Let `n` more writes succeed, then fail every write
    pub fn fail_writes_after(&self, n: usize) {
        lock(&self.state).writes_left = Some(n);
    }

    pub fn fail_erase(&self) {
        lock(&self.state).fail_erase = true;
    }

    /// Store flipped bits so readback verification fails
    pub fn corrupt_writes(&self) {
        lock(&self.state).corrupt = true;
    }
}

impl StorageRegion for MemoryRegion {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn erase(&mut self) -> io::Result<()> {
        let mut state = lock(&self.state);
        if state.fail_erase {
            return Err(io::Error::other("erase failed"));
        }
        state.data.fill(ERASED);
        state.erases += 1;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        check_bounds(self.capacity, offset, data.len())?;
        let mut state = lock(&self.state);
        if let Some(left) = state.writes_left.as_mut() {
            if *left == 0 {
                return Err(io::Error::other("write failed"));
            }
            *left -= 1;
        }
        let corrupt = state.corrupt;
        let start = offset as usize;
        let dest = &mut state.data[start..start + data.len()];
        dest.copy_from_slice(data);
        if corrupt {
            dest.iter_mut().for_each(|b| *b ^= 0x01);
        }
        Ok(())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let state = lock(&self.state);
        let start = (offset as usize).min(state.data.len());
        let n = buf.len().min(state.data.len() - start);
        buf[..n].copy_from_slice(&state.data[start..start + n]);
        Ok(n)
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Target factory over a shared [`MemoryRegion`]
///
/// Targets behave like the content store: erase, then write in place.
pub struct MemoryStoreFactory {
    region: MemoryRegion,
}

impl MemoryStoreFactory {
    pub fn new(region: MemoryRegion) -> Self {
        Self { region }
    }
}

impl TargetFactory for MemoryStoreFactory {
    fn kind(&self) -> TargetKind {
        TargetKind::ContentStore
    }

    fn capacity(&self) -> u64 {
        self.region.capacity
    }

    fn create(&self) -> io::Result<Box<dyn ReplacementTarget>> {
        Ok(Box::new(ContentStoreTarget::new(Box::new(
            self.region.clone(),
        ))))
    }
}

/// One scripted step of a [`ScriptedSource`]
#[derive(Debug, Clone)]
pub enum SourceStep {
    Data(Vec<u8>),
    Timeout,
    Error(io::ErrorKind),
    End,
}

/// Chunk source replaying a fixed script
pub struct ScriptedSource {
    steps: VecDeque<SourceStep>,
    pending: Bytes,
    honor_max: bool,
}

impl ScriptedSource {
    pub fn new(steps: Vec<SourceStep>) -> Self {
        Self {
            steps: steps.into(),
            pending: Bytes::new(),
            honor_max: true,
        }
    }

    /// `payload` split into `chunk`-sized data steps
    pub fn from_payload(payload: &[u8], chunk: usize) -> Self {
        Self::new(
            payload
                .chunks(chunk.max(1))
                .map(|c| SourceStep::Data(c.to_vec()))
                .collect(),
        )
    }

    /// Return whole data steps even when larger than requested
    pub fn ignoring_max(mut self) -> Self {
        self.honor_max = false;
        self
    }
}

impl ChunkSource for ScriptedSource {
    async fn next_chunk(&mut self, max: usize) -> io::Result<ChunkRead> {
        loop {
            if !self.pending.is_empty() {
                let n = if self.honor_max {
                    max.min(self.pending.len())
                } else {
                    self.pending.len()
                };
                return Ok(ChunkRead::Data(self.pending.split_to(n)));
            }
            match self.steps.pop_front() {
                Some(SourceStep::Data(data)) => self.pending = Bytes::from(data),
                Some(SourceStep::Timeout) => return Ok(ChunkRead::TimedOut),
                Some(SourceStep::Error(kind)) => return Err(io::Error::from(kind)),
                Some(SourceStep::End) | None => return Ok(ChunkRead::End),
            }
        }
    }
}

/// Restarter that only records requests
#[derive(Debug, Default)]
pub struct RecordingRestarter {
    requests: Mutex<Vec<(Duration, String)>>,
}

impl RecordingRestarter {
    pub fn requests(&self) -> Vec<(Duration, String)> {
        lock(&self.requests).clone()
    }
}

impl Restarter for RecordingRestarter {
    fn schedule_restart(&self, delay: Duration, reason: &str) {
        lock(&self.requests).push((delay, reason.to_string()));
    }
}
