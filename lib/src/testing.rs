//! Test doubles for the driver and mapper collaborators.
use crate::driver::{
    CaptureDriver, CaptureRequest, CaptureResult, DriverError, NotifyMessage, ResultSink,
    StreamConfiguration,
};
use crate::memory::{
    BufferGeometry, BufferHandle, BufferIdentity, BufferMapper, MapError, MappedBuffer,
};
use crate::settings::{RequestSettings, RequestTemplate};

use nix::errno::Errno;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// Mapper that hands out fake addresses and counts its calls.
#[derive(Default)]
pub struct CountingMapper {
    maps: AtomicUsize,
    unmaps: AtomicUsize,
    allocations: AtomicUsize,
    next_handle: AtomicU64,
    fail_next: AtomicBool,
}

impl CountingMapper {
    pub fn new() -> Self {
        Default::default()
    }

    /// Make the next call to `map` or `allocate` fail with `MapError::Exhausted`.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn num_maps(&self) -> usize {
        self.maps.load(Ordering::SeqCst)
    }

    pub fn num_unmaps(&self) -> usize {
        self.unmaps.load(Ordering::SeqCst)
    }

    pub fn num_allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    /// The CPU address `identity` gets mapped at.
    pub fn address_of(&self, identity: BufferIdentity) -> usize {
        match identity {
            BufferIdentity::DmaBuf(fd) => 0x4000_0000 + fd as usize * 0x10_0000,
            BufferIdentity::UserPtr(addr) => addr,
        }
    }

    fn check_failure(&self) -> Result<(), MapError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            Err(MapError::Exhausted)
        } else {
            Ok(())
        }
    }

    fn new_handle(&self) -> BufferHandle {
        BufferHandle(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

impl BufferMapper for CountingMapper {
    fn map(
        &self,
        identity: BufferIdentity,
        geometry: &BufferGeometry,
    ) -> Result<MappedBuffer, MapError> {
        if !identity.is_valid() {
            return Err(MapError::InvalidIdentity(identity));
        }
        self.check_failure()?;
        self.maps.fetch_add(1, Ordering::SeqCst);

        Ok(MappedBuffer::new(
            identity,
            *geometry,
            self.new_handle(),
            self.address_of(identity),
        ))
    }

    fn unmap(&self, _buffer: &MappedBuffer) {
        self.unmaps.fetch_add(1, Ordering::SeqCst);
    }

    fn allocate(&self, geometry: &BufferGeometry) -> Result<MappedBuffer, MapError> {
        self.check_failure()?;
        let index = self.allocations.fetch_add(1, Ordering::SeqCst);
        let addr = 0x8000_0000 + index * 0x10_0000;

        Ok(MappedBuffer::new(
            BufferIdentity::UserPtr(addr),
            *geometry,
            self.new_handle(),
            addr,
        ))
    }
}

/// Sink recording everything it receives.
#[derive(Default)]
pub struct RecordingSink {
    results: Mutex<Vec<CaptureResult>>,
    messages: Mutex<Vec<NotifyMessage>>,
}

impl RecordingSink {
    pub fn results(&self) -> Vec<CaptureResult> {
        self.results.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<NotifyMessage> {
        self.messages.lock().unwrap().clone()
    }
}

impl ResultSink for RecordingSink {
    fn on_result(&self, result: CaptureResult) {
        self.results.lock().unwrap().push(result);
    }

    fn notify(&self, message: NotifyMessage) {
        self.messages.lock().unwrap().push(message);
    }
}

/// How `RecordingDriver` completes the requests it receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackMode {
    /// Requests are only recorded, the test completes them.
    Deferred,
    /// Requests are completed from within `submit_request`.
    Inline,
    /// Requests are completed from another thread, which `submit_request`
    /// waits for before returning.
    JoinedThread,
}

#[derive(Default)]
struct Gate {
    /// The next request will be held.
    armed: bool,
    /// A request is being held inside `submit_request`.
    held: bool,
}

/// Driver recording the requests it receives.
pub struct RecordingDriver {
    mode: CallbackMode,
    sink: Mutex<Option<Arc<dyn ResultSink>>>,
    requests: Mutex<Vec<CaptureRequest>>,
    configs: Mutex<Vec<StreamConfiguration>>,
    reject_next: AtomicBool,
    fail_flush: AtomicBool,
    flushes: AtomicUsize,
    requests_at_flush: Mutex<Vec<usize>>,
    closed: AtomicBool,
    gate: Mutex<Gate>,
    gate_changed: Condvar,
}

impl RecordingDriver {
    pub fn new(mode: CallbackMode) -> Self {
        RecordingDriver {
            mode,
            sink: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            configs: Mutex::new(Vec::new()),
            reject_next: AtomicBool::new(false),
            fail_flush: AtomicBool::new(false),
            flushes: AtomicUsize::new(0),
            requests_at_flush: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            gate: Mutex::new(Default::default()),
            gate_changed: Condvar::new(),
        }
    }

    fn sink(&self) -> Arc<dyn ResultSink> {
        self.sink
            .lock()
            .unwrap()
            .clone()
            .expect("driver not initialized")
    }

    /// Requests accepted so far, in submission order.
    pub fn requests(&self) -> Vec<CaptureRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn configs(&self) -> Vec<StreamConfiguration> {
        self.configs.lock().unwrap().clone()
    }

    pub fn reject_next(&self) {
        self.reject_next.store(true, Ordering::SeqCst);
    }

    pub fn fail_flush(&self) {
        self.fail_flush.store(true, Ordering::SeqCst);
    }

    pub fn num_flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Number of requests received at the time of each flush.
    pub fn requests_at_flush(&self) -> Vec<usize> {
        self.requests_at_flush.lock().unwrap().clone()
    }

    /// Make the next `submit_request` block before recording its request,
    /// until `release` is called.
    pub fn hold_next(&self) {
        self.gate.lock().unwrap().armed = true;
    }

    /// Wait until a request is held by `submit_request`.
    pub fn wait_held(&self) {
        let gate = self.gate.lock().unwrap();
        let _gate = self.gate_changed.wait_while(gate, |g| !g.held).unwrap();
    }

    pub fn release(&self) {
        self.gate.lock().unwrap().held = false;
        self.gate_changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn send(&self, result: CaptureResult) {
        self.sink().on_result(result);
    }

    pub fn notify(&self, message: NotifyMessage) {
        self.sink().notify(message);
    }

    /// Send both results of request `sequence`, using the sequence number as
    /// timestamp.
    pub fn complete(&self, sequence: u32, metadata_first: bool) {
        self.complete_with_timestamp(sequence, metadata_first, sequence as u64 * 1000)
    }

    pub fn complete_with_timestamp(&self, sequence: u32, metadata_first: bool, timestamp: u64) {
        let handle = self
            .requests()
            .iter()
            .find(|r| r.sequence == sequence)
            .map(|r| r.buffer)
            .expect("unknown request");
        complete(&*self.sink(), sequence, handle, metadata_first, timestamp);
    }
}

fn complete(
    sink: &dyn ResultSink,
    sequence: u32,
    handle: BufferHandle,
    metadata_first: bool,
    timestamp: u64,
) {
    let metadata = CaptureResult::metadata(sequence, Some(timestamp));
    let buffer = CaptureResult::pixel_buffer(sequence, handle);
    if metadata_first {
        sink.on_result(metadata);
        sink.on_result(buffer);
    } else {
        sink.on_result(buffer);
        sink.on_result(metadata);
    }
}

impl CaptureDriver for RecordingDriver {
    fn initialize(&self, sink: Arc<dyn ResultSink>) -> Result<(), DriverError> {
        *self.sink.lock().unwrap() = Some(sink);
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn default_settings(&self, template: RequestTemplate) -> Result<RequestSettings, DriverError> {
        Ok(RequestSettings::new(template))
    }

    fn configure_streams(&self, config: &StreamConfiguration) -> Result<(), DriverError> {
        self.configs.lock().unwrap().push(config.clone());
        Ok(())
    }

    fn submit_request(&self, request: CaptureRequest) -> Result<(), DriverError> {
        if self.reject_next.swap(false, Ordering::SeqCst) {
            return Err(Errno::EBUSY.into());
        }

        let mut gate = self.gate.lock().unwrap();
        if std::mem::take(&mut gate.armed) {
            gate.held = true;
            self.gate_changed.notify_all();
            gate = self.gate_changed.wait_while(gate, |g| g.held).unwrap();
        }
        drop(gate);

        let sequence = request.sequence;
        let handle = request.buffer;
        self.requests.lock().unwrap().push(request);

        match self.mode {
            CallbackMode::Deferred => (),
            CallbackMode::Inline => complete(&*self.sink(), sequence, handle, true, 0),
            CallbackMode::JoinedThread => {
                let sink = self.sink();
                thread::spawn(move || complete(&*sink, sequence, handle, false, 0))
                    .join()
                    .unwrap();
            }
        }

        Ok(())
    }

    fn flush(&self) -> Result<(), DriverError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        let received = self.requests.lock().unwrap().len();
        self.requests_at_flush.lock().unwrap().push(received);
        if self.fail_flush.swap(false, Ordering::SeqCst) {
            return Err(Errno::EIO.into());
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
