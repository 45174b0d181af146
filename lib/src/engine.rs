//! Synchronous buffer submission on top of an asynchronous capture driver.
//!
//! The `CaptureEngine` lets its clients submit buffers to capture into, and
//! retrieve them once the driver has filled them. Internally, buffers go
//! through the following states:
//!
//! * Pending, if they are submitted while the engine is stopped. They are
//!   dispatched to the driver in submission order when it starts.
//! * In flight, while the driver owns them. The `InFlightTracker` keeps them
//!   until both partial results of their request have been received.
//! * Completed, once both results arrived. They are then retrieved in
//!   completion order by `drain`.
//!
//! All these states are protected by a single lock, which is never held
//! while calling into the driver: drivers are allowed to report results from
//! within `CaptureDriver::submit_request`, from any thread. Stopping waits
//! for the requests being submitted to reach the driver before flushing it.
pub mod tracker;

use crate::driver::{
    CaptureDriver, CaptureRequest, CaptureResult, DriverError, NotifyMessage, ResultSink,
};
use crate::memory::table::MappingTable;
use crate::memory::{BufferGeometry, BufferMapper, CameraBuffer, MapError, MappedBuffer};
use crate::settings::{RequestSettings, RequestTemplate};
use crate::StreamId;
use tracker::{InFlightTracker, Merge, OutstandingRequest};

use log::{debug, error, trace, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("{0} is not configured")]
    UnknownStream(StreamId),
    #[error("error while mapping buffer: {0}")]
    MappingFailed(#[from] MapError),
    #[error("driver rejected the request: {0}")]
    DriverRejected(DriverError),
}

/// Error returned by `submit`, giving the submitted buffer back when
/// possible.
///
/// `buffer` is `None` only if the driver reported the request as completed
/// before rejecting it, in which case the buffer can be retrieved by `drain`.
#[derive(Debug, Error)]
#[error("{}", self.error)]
pub struct QueueError {
    pub error: SubmitError,
    pub buffer: Option<CameraBuffer>,
}

#[derive(Debug, Error)]
pub enum DrainError {
    #[error("timeout while waiting for a completed buffer")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("{} pending buffers could not be dispatched", .0.len())]
    Dispatch(Vec<QueueError>),
}

#[derive(Debug, Error)]
pub enum StopError {
    #[error("error while flushing the driver: {0}")]
    Flush(DriverError),
}

/// A buffer given back without having been captured into.
#[derive(Debug)]
pub struct CanceledBuffer {
    /// Sequence number of the request the buffer was dispatched with, or
    /// `None` if it never reached the driver.
    pub sequence: Option<u32>,
    pub buffer: CameraBuffer,
}

struct Submission {
    stream_id: StreamId,
    buffer: CameraBuffer,
}

struct EngineState {
    started: bool,
    /// Set while `start` is dispatching the pending queue. New submissions
    /// go to the back of the pending queue until it is empty.
    flushing_pending: bool,
    /// Number of requests handed to the driver without holding the lock.
    dispatching: usize,
    stream: Option<StreamId>,
    settings: Arc<RequestSettings>,
    next_sequence: u32,
    pending: VecDeque<Submission>,
    mappings: MappingTable,
    tracker: InFlightTracker,
    completed: VecDeque<CameraBuffer>,
}

struct Shared {
    state: Mutex<EngineState>,
    /// Signaled whenever a buffer is added to `EngineState::completed`.
    completed: Condvar,
    /// Signaled whenever `EngineState::dispatching` drops to 0.
    dispatched: Condvar,
}

impl Shared {
    fn on_result(&self, result: CaptureResult) {
        let mut state = self.state.lock().unwrap();
        let EngineState {
            tracker,
            mappings,
            completed,
            ..
        } = &mut *state;

        let merge = tracker.apply(&result, |handle| {
            mappings.resolve(handle).map(MappedBuffer::cpu_addr)
        });
        match merge {
            Merge::Complete(buffer) => {
                trace!(
                    "Request {} complete ({})",
                    result.sequence,
                    buffer.identity()
                );
                completed.push_back(buffer);
                self.completed.notify_one();
            }
            Merge::Pending(request_state) => {
                trace!("Request {}: {:?}", result.sequence, request_state)
            }
            // Already reported by the tracker.
            Merge::Unmatched | Merge::Duplicate => (),
        }
    }

    fn on_error(&self, sequence: u32) {
        let mut state = self.state.lock().unwrap();
        if !state.tracker.mark_error(sequence) {
            debug!("Error notified for request {} which is not in flight", sequence);
        }
    }
}

/// The `ResultSink` given to the driver.
///
/// Only holds a weak reference to the engine, so the driver can keep it
/// without keeping the engine alive.
struct EngineSink {
    shared: Weak<Shared>,
}

impl ResultSink for EngineSink {
    fn on_result(&self, result: CaptureResult) {
        match self.shared.upgrade() {
            Some(shared) => shared.on_result(result),
            None => debug!(
                "Engine is gone, dropping result for request {}",
                result.sequence
            ),
        }
    }

    fn notify(&self, message: NotifyMessage) {
        match message {
            NotifyMessage::Shutter {
                sequence,
                timestamp,
            } => trace!("Shutter for request {} at {}", sequence, timestamp),
            NotifyMessage::Error { sequence, code } => {
                error!("Driver reported {:?} error for request {}", code, sequence);
                if let Some(shared) = self.shared.upgrade() {
                    shared.on_error(sequence);
                }
            }
        }
    }
}

pub struct CaptureEngine {
    shared: Arc<Shared>,
    driver: Arc<dyn CaptureDriver>,
}

impl CaptureEngine {
    /// Create a new engine submitting to `driver`. The sink returned by
    /// `result_sink` must be registered with the driver before any buffer is
    /// dispatched.
    pub fn new(driver: Arc<dyn CaptureDriver>, mapper: Arc<dyn BufferMapper>) -> Self {
        let state = EngineState {
            started: false,
            flushing_pending: false,
            dispatching: 0,
            stream: None,
            settings: Arc::new(RequestSettings::new(RequestTemplate::Preview)),
            next_sequence: 0,
            pending: VecDeque::new(),
            mappings: MappingTable::new(mapper),
            tracker: InFlightTracker::new(),
            completed: VecDeque::new(),
        };

        CaptureEngine {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                completed: Condvar::new(),
                dispatched: Condvar::new(),
            }),
            driver,
        }
    }

    pub fn result_sink(&self) -> Arc<dyn ResultSink> {
        Arc::new(EngineSink {
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Set the stream buffers can be submitted to. `None` makes every
    /// submission fail.
    pub fn configure_stream(&self, stream: Option<StreamId>) {
        self.shared.state.lock().unwrap().stream = stream;
    }

    /// Replace the settings attached to the requests dispatched from now on.
    pub fn set_settings(&self, settings: RequestSettings) {
        self.shared.state.lock().unwrap().settings = Arc::new(settings);
    }

    pub fn settings(&self) -> Arc<RequestSettings> {
        Arc::clone(&self.shared.state.lock().unwrap().settings)
    }

    /// Allocate a new buffer of `geometry` and record its mapping so it is
    /// not mapped again when submitted.
    pub fn allocate(&self, geometry: &BufferGeometry) -> Result<CameraBuffer, MapError> {
        let mut state = self.shared.state.lock().unwrap();
        let mapped = state.mappings.allocate(geometry)?;

        Ok(CameraBuffer::from_mapped(mapped))
    }

    pub fn is_started(&self) -> bool {
        self.shared.state.lock().unwrap().started
    }

    pub fn num_pending(&self) -> usize {
        self.shared.state.lock().unwrap().pending.len()
    }

    pub fn num_in_flight(&self) -> usize {
        self.shared.state.lock().unwrap().tracker.len()
    }

    pub fn num_completed(&self) -> usize {
        self.shared.state.lock().unwrap().completed.len()
    }

    pub fn num_mapped(&self) -> usize {
        self.shared.state.lock().unwrap().mappings.len()
    }

    /// Submit `buffer` to be captured into.
    ///
    /// If the engine is not started, the buffer is kept pending and this
    /// method returns immediately. Otherwise it is mapped if needed and
    /// dispatched to the driver.
    pub fn submit(&self, stream_id: StreamId, buffer: CameraBuffer) -> Result<(), QueueError> {
        let mut state = self.shared.state.lock().unwrap();

        if state.stream != Some(stream_id) {
            return Err(QueueError {
                error: SubmitError::UnknownStream(stream_id),
                buffer: Some(buffer),
            });
        }

        if !state.started || state.flushing_pending {
            trace!("Keeping {} pending", buffer.identity());
            state.pending.push_back(Submission { stream_id, buffer });
            return Ok(());
        }

        self.dispatch(state, stream_id, buffer)
    }

    /// Send `buffer` to the driver. `state` is released before calling
    /// `CaptureDriver::submit_request`.
    fn dispatch(
        &self,
        mut state: MutexGuard<EngineState>,
        stream_id: StreamId,
        mut buffer: CameraBuffer,
    ) -> Result<(), QueueError> {
        let (handle, cpu_addr) = match state
            .mappings
            .map_or_get(buffer.identity(), buffer.geometry())
        {
            Ok(mapped) => (mapped.handle(), mapped.cpu_addr()),
            Err(e) => {
                error!("Cannot map {}: {}", buffer.identity(), e);
                return Err(QueueError {
                    error: e.into(),
                    buffer: Some(buffer),
                });
            }
        };
        if buffer.addr().is_none() {
            buffer.set_addr(cpu_addr);
        }

        let sequence = state.next_sequence;
        state.next_sequence = sequence.wrapping_add(1);
        let settings = Arc::clone(&state.settings);

        // The request must be tracked before the driver can complete it.
        state
            .tracker
            .insert(OutstandingRequest::new(sequence, handle, buffer));
        state.dispatching += 1;
        drop(state);

        trace!("Dispatching request {} with buffer {}", sequence, handle);
        let request = CaptureRequest {
            sequence,
            stream_id,
            buffer: handle,
            settings,
        };
        let res = self.driver.submit_request(request);

        let mut state = self.shared.state.lock().unwrap();
        state.dispatching -= 1;
        if state.dispatching == 0 {
            self.shared.dispatched.notify_all();
        }

        if let Err(e) = res {
            error!("Driver rejected request {}: {}", sequence, e);
            let buffer = state
                .tracker
                .remove(sequence)
                .map(OutstandingRequest::into_buffer);
            return Err(QueueError {
                error: SubmitError::DriverRejected(e),
                buffer,
            });
        }

        Ok(())
    }

    /// Wait up to `timeout` for a buffer to be completed, and return it.
    pub fn drain(&self, timeout: Duration) -> Result<CameraBuffer, DrainError> {
        let state = self.shared.state.lock().unwrap();
        let (mut state, _) = self
            .shared
            .completed
            .wait_timeout_while(state, timeout, |state| state.completed.is_empty())
            .unwrap();

        state.completed.pop_front().ok_or(DrainError::Timeout)
    }

    /// Start dispatching buffers to the driver, beginning with the pending
    /// ones in the order they have been submitted.
    ///
    /// Pending buffers that fail to be dispatched are returned in the error.
    pub fn start(&self) -> Result<(), StartError> {
        let mut state = self.shared.state.lock().unwrap();
        if state.started {
            return Ok(());
        }
        state.started = true;
        // A previous `start` is still going through the pending queue.
        if state.flushing_pending {
            return Ok(());
        }
        state.flushing_pending = true;

        debug!("Starting capture with {} pending buffers", state.pending.len());

        let mut errors = Vec::new();
        while state.started {
            let Submission { stream_id, buffer } = match state.pending.pop_front() {
                Some(submission) => submission,
                None => break,
            };
            if let Err(e) = self.dispatch(state, stream_id, buffer) {
                errors.push(e);
            }
            state = self.shared.state.lock().unwrap();
        }
        state.flushing_pending = false;
        drop(state);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(StartError::Dispatch(errors))
        }
    }

    /// Stop dispatching buffers and cancel the requests the driver still
    /// owns after being flushed. The canceled buffers are returned.
    ///
    /// Pending and completed buffers are left untouched.
    pub fn stop(&self) -> Result<Vec<CanceledBuffer>, StopError> {
        let mut state = self.shared.state.lock().unwrap();
        state.started = false;
        // No new request can be dispatched from now on, but the ones already
        // tracked must have reached the driver before it is flushed.
        if state.dispatching > 0 {
            debug!("Waiting for {} requests to be dispatched", state.dispatching);
            state = self
                .shared
                .dispatched
                .wait_while(state, |state| state.dispatching > 0)
                .unwrap();
        }
        drop(state);

        debug!("Stopping capture, flushing driver");
        self.driver.flush().map_err(StopError::Flush)?;

        let mut state = self.shared.state.lock().unwrap();
        let canceled = state
            .tracker
            .drain_all()
            .into_iter()
            .map(|request| {
                warn!("Canceling request {}", request.sequence());
                request.cancel()
            })
            .collect();

        Ok(canceled)
    }

    /// Stop the engine and release all its buffers.
    ///
    /// In addition to the buffers canceled by `stop`, the pending and the
    /// completed but not drained buffers are returned, and every mapping is
    /// released. The stream needs to be configured again before buffers can
    /// be submitted.
    pub fn shutdown(&self) -> Result<Vec<CanceledBuffer>, StopError> {
        let mut canceled = self.stop()?;

        let mut state = self.shared.state.lock().unwrap();
        canceled.extend(state.pending.drain(..).map(|submission| CanceledBuffer {
            sequence: None,
            buffer: submission.buffer,
        }));
        canceled.extend(state.completed.drain(..).map(|buffer| CanceledBuffer {
            sequence: buffer.sequence(),
            buffer,
        }));
        state.mappings.unmap_all();
        state.stream = None;

        debug!("Engine shut down, {} buffers returned", canceled.len());

        Ok(canceled)
    }
}
