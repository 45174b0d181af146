//! A software capture driver that completes requests without touching any
//! hardware.
//!
//! Every request is completed with a shutter notification, one metadata
//! result and one pixel buffer result. The pixel buffer is returned
//! untouched. Completions can be reported either from the thread calling
//! `submit_request`, like a single-threaded driver would, or from a worker
//! thread.
use super::*;

use log::{debug, error, trace};
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Where the results of a request are reported from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// From within `submit_request`, before it returns.
    Inline,
    /// From a dedicated worker thread.
    Threaded,
}

/// In which order the two results of a request are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultOrder {
    MetadataFirst,
    BufferFirst,
    /// Metadata first for even sequence numbers, buffer first for odd ones.
    Alternate,
}

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    dispatch: Dispatch,
    order: ResultOrder,
    frame_interval: Duration,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackConfig {
    pub fn new() -> Self {
        LoopbackConfig {
            dispatch: Dispatch::Threaded,
            order: ResultOrder::MetadataFirst,
            frame_interval: Duration::ZERO,
        }
    }

    pub fn dispatch(self, dispatch: Dispatch) -> Self {
        LoopbackConfig { dispatch, ..self }
    }

    pub fn order(self, order: ResultOrder) -> Self {
        LoopbackConfig { order, ..self }
    }

    /// Time the worker thread waits before completing each request. Ignored
    /// in `Dispatch::Inline` mode.
    pub fn frame_interval(self, frame_interval: Duration) -> Self {
        LoopbackConfig {
            frame_interval,
            ..self
        }
    }
}

enum WorkerCommand {
    Capture(CaptureRequest),
    /// Acknowledged once all the previously sent requests are completed.
    Flush(mpsc::Sender<()>),
    Stop,
}

struct Worker {
    sender: mpsc::Sender<WorkerCommand>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn stop(self) {
        // The worker may already be gone if the sink panicked.
        let _ = self.sender.send(WorkerCommand::Stop);
        if self.handle.join().is_err() {
            error!("Loopback capture thread panicked");
        }
    }
}

/// Report the completion of `request` to `sink`.
fn complete(
    sink: &dyn ResultSink,
    request: &CaptureRequest,
    timestamp: u64,
    order: ResultOrder,
) {
    trace!(
        "Completing request {} (buffer {}) at {}",
        request.sequence,
        request.buffer,
        timestamp
    );

    let metadata = CaptureResult::metadata(request.sequence, Some(timestamp));
    let buffer = CaptureResult::pixel_buffer(request.sequence, request.buffer);
    let metadata_first = match order {
        ResultOrder::MetadataFirst => true,
        ResultOrder::BufferFirst => false,
        ResultOrder::Alternate => request.sequence % 2 == 0,
    };

    sink.notify(NotifyMessage::Shutter {
        sequence: request.sequence,
        timestamp,
    });
    if metadata_first {
        sink.on_result(metadata);
        sink.on_result(buffer);
    } else {
        sink.on_result(buffer);
        sink.on_result(metadata);
    }
}

fn timestamp_since(epoch: Instant) -> u64 {
    epoch.elapsed().as_nanos() as u64
}

fn run_worker(
    receiver: mpsc::Receiver<WorkerCommand>,
    sink: Arc<dyn ResultSink>,
    epoch: Instant,
    config: LoopbackConfig,
) {
    debug!("Loopback capture thread started");

    while let Ok(command) = receiver.recv() {
        match command {
            WorkerCommand::Capture(request) => {
                if !config.frame_interval.is_zero() {
                    thread::sleep(config.frame_interval);
                }
                complete(&*sink, &request, timestamp_since(epoch), config.order);
            }
            WorkerCommand::Flush(ack) => {
                let _ = ack.send(());
            }
            WorkerCommand::Stop => break,
        }
    }

    debug!("Loopback capture thread ending");
}

/// `CaptureDriver` completing every request immediately.
pub struct LoopbackDriver {
    config: LoopbackConfig,
    epoch: Instant,
    sink: Mutex<Option<Arc<dyn ResultSink>>>,
    stream: Mutex<Option<StreamConfiguration>>,
    worker: Mutex<Option<Worker>>,
}

impl LoopbackDriver {
    pub fn new(config: LoopbackConfig) -> Self {
        LoopbackDriver {
            config,
            epoch: Instant::now(),
            sink: Mutex::new(None),
            stream: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// The stream currently configured, if any.
    pub fn stream(&self) -> Option<StreamConfiguration> {
        self.stream.lock().unwrap().clone()
    }

    fn stop_worker(&self) {
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            worker.stop();
        }
    }
}

impl CaptureDriver for LoopbackDriver {
    fn initialize(&self, sink: Arc<dyn ResultSink>) -> Result<(), DriverError> {
        self.stop_worker();

        if self.config.dispatch == Dispatch::Threaded {
            let (sender, receiver) = mpsc::channel();
            let worker_sink = Arc::clone(&sink);
            let epoch = self.epoch;
            let config = self.config.clone();
            let handle = thread::Builder::new()
                .name("Loopback capture".into())
                .spawn(move || run_worker(receiver, worker_sink, epoch, config))
                .map_err(anyhow::Error::from)?;
            *self.worker.lock().unwrap() = Some(Worker { sender, handle });
        }

        *self.sink.lock().unwrap() = Some(sink);
        debug!("Loopback driver initialized ({:?})", self.config.dispatch);

        Ok(())
    }

    fn default_settings(&self, template: RequestTemplate) -> Result<RequestSettings, DriverError> {
        Ok(RequestSettings::new(template))
    }

    fn configure_streams(&self, config: &StreamConfiguration) -> Result<(), DriverError> {
        if config.width == 0 || config.height == 0 {
            return Err(Errno::EINVAL.into());
        }

        debug!(
            "Configured {}: {}x{} {:?} ({:?}, mode {:?})",
            config.stream_id,
            config.width,
            config.height,
            config.format,
            config.usage,
            config.operation_mode
        );
        *self.stream.lock().unwrap() = Some(config.clone());

        Ok(())
    }

    fn submit_request(&self, request: CaptureRequest) -> Result<(), DriverError> {
        let sink = self
            .sink
            .lock()
            .unwrap()
            .clone()
            .ok_or(DriverError::NotInitialized)?;

        match &*self.stream.lock().unwrap() {
            Some(stream) if stream.stream_id == request.stream_id => (),
            _ => return Err(Errno::EINVAL.into()),
        }

        match self.config.dispatch {
            Dispatch::Inline => {
                complete(
                    &*sink,
                    &request,
                    timestamp_since(self.epoch),
                    self.config.order,
                );
                Ok(())
            }
            Dispatch::Threaded => match &*self.worker.lock().unwrap() {
                Some(worker) => worker
                    .sender
                    .send(WorkerCommand::Capture(request))
                    .map_err(|_| DriverError::Status(Errno::EPIPE)),
                None => Err(DriverError::NotInitialized),
            },
        }
    }

    fn flush(&self) -> Result<(), DriverError> {
        let (ack_sender, ack_receiver) = mpsc::channel();

        match &*self.worker.lock().unwrap() {
            Some(worker) => worker
                .sender
                .send(WorkerCommand::Flush(ack_sender))
                .map_err(|_| DriverError::Status(Errno::EPIPE))?,
            // Inline requests are completed by the time they are submitted.
            None => return Ok(()),
        }

        ack_receiver
            .recv()
            .map_err(|_| DriverError::Status(Errno::EPIPE))
    }

    fn close(&self) {
        self.stop_worker();
        *self.sink.lock().unwrap() = None;
        *self.stream.lock().unwrap() = None;
        debug!("Loopback driver closed");
    }
}

impl Drop for LoopbackDriver {
    fn drop(&mut self) {
        self.stop_worker();
    }
}
