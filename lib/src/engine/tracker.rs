//! Tracking of the requests currently owned by the driver.
//!
//! A request dispatched to the driver is completed by two partial results
//! arriving in any order. The tracker keeps the client buffer of each request
//! until both have been received, then hands it back for delivery.
use super::CanceledBuffer;
use crate::driver::{CaptureResult, ResultKind};
use crate::memory::{BufferFlags, BufferHandle, CameraBuffer};

use log::{error, trace, warn};
use std::collections::BTreeMap;

/// Progress of an outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    AwaitingBoth,
    /// The pixel buffer has been returned, the metadata has not.
    AwaitingMetadata,
    /// The metadata has been received, the pixel buffer has not.
    AwaitingBuffer,
    Complete,
}

/// A buffer dispatched to the driver and not yet fully returned.
#[derive(Debug)]
pub struct OutstandingRequest {
    sequence: u32,
    handle: BufferHandle,
    buffer: CameraBuffer,
    metadata_complete: bool,
    buffers_complete: bool,
    timestamp: u64,
}

impl OutstandingRequest {
    pub fn new(sequence: u32, handle: BufferHandle, buffer: CameraBuffer) -> Self {
        OutstandingRequest {
            sequence,
            handle,
            buffer,
            metadata_complete: false,
            buffers_complete: false,
            timestamp: 0,
        }
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn state(&self) -> RequestState {
        match (self.metadata_complete, self.buffers_complete) {
            (false, false) => RequestState::AwaitingBoth,
            (false, true) => RequestState::AwaitingMetadata,
            (true, false) => RequestState::AwaitingBuffer,
            (true, true) => RequestState::Complete,
        }
    }

    /// Give the client buffer back as it was submitted.
    pub fn into_buffer(self) -> CameraBuffer {
        self.buffer
    }

    pub fn cancel(self) -> CanceledBuffer {
        CanceledBuffer {
            sequence: Some(self.sequence),
            buffer: self.buffer,
        }
    }

    fn finish(mut self) -> CameraBuffer {
        self.buffer.set_capture_info(self.sequence, self.timestamp);
        self.buffer
    }
}

/// Outcome of merging a partial result.
#[derive(Debug)]
pub enum Merge {
    /// The request is still waiting for other results.
    Pending(RequestState),
    /// Both results have been received, the request is no longer tracked.
    Complete(CameraBuffer),
    /// No request is in flight for the result's sequence number.
    Unmatched,
    /// The request already received a result of this kind.
    Duplicate,
}

#[derive(Debug, Default)]
pub struct InFlightTracker {
    requests: BTreeMap<u32, OutstandingRequest>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn insert(&mut self, request: OutstandingRequest) {
        let sequence = request.sequence;
        if let Some(previous) = self.requests.insert(sequence, request) {
            // Only possible if the sequence counter wrapped around while a
            // request was still in flight.
            error!(
                "Request {} was still in flight, dropping buffer {}",
                sequence,
                previous.buffer.identity()
            );
        }
    }

    pub fn remove(&mut self, sequence: u32) -> Option<OutstandingRequest> {
        self.requests.remove(&sequence)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Flag the buffer of request `sequence` as erroneous. Returns `false` if
    /// no such request is in flight.
    pub fn mark_error(&mut self, sequence: u32) -> bool {
        match self.requests.get_mut(&sequence) {
            Some(request) => {
                request.buffer.add_flags(BufferFlags::ERROR);
                true
            }
            None => false,
        }
    }

    /// Merge `result` into its request.
    ///
    /// `resolve` returns the CPU address of the buffer designated by a driver
    /// handle. When the address of the returned buffer differs from the one
    /// of the submitted buffer, the driver is trusted and the returned address
    /// is used.
    pub fn apply<F>(&mut self, result: &CaptureResult, resolve: F) -> Merge
    where
        F: FnOnce(BufferHandle) -> Option<usize>,
    {
        let sequence = result.sequence;
        let request = match self.requests.get_mut(&sequence) {
            Some(request) => request,
            None => {
                warn!(
                    "Dropping {:?} result for request {} which is not in flight",
                    result.kind, sequence
                );
                return Merge::Unmatched;
            }
        };

        match result.kind {
            ResultKind::Metadata { timestamp } => {
                if request.metadata_complete {
                    warn!("Request {} received its metadata twice", sequence);
                    return Merge::Duplicate;
                }

                match timestamp {
                    Some(timestamp) => request.timestamp = timestamp,
                    None => {
                        warn!("No shutter timestamp in metadata of request {}", sequence);
                        request.buffer.add_flags(BufferFlags::NO_TIMESTAMP);
                    }
                }
                request.metadata_complete = true;
            }
            ResultKind::PixelBuffer { handle } => {
                if request.buffers_complete {
                    warn!("Request {} received its buffer twice", sequence);
                    return Merge::Duplicate;
                }

                if handle != request.handle {
                    warn!(
                        "Request {} submitted with buffer {} but returned {}",
                        sequence, request.handle, handle
                    );
                }

                match resolve(handle) {
                    Some(addr) if request.buffer.addr() != Some(addr) => {
                        warn!(
                            "Request {}: driver returned buffer at 0x{:x} instead of {:x?}, sequence mismatch maybe?",
                            sequence,
                            addr,
                            request.buffer.addr()
                        );
                        request.buffer.set_addr(addr);
                    }
                    Some(_) => (),
                    None => warn!(
                        "Request {} returned unknown buffer handle {}",
                        sequence, handle
                    ),
                }
                request.buffers_complete = true;
            }
        }

        if let Some(code) = result.error {
            error!("Request {} completed with error {:?}", sequence, code);
            request.buffer.add_flags(BufferFlags::ERROR);
        }

        match request.state() {
            RequestState::Complete => match self.requests.remove(&sequence) {
                Some(request) => Merge::Complete(request.finish()),
                None => Merge::Unmatched,
            },
            state => {
                trace!("Request {} now {:?}", sequence, state);
                Merge::Pending(state)
            }
        }
    }

    /// Remove every request from the tracker, in sequence order.
    pub fn drain_all(&mut self) -> Vec<OutstandingRequest> {
        std::mem::take(&mut self.requests).into_values().collect()
    }
}
