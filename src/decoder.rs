// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stateful orchestration on top of the reference management algorithms.
//!
//! [`supplier::TaskSupplier`] is the session object: it groups slices into frames, runs the
//! reference marking, hands complete frames to a [`VideoAccelerator`] through the
//! [`task_broker::TaskBroker`] and decides which frame is output next.

pub mod output;
pub mod skipping;
pub mod supplier;
pub mod task_broker;
pub mod view;

use bytes::Bytes;
use thiserror::Error;

use crate::codec::h264::frame::DisplayPictureStruct;
use crate::codec::h264::frame::ErrorFlags;
use crate::codec::h264::frame::FrameId;
use crate::codec::h264::marking::MarkingError;
use crate::codec::h264::parser::Slice;

/// Instructs the session on whether it should block on the accelerator when waiting for a frame
/// to be decoded. Nonblocking mode is conditional on backend support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingMode {
    Blocking,
    NonBlocking,
}

impl Default for BlockingMode {
    fn default() -> Self {
        Self::Blocking
    }
}

#[derive(Error, Debug)]
pub enum AcceleratorError {
    #[error("not enough resources to proceed with the operation now")]
    OutOfResources,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type AcceleratorResult<T> = std::result::Result<T, AcceleratorError>;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid stream: {0:#}")]
    InvalidStream(anyhow::Error),
    /// No frame of the DPB can be recycled yet. The slice is kept and processing resumes once
    /// frames have been output or decoded.
    #[error("no free frame left in the DPB")]
    NotEnoughBuffer,
    #[error("the accelerator device failed")]
    DeviceFailed,
    #[error("the GPU hung while decoding")]
    GpuHang,
    #[error(transparent)]
    Accelerator(#[from] AcceleratorError),
}

impl From<MarkingError> for DecodeError {
    fn from(err: MarkingError) -> Self {
        Self::InvalidStream(err.into())
    }
}

pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Corruption reported by the accelerator for a decoded surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    None,
    Minor,
    Major,
}

impl From<Corruption> for ErrorFlags {
    fn from(corruption: Corruption) -> Self {
        match corruption {
            Corruption::None => ErrorFlags::empty(),
            Corruption::Minor => ErrorFlags::MINOR,
            Corruption::Major => ErrorFlags::MAJOR,
        }
    }
}

/// Result of polling the accelerator for a submitted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Decoding is still in progress. Only returned in non-blocking mode.
    Busy,
    Ready(Corruption),
    GpuHang,
    DeviceFailed,
}

/// Per-frame decode statistics, as produced by the accelerator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOut {
    pub frame: FrameId,
    pub data: Bytes,
}

/// The hardware side of the decoder. Frames are submitted field by field and synced as a whole.
pub trait VideoAccelerator {
    /// Starts decoding field `field` of `frame`.
    fn begin_frame(&mut self, frame: FrameId, field: usize) -> AcceleratorResult<()>;
    /// Submits the slices of the field started last.
    fn execute(&mut self, frame: FrameId, slices: &[Slice]) -> AcceleratorResult<()>;
    fn end_frame(&mut self, frame: FrameId) -> AcceleratorResult<()>;
    /// Polls the decoding status of `frame`. In blocking mode, waits until it is known.
    fn sync_task(&mut self, frame: FrameId, blocking: BlockingMode) -> AcceleratorResult<SyncStatus>;
    fn query_stream_out(&mut self, frame: FrameId) -> AcceleratorResult<Option<StreamOut>>;
}

/// A frame leaving the session in output order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub view_id: u16,
    pub id: FrameId,
    /// POC of the first field in output order.
    pub poc: i32,
    pub frame_num: i32,
    pub display_struct: DisplayPictureStruct,
    pub error_flags: ErrorFlags,
    pub is_skipped: bool,
    /// Decoding order of the frame within the session.
    pub uid: u64,
    /// Output order of the frame within its view.
    pub timestamp: u64,
}

/// Parameters of a decoding session.
#[derive(Debug, Clone)]
pub struct SupplierParams {
    /// Frames allocated on top of what the stream requires.
    pub extra_dpb_size: usize,
    /// Frames the output is held back by, for pipelines that keep frames in flight.
    pub buffered_frames: usize,
    /// Turns off early output driven by picture timing SEI and POC type 2.
    pub disable_output_delay: bool,
    pub blocking_mode: BlockingMode,
    /// MVC views to decode. Empty means all of them.
    pub target_views: Vec<u16>,
    /// Views the target views are predicted from. They are decoded but never output.
    pub dependency_views: Vec<u16>,
    /// Initial decoding speed, see [`skipping::Skipping`].
    pub decoding_speed: i32,
}

impl Default for SupplierParams {
    fn default() -> Self {
        Self {
            extra_dpb_size: 1,
            buffered_frames: 0,
            disable_output_delay: false,
            blocking_mode: Default::default(),
            target_views: Vec::new(),
            dependency_views: Vec::new(),
            decoding_speed: 0,
        }
    }
}
