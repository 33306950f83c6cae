// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the session run so we can
//! test it in isolation.
//!
//! Sync results are scripted: each call to `sync_task` pops the next queued status, and frames
//! decode cleanly once the script is exhausted.

use std::collections::VecDeque;

use anyhow::anyhow;
use bytes::Bytes;

use crate::codec::h264::frame::FrameId;
use crate::codec::h264::parser::Slice;
use crate::decoder::AcceleratorError;
use crate::decoder::AcceleratorResult;
use crate::decoder::BlockingMode;
use crate::decoder::Corruption;
use crate::decoder::StreamOut;
use crate::decoder::SyncStatus;
use crate::decoder::VideoAccelerator;

#[derive(Debug, Default)]
pub struct Backend {
    script: VecDeque<SyncStatus>,
    /// Every submitted field as (frame, field, number of slices).
    submitted: Vec<(FrameId, usize, usize)>,
    /// Frames returned as ready, in sync order.
    synced: Vec<FrameId>,
    /// Field started and not ended yet.
    open: Option<(FrameId, usize)>,
    fail_next_submission: bool,
}

impl Backend {
    pub fn new() -> Self {
        Default::default()
    }

    /// Queues the result of a future `sync_task` call.
    pub fn push_status(&mut self, status: SyncStatus) {
        self.script.push_back(status);
    }

    /// Makes the next `begin_frame` fail.
    pub fn fail_next_submission(&mut self) {
        self.fail_next_submission = true;
    }

    pub fn submitted(&self) -> &[(FrameId, usize, usize)] {
        &self.submitted
    }

    pub fn synced(&self) -> &[FrameId] {
        &self.synced
    }
}

impl VideoAccelerator for Backend {
    fn begin_frame(&mut self, frame: FrameId, field: usize) -> AcceleratorResult<()> {
        if std::mem::take(&mut self.fail_next_submission) {
            return Err(AcceleratorError::OutOfResources);
        }

        if let Some((open, open_field)) = self.open {
            return Err(anyhow!(
                "frame {} field {} started while frame {} field {} is open",
                frame,
                field,
                open,
                open_field
            )
            .into());
        }

        self.open = Some((frame, field));
        Ok(())
    }

    fn execute(&mut self, frame: FrameId, slices: &[Slice]) -> AcceleratorResult<()> {
        match self.open {
            Some((open, field)) if open == frame => {
                self.submitted.push((frame, field, slices.len()));
                Ok(())
            }
            _ => Err(anyhow!("slices submitted for frame {} which is not started", frame).into()),
        }
    }

    fn end_frame(&mut self, frame: FrameId) -> AcceleratorResult<()> {
        match self.open.take() {
            Some((open, _)) if open == frame => Ok(()),
            _ => Err(anyhow!("frame {} ended without being started", frame).into()),
        }
    }

    fn sync_task(&mut self, frame: FrameId, blocking: BlockingMode) -> AcceleratorResult<SyncStatus> {
        let status = loop {
            match self.script.pop_front() {
                Some(SyncStatus::Busy) if blocking == BlockingMode::Blocking => continue,
                Some(status) => break status,
                None => break SyncStatus::Ready(Corruption::None),
            }
        };

        if matches!(status, SyncStatus::Ready(_)) {
            self.synced.push(frame);
        }

        Ok(status)
    }

    fn query_stream_out(&mut self, frame: FrameId) -> AcceleratorResult<Option<StreamOut>> {
        Ok(Some(StreamOut {
            frame,
            data: Bytes::new(),
        }))
    }
}
