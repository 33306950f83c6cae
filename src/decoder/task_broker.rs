// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Submission of complete frames to the accelerator, and collection of their results.
//!
//! Frames are submitted in decoding order and synced in the same order: the broker only ever
//! polls the oldest frame in flight.

use std::collections::VecDeque;

use log::debug;
use log::error;

use crate::codec::h264::frame::ErrorFlags;
use crate::codec::h264::frame::FillnessStatus;
use crate::codec::h264::frame::FrameId;
use crate::codec::h264::frame::FramePin;
use crate::codec::h264::frame::FramePool;
use crate::decoder::BlockingMode;
use crate::decoder::DecodeError;
use crate::decoder::DecodeResult;
use crate::decoder::StreamOut;
use crate::decoder::SyncStatus;
use crate::decoder::VideoAccelerator;

/// A frame handed to the accelerator and not synced yet.
struct PendingFrame {
    pin: FramePin,
    /// Number of fields (or one frame) submitted.
    fields: usize,
}

pub struct TaskBroker {
    blocking_mode: BlockingMode,
    /// Frames kept in flight before the oldest one is synced.
    pipeline_depth: usize,
    queue: VecDeque<PendingFrame>,
}

impl TaskBroker {
    pub fn new(blocking_mode: BlockingMode, pipeline_depth: usize) -> Self {
        Self {
            blocking_mode,
            pipeline_depth,
            queue: Default::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn contains(&self, id: FrameId) -> bool {
        self.queue.iter().any(|pending| pending.pin.id() == id)
    }

    /// Submits every field of `id` that received slices. Returns `false` if the frame was
    /// already submitted.
    ///
    /// A frame the accelerator rejects is completed right away with a major error.
    pub fn add_frame_to_decoding<A: VideoAccelerator>(
        &mut self,
        accel: &mut A,
        pool: &mut FramePool,
        id: FrameId,
    ) -> DecodeResult<bool> {
        if pool[id].decoding_started || self.contains(id) {
            return Ok(false);
        }

        pool[id].decoding_started = true;

        let mut fields = 0;
        for field in 0..2 {
            if pool[id].aus[field].status() == FillnessStatus::None {
                continue;
            }

            pool[id].aus[field].set_status(FillnessStatus::Started);

            let res = accel
                .begin_frame(id, field)
                .and_then(|()| accel.execute(id, pool[id].aus[field].slices()))
                .and_then(|()| accel.end_frame(id));

            if let Err(err) = res {
                error!("Submission of frame {} field {} failed: {}", id, field, err);
                pool[id].error_flags |= ErrorFlags::MAJOR;
                Self::complete_fields(pool, id);
                return Err(err.into());
            }

            fields += 1;
        }

        debug!(
            "Submitted frame {} (frame_num {}, {} field(s))",
            id, pool[id].frame_num, fields
        );

        self.queue.push_back(PendingFrame {
            pin: pool.pin(id),
            fields,
        });

        Ok(true)
    }

    /// Whether enough frames are in flight for the oldest one to be synced. `force` syncs
    /// whatever is queued.
    pub fn is_enough_for_start_decoding(&self, force: bool) -> bool {
        !self.queue.is_empty() && (force || self.queue.len() > self.pipeline_depth)
    }

    /// Syncs the oldest frame in flight using the broker's blocking mode. Returns the frame if
    /// its decoding completed.
    pub fn get_next_task<A: VideoAccelerator>(
        &mut self,
        accel: &mut A,
        pool: &mut FramePool,
    ) -> DecodeResult<Option<FrameId>> {
        self.get_next_task_internal(accel, pool, self.blocking_mode)
    }

    /// Same as [`Self::get_next_task`] with an explicit blocking mode.
    pub fn get_next_task_internal<A: VideoAccelerator>(
        &mut self,
        accel: &mut A,
        pool: &mut FramePool,
        blocking_mode: BlockingMode,
    ) -> DecodeResult<Option<FrameId>> {
        let Some(pending) = self.queue.front() else {
            return Ok(None);
        };

        let id = pending.pin.id();
        match accel.sync_task(id, blocking_mode)? {
            SyncStatus::Busy => Ok(None),
            SyncStatus::Ready(corruption) => {
                pool[id].error_flags |= corruption.into();
                self.complete_frame(pool, id);
                Ok(Some(id))
            }
            SyncStatus::GpuHang => {
                error!("GPU hang while decoding frame {}", id);
                Err(DecodeError::GpuHang)
            }
            SyncStatus::DeviceFailed => {
                error!("Device failure while decoding frame {}", id);
                Err(DecodeError::DeviceFailed)
            }
        }
    }

    /// Marks `id` as decoded and drops it from the queue.
    pub fn complete_frame(&mut self, pool: &mut FramePool, id: FrameId) {
        if let Some(pos) = self.queue.iter().position(|p| p.pin.id() == id) {
            let pending = self.queue.remove(pos);
            debug!(
                "Frame {} decoded ({} field(s))",
                id,
                pending.map_or(0, |p| p.fields)
            );
        }

        Self::complete_fields(pool, id);
    }

    fn complete_fields(pool: &mut FramePool, id: FrameId) {
        let frame = &mut pool[id];
        for au in frame.aus.iter_mut() {
            if au.status() != FillnessStatus::None {
                au.set_status(FillnessStatus::Completed);
            }
        }

        frame.decoding_completed = true;
    }

    /// Fetches the decode statistics of `id` from the accelerator.
    pub fn query_stream_out<A: VideoAccelerator>(
        &self,
        accel: &mut A,
        id: FrameId,
    ) -> DecodeResult<Option<StreamOut>> {
        Ok(accel.query_stream_out(id)?)
    }

    /// Forgets every frame in flight without syncing it.
    pub fn reset(&mut self) {
        self.queue.clear();
    }
}
