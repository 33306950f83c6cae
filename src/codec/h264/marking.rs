// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoded reference picture marking, see 8.2.5.
//!
//! Every change to a reference flag goes through [`DecRefPicMarking`], which applies it to the
//! frame and appends it to a command log. The log allows the marking of a past picture to be
//! rolled back and replayed, and to be checked against `dec_ref_pic_marking_repetition` SEI
//! messages.

use bitflags::bitflags;
use log::debug;
use log::warn;
use thiserror::Error;

use crate::codec::h264::dpb::DpbList;
use crate::codec::h264::frame::CodingStructure;
use crate::codec::h264::frame::ErrorFlags;
use crate::codec::h264::frame::FrameId;
use crate::codec::h264::frame::FramePin;
use crate::codec::h264::frame::FramePool;
use crate::codec::h264::frame::PictureStructure;
use crate::codec::h264::parser::MaxLongTermFrameIdx;
use crate::codec::h264::parser::MmcoOp;
use crate::codec::h264::parser::Slice;
use crate::codec::h264::poc::PocDecoder;
use crate::codec::h264::sei::DecRefPicMarkingRepetition;

bitflags! {
    /// What a logged marking command does. Without `SHORT_TERM` the command is about long-term
    /// marking, without `SET_REFERENCE` it unmarks.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct CommandFlags: u8 {
        const SHORT_TERM = 0x1;
        const FULL_FRAME = 0x2;
        const SET_REFERENCE = 0x4;
        /// Applies to the second field in decoding order.
        const SECOND_FIELD = 0x8;
    }
}

impl CommandFlags {
    fn field(field_index: usize) -> Self {
        if field_index != 0 {
            Self::SECOND_FIELD
        } else {
            Self::empty()
        }
    }
}

/// One applied change: `current` is the picture whose decoding caused it, `reference` the frame
/// whose marking changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MarkingCommand {
    pub current: FrameId,
    pub reference: FrameId,
    pub flags: CommandFlags,
}

#[derive(Debug, Error)]
pub enum MmcoError {
    #[error("invalid memory_management_control_operation {0}")]
    InvalidOperation(u8),
}

#[derive(Debug, Error)]
pub enum MarkingError {
    #[error(transparent)]
    Mmco(#[from] MmcoError),
    #[error("marking of frame_num {0} does not match its repetition SEI")]
    SeiMismatch(u32),
}

/// The per-layer state the marking process works on.
pub struct MarkingTarget<'a> {
    pub pool: &'a mut FramePool,
    pub dpb: &'a mut DpbList,
    pub poc: &'a mut PocDecoder,
    pub max_long_term_frame_idx: &'a mut MaxLongTermFrameIdx,
}

/// Pins every frame of a DPB for as long as it lives, so that rolling the marking back and
/// forth cannot make a frame disposable midway.
pub struct ReplayPins(Vec<FramePin>);

impl ReplayPins {
    pub fn new(pool: &FramePool, dpb: &DpbList) -> Self {
        Self(dpb.ids().map(|id| pool.pin(id)).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct DecRefPicMarking {
    log: Vec<MarkingCommand>,
    /// Number of pictures that went through marking and still have log entries.
    frame_count: usize,
    /// Sticky flag raised by an invalid command or a failed SEI check.
    dpb_error_found: bool,
}

impl DecRefPicMarking {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn reset(&mut self) {
        self.log.clear();
        self.frame_count = 0;
        self.dpb_error_found = false;
    }

    pub fn log(&self) -> &[MarkingCommand] {
        &self.log
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn dpb_error_found(&self) -> bool {
        self.dpb_error_found
    }

    pub fn reset_error(&mut self) {
        self.dpb_error_found = false;
    }

    /// Whether applying `cmd` would leave the marking unchanged.
    fn check_useless(pool: &FramePool, cmd: &MarkingCommand) -> bool {
        let frame = &pool[cmd.reference];
        let set = cmd.flags.contains(CommandFlags::SET_REFERENCE);
        let field = usize::from(cmd.flags.contains(CommandFlags::SECOND_FIELD));

        let (mask, field_marked) = if cmd.flags.contains(CommandFlags::SHORT_TERM) {
            (frame.short_term_mask(), frame.is_short_term_field(field))
        } else {
            (frame.long_term_mask(), frame.is_long_term_field(field))
        };

        match (cmd.flags.contains(CommandFlags::FULL_FRAME), set) {
            (true, true) => mask == 3,
            (true, false) => mask == 0,
            (false, true) => field_marked,
            (false, false) => !field_marked,
        }
    }

    /// Applies `cmd`, or its inverse. The reference is addressed with the structure of the
    /// picture that issued the command.
    fn make_change(pool: &mut FramePool, cmd: &MarkingCommand, undo: bool) {
        let set = cmd.flags.contains(CommandFlags::SET_REFERENCE) != undo;
        let structure = pool[cmd.current].structure_for_dec;
        let frame = &mut pool[cmd.reference];

        let saved = frame.structure_for_ref;
        frame.structure_for_ref = structure;

        let fields: &[usize] = if cmd.flags.contains(CommandFlags::FULL_FRAME) {
            &[0, 1]
        } else if cmd.flags.contains(CommandFlags::SECOND_FIELD) {
            &[1]
        } else {
            &[0]
        };

        for &field in fields {
            if cmd.flags.contains(CommandFlags::SHORT_TERM) {
                frame.set_short_term_ref(set, field);
            } else {
                frame.set_long_term_ref(set, field);
            }
        }

        frame.structure_for_ref = saved;
    }

    /// Applies a change and logs it, unless it would be a no-op.
    fn add_item_and_run(
        &mut self,
        pool: &mut FramePool,
        current: FrameId,
        reference: FrameId,
        flags: CommandFlags,
    ) {
        let cmd = MarkingCommand {
            current,
            reference,
            flags,
        };

        if Self::check_useless(pool, &cmd) {
            return;
        }

        Self::make_change(pool, &cmd, false);
        self.log.push(cmd);
    }

    /// Rolls back every change `frame` caused, latest first.
    pub fn undo(&self, pool: &mut FramePool, frame: FrameId) {
        for cmd in self.log.iter().rev().filter(|c| c.current == frame) {
            Self::make_change(pool, cmd, true);
        }
    }

    /// Applies again every change `frame` caused.
    pub fn redo(&self, pool: &mut FramePool, frame: FrameId) {
        for cmd in self.log.iter().filter(|c| c.current == frame) {
            Self::make_change(pool, cmd, false);
        }
    }

    /// Rolls the marking back to the state before `frame` was marked, then replays it and every
    /// later picture. The DPB is pinned for the duration.
    pub fn replay(&self, pool: &mut FramePool, dpb: &DpbList, frame: FrameId) {
        let Some(first) = self.log.iter().position(|c| c.current == frame) else {
            return;
        };

        let _pins = ReplayPins::new(pool, dpb);

        for cmd in self.log[first..].iter().rev() {
            Self::make_change(pool, cmd, true);
        }

        for cmd in &self.log[first..] {
            Self::make_change(pool, cmd, false);
        }
    }

    /// Drops the log entries of a frame leaving the DPB. Everything logged before its first entry
    /// is dropped too, as is every entry that changed its marking.
    pub fn remove(&mut self, frame: FrameId) {
        if let Some(start) = self.log.iter().position(|c| c.current == frame) {
            self.frame_count = self.frame_count.saturating_sub(1);
            let run = self.log[start..]
                .iter()
                .take_while(|c| c.current == frame)
                .count();
            self.log.drain(..start + run);
        }

        self.log.retain(|c| c.reference != frame);
    }

    /// Drops the entries of the oldest logged picture.
    pub fn remove_old(&mut self) {
        match self.log.first() {
            Some(cmd) => self.remove(cmd.current),
            None => self.frame_count = 0,
        }
    }

    /// Sliding window marking, see 8.2.5.3.
    pub fn slide_window(
        &mut self,
        pool: &mut FramePool,
        dpb: &DpbList,
        current: FrameId,
        num_ref_frames: usize,
        field_index: usize,
    ) {
        if field_index != 0 {
            return;
        }

        let (mut num_short_term, num_long_term) = dpb.count_active_refs(pool);
        while num_short_term > 0 && num_short_term + num_long_term >= num_ref_frames {
            let Some(oldest) = dpb.find_oldest_short_term_ref(pool) else {
                break;
            };

            debug!(
                "Sliding window: unmarking frame_num {} ({})",
                pool[oldest].frame_num, oldest
            );
            self.add_item_and_run(
                pool,
                current,
                oldest,
                CommandFlags::FULL_FRAME | CommandFlags::SHORT_TERM,
            );
            num_short_term -= 1;
        }
    }

    /// Unmarks every short-term frame that shares the frame_num of `frame`. Such frames are left
    /// behind by broken streams and would otherwise never leave the DPB.
    pub fn dpb_sanitize(&mut self, pool: &mut FramePool, dpb: &DpbList, frame: FrameId) {
        let frame_num = pool[frame].frame_num;
        let stuck: Vec<FrameId> = dpb
            .ids()
            .filter(|&id| {
                id != frame && pool[id].frame_num == frame_num && pool[id].is_short_term_ref()
            })
            .collect();

        for id in stuck {
            warn!("Unmarking stuck short-term frame_num {} ({})", frame_num, id);
            pool[id].error_flags |= ErrorFlags::SHORT_TERM_STUCK;
            self.add_item_and_run(
                pool,
                id,
                id,
                CommandFlags::FULL_FRAME | CommandFlags::SHORT_TERM,
            );
        }
    }

    fn unmark_all(&mut self, pool: &mut FramePool, dpb: &DpbList, current: FrameId) {
        let refs: Vec<FrameId> = dpb.ids().filter(|&id| pool[id].is_reference()).collect();

        for id in refs {
            self.add_item_and_run(
                pool,
                current,
                id,
                CommandFlags::FULL_FRAME | CommandFlags::SHORT_TERM,
            );
            self.add_item_and_run(pool, current, id, CommandFlags::FULL_FRAME);
        }
    }

    /// Marks the references after `frame` was decoded, see 8.2.5.1. `slice` is the first
    /// reference slice of the field or frame at `field_index`.
    ///
    /// An invalid memory_management_control_operation stops processing: the changes made so far
    /// stay applied and logged, and the frame is flagged with a DPB error.
    pub fn update_ref_pic_marking(
        &mut self,
        target: &mut MarkingTarget,
        frame: FrameId,
        slice: &Slice,
        field_index: usize,
    ) -> Result<(), MarkingError> {
        let hdr = &slice.header;
        let num_ref_frames = usize::from(slice.sps.max_num_ref_frames);
        let field_flag = CommandFlags::field(field_index);
        let mut current_is_short_term = true;

        self.frame_count += 1;

        let pool = &mut *target.pool;
        let dpb = &mut *target.dpb;

        if pool[frame].i_flag {
            let stuck: Vec<FrameId> = dpb
                .ids()
                .filter(|&id| pool[id].error_flags.contains(ErrorFlags::SHORT_TERM_STUCK))
                .collect();
            for id in stuck {
                self.add_item_and_run(
                    pool,
                    frame,
                    id,
                    CommandFlags::FULL_FRAME | CommandFlags::SHORT_TERM,
                );
            }
        }

        if pool[frame].idr_flag {
            self.unmark_all(pool, dpb, frame);

            if hdr.dec_ref_pic_marking.long_term_reference_flag {
                debug!("IDR frame {} marked as long-term", frame);
                self.add_item_and_run(
                    pool,
                    frame,
                    frame,
                    CommandFlags::SET_REFERENCE | field_flag,
                );
                pool[frame].long_term_frame_idx = Some(0);
                *target.max_long_term_frame_idx = MaxLongTermFrameIdx::Idx(0);
            } else {
                self.add_item_and_run(
                    pool,
                    frame,
                    frame,
                    CommandFlags::SET_REFERENCE | CommandFlags::SHORT_TERM | field_flag,
                );
                *target.max_long_term_frame_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;
            }

            current_is_short_term = false;
        } else if hdr.has_mmco() {
            for mmco in &hdr.dec_ref_pic_marking.inner {
                dpb.dump(pool);

                debug!("Applying {:?} for frame {}", mmco, frame);

                match mmco.op() {
                    Some(MmcoOp::UnmarkShortTerm) => {
                        let pic_num = pool[frame].pic_num(field_index)
                            - (mmco.difference_of_pic_nums_minus1 as i32 + 1);
                        if let Some((id, field)) = dpb.find_short_term_pic(pool, pic_num) {
                            self.add_item_and_run(
                                pool,
                                frame,
                                id,
                                CommandFlags::SHORT_TERM | CommandFlags::field(field),
                            );
                        }
                    }
                    Some(MmcoOp::UnmarkLongTerm) => {
                        let pic_num = mmco.long_term_pic_num as i32;
                        if let Some((id, field)) = dpb.find_long_term_pic(pool, pic_num) {
                            self.add_item_and_run(pool, frame, id, CommandFlags::field(field));
                        }
                    }
                    Some(MmcoOp::ShortTermToLongTerm) => {
                        let pic_num = pool[frame].pic_num(field_index)
                            - (mmco.difference_of_pic_nums_minus1 as i32 + 1);
                        let idx = mmco.long_term_frame_idx;

                        let Some((id, field)) = dpb.find_short_term_pic(pool, pic_num) else {
                            continue;
                        };

                        if let Some(holder) = dpb.find_long_term_ref_idx(pool, idx) {
                            if holder != id {
                                self.add_item_and_run(
                                    pool,
                                    frame,
                                    holder,
                                    CommandFlags::FULL_FRAME,
                                );
                            }
                        }

                        let field_flag = CommandFlags::field(field);
                        self.add_item_and_run(
                            pool,
                            frame,
                            id,
                            CommandFlags::SET_REFERENCE | field_flag,
                        );
                        self.add_item_and_run(
                            pool,
                            frame,
                            id,
                            CommandFlags::SHORT_TERM | field_flag,
                        );

                        let reference = &mut pool[id];
                        reference.long_term_frame_idx = Some(idx);
                        let structure = match reference.structure_for_ref {
                            CodingStructure::Frame => PictureStructure::Frame,
                            CodingStructure::Field => PictureStructure::from_header(
                                true,
                                reference.bottom_field_flag[field],
                            ),
                        };
                        reference.update_long_term_pic_num(structure);
                    }
                    Some(MmcoOp::TrimLongTermIndices) => {
                        let max = mmco.max_long_term_frame_idx;
                        *target.max_long_term_frame_idx = max;

                        while let Some(id) = dpb.find_old_long_term_ref(pool, max) {
                            self.add_item_and_run(pool, frame, id, CommandFlags::FULL_FRAME);
                        }
                    }
                    Some(MmcoOp::UnmarkAll) => {
                        self.unmark_all(pool, dpb, frame);
                        dpb.increase_ref_pic_list_reset_count(pool, Some(frame));
                        *target.max_long_term_frame_idx =
                            MaxLongTermFrameIdx::NoLongTermFrameIndices;

                        // The picture now acts as an IDR: POCs become relative to itself.
                        let current = &mut pool[frame];
                        if current.structure_for_dec == CodingStructure::Field {
                            current.set_poc(0, field_index);
                            current.set_pic_num(0, field_index);
                        } else {
                            let poc = current.min_poc();
                            for field in 0..2 {
                                let field_poc = current.field_poc(field);
                                current.set_poc(field_poc - poc, field);
                                current.set_pic_num(0, field);
                            }
                        }

                        current.idr_flag = true;
                        current.frame_num = 0;
                        target.poc.reset(0);
                    }
                    Some(MmcoOp::CurrentToLongTerm) => {
                        let idx = mmco.long_term_frame_idx;
                        current_is_short_term = false;

                        if let Some(holder) = dpb.find_long_term_ref_idx(pool, idx) {
                            if holder != frame {
                                self.add_item_and_run(
                                    pool,
                                    frame,
                                    holder,
                                    CommandFlags::FULL_FRAME,
                                );
                            }
                        }

                        self.add_item_and_run(
                            pool,
                            frame,
                            frame,
                            CommandFlags::SET_REFERENCE | field_flag,
                        );
                        pool[frame].long_term_frame_idx = Some(idx);
                    }
                    Some(MmcoOp::End) | None => {
                        warn!(
                            "Invalid memory_management_control_operation {}",
                            mmco.memory_management_control_operation
                        );
                        pool[frame].error_flags |= ErrorFlags::DPB;
                        self.dpb_error_found = true;
                        return Err(MmcoError::InvalidOperation(
                            mmco.memory_management_control_operation,
                        )
                        .into());
                    }
                }
            }
        }

        if current_is_short_term {
            if hdr.has_mmco() && field_index == 0 {
                // Adaptive marking may leave no room for the current picture in broken streams.
                // Take back the first long-term assignment this picture made.
                let (num_short_term, num_long_term) = dpb.count_active_refs(pool);
                if num_short_term + num_long_term + 1 > num_ref_frames {
                    if let Some(pos) = self.log.iter().position(|c| {
                        c.current == frame
                            && c.flags.contains(CommandFlags::SET_REFERENCE)
                            && !c.flags.contains(CommandFlags::SHORT_TERM)
                    }) {
                        warn!("DPB overflow after adaptive marking of frame {}", frame);
                        let cmd = self.log.remove(pos);
                        Self::make_change(pool, &cmd, true);
                    }
                }
            }

            if !(hdr.field_pic_flag && field_index != 0) {
                self.slide_window(pool, dpb, frame, num_ref_frames, field_index);
            }

            self.add_item_and_run(
                pool,
                frame,
                frame,
                CommandFlags::SET_REFERENCE | CommandFlags::SHORT_TERM | field_flag,
            );
        }

        Ok(())
    }

    /// Compares a `dec_ref_pic_marking_repetition` SEI against the marking the referred picture
    /// was decoded with. A mismatch flags the picture with a DPB error.
    pub fn check_sei_repetition(
        &mut self,
        pool: &mut FramePool,
        dpb: &DpbList,
        payload: &DecRefPicMarkingRepetition,
    ) -> Result<(), MarkingError> {
        let Some(id) = dpb
            .ids()
            .find(|&id| pool[id].frame_num == payload.original_frame_num as i32)
        else {
            return Ok(());
        };

        let frame = &pool[id];
        let au = if payload.original_field_pic_flag {
            frame.field_index_by_parity(payload.original_bottom_field_flag)
        } else {
            0
        };

        let Some(record) = frame.aus[au].marking() else {
            return Ok(());
        };

        let expected = &payload.dec_ref_pic_marking;
        let actual = &record.dec_ref_pic_marking;
        let equal = record.original_idr_flag == payload.original_idr_flag
            && record.original_frame_num == payload.original_frame_num
            && record.original_field_pic_flag == payload.original_field_pic_flag
            && record.original_bottom_field_flag == payload.original_bottom_field_flag
            && actual.long_term_reference_flag == expected.long_term_reference_flag
            && actual.inner == expected.inner;

        if equal {
            return Ok(());
        }

        warn!(
            "Marking repetition mismatch for frame_num {}",
            payload.original_frame_num
        );
        pool[id].error_flags |= ErrorFlags::DPB;
        self.dpb_error_found = true;
        Err(MarkingError::SeiMismatch(payload.original_frame_num))
    }
}
