// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoding session.
//!
//! [`TaskSupplier`] receives parsed slices in decoding order. Slices are grouped into access
//! units, one layer per view and `dependency_id`. When the next access unit starts, the pending
//! one is turned into frames: a frame is allocated (or the first field of a pair is reused), its
//! POC is derived, reference marking runs, and complete frames are submitted to the accelerator
//! through the [`TaskBroker`]. Decoded frames leave in output order through
//! [`TaskSupplier::get_frame_to_display`].
//!
//! A slice that finds no free frame is kept in a backlog and [`DecodeError::NotEnoughBuffer`]
//! is returned. The client then outputs frames, or calls [`TaskSupplier::recover_dpb_space`],
//! and resumes with [`TaskSupplier::retry`].

use std::collections::HashMap;
use std::collections::VecDeque;
use std::rc::Rc;

use log::debug;
use log::warn;

use crate::codec::h264::frame::CodingStructure;
use crate::codec::h264::frame::DisplayPictureStruct;
use crate::codec::h264::frame::ErrorFlags;
use crate::codec::h264::frame::FillnessStatus;
use crate::codec::h264::frame::FrameId;
use crate::codec::h264::frame::FramePin;
use crate::codec::h264::frame::FramePool;
use crate::codec::h264::frame::PictureStructure;
use crate::codec::h264::marking::DecRefPicMarking;
use crate::codec::h264::parser::Slice;
use crate::codec::h264::parser::Sps;
use crate::codec::h264::sei::RecoveryPoint;
use crate::codec::h264::sei::SeiMessage;
use crate::decoder::output::DpbOutput;
use crate::decoder::skipping::SkipInfo;
use crate::decoder::skipping::Skipping;
use crate::decoder::task_broker::TaskBroker;
use crate::decoder::view::ViewList;
use crate::decoder::BlockingMode;
use crate::decoder::DecodeError;
use crate::decoder::DecodeResult;
use crate::decoder::DecodedFrame;
use crate::decoder::StreamOut;
use crate::decoder::SupplierParams;
use crate::decoder::VideoAccelerator;

/// Whether `two` continues the picture `one` belongs to, see 7.4.1.2.4.
fn is_picture_the_same(one: &Slice, two: &Slice) -> bool {
    let (a, b) = (&one.header, &two.header);

    if a.view_id != b.view_id {
        return false;
    }

    if a.dependency_id != b.dependency_id {
        return a.dependency_id < b.dependency_id;
    }

    if a.quality_id != b.quality_id {
        return a.quality_id < b.quality_id;
    }

    if a.frame_num != b.frame_num
        || a.pic_parameter_set_id != b.pic_parameter_set_id
        || a.field_pic_flag != b.field_pic_flag
        || a.bottom_field_flag != b.bottom_field_flag
    {
        return false;
    }

    if a.nal_ref_idc != b.nal_ref_idc && a.nal_ref_idc.min(b.nal_ref_idc) == 0 {
        return false;
    }

    if two.sps.pic_order_cnt_type == 0 {
        if a.pic_order_cnt_lsb != b.pic_order_cnt_lsb
            || a.delta_pic_order_cnt_bottom != b.delta_pic_order_cnt_bottom
        {
            return false;
        }
    } else if a.delta_pic_order_cnt != b.delta_pic_order_cnt {
        return false;
    }

    if a.idr_pic_flag != b.idr_pic_flag {
        return false;
    }

    !(a.idr_pic_flag && b.idr_pic_flag && a.idr_pic_id != b.idr_pic_id)
}

/// The slices of one view layer of the pending access unit.
struct Layer {
    slices: Vec<Slice>,
    /// SEI messages received before the layer started.
    payloads: Vec<(u16, SeiMessage)>,
    /// An SEI, delimiter or end of sequence closed the layer.
    full: bool,
    frame: Option<FrameId>,
    completed: bool,
}

impl Layer {
    fn new(slice: Slice, payloads: Vec<(u16, SeiMessage)>) -> Self {
        Self {
            slices: vec![slice],
            payloads,
            full: false,
            frame: None,
            completed: false,
        }
    }

    fn first_slice(&self) -> &Slice {
        &self.slices[0]
    }

    fn last_slice(&self) -> &Slice {
        &self.slices[self.slices.len() - 1]
    }

    fn view_id(&self) -> u16 {
        self.first_slice().header.view_id
    }

    fn dependency_id(&self) -> u8 {
        self.first_slice().header.dependency_id
    }
}

/// The access unit being gathered.
#[derive(Default)]
struct PendingAccessUnit {
    layers: Vec<Layer>,
    /// Processing started. No slice is accepted anymore.
    full: bool,
    /// Views are allocated and frame_num gaps filled.
    initialized: bool,
}

impl PendingAccessUnit {
    /// Adds `slice` if it belongs to this access unit. A new layer takes the pending SEI
    /// messages along.
    fn add_slice(&mut self, slice: &Slice, payloads: &mut Vec<(u16, SeiMessage)>) -> bool {
        if self.full {
            return false;
        }

        let hdr = &slice.header;
        let pos = self
            .layers
            .iter()
            .position(|l| l.view_id() == hdr.view_id && l.dependency_id() == hdr.dependency_id);

        let Some(pos) = pos else {
            if self
                .layers
                .last()
                .is_some_and(|l| l.dependency_id() > hdr.dependency_id)
            {
                return false;
            }

            self.layers
                .push(Layer::new(slice.clone(), std::mem::take(payloads)));
            return true;
        };

        let layer = &mut self.layers[pos];
        if layer.full || !is_picture_the_same(layer.last_slice(), slice) {
            return false;
        }

        layer.slices.push(slice.clone());
        payloads.clear();
        true
    }

    fn complete_last_layer(&mut self) {
        if let Some(layer) = self.layers.last_mut() {
            layer.full = true;
        }
    }
}

/// A decoding session for one stream.
pub struct TaskSupplier<A: VideoAccelerator> {
    accel: A,
    params: SupplierParams,

    pool: FramePool,
    views: ViewList,
    marking: DecRefPicMarking,
    broker: TaskBroker,
    output: DpbOutput,
    skipping: Skipping,

    /// SPS in use, by id.
    active_sps: HashMap<u8, Rc<Sps>>,
    /// Id of the SPS activated last.
    current_sps_id: Option<u8>,

    current: Option<PendingAccessUnit>,
    /// Slices waiting for the pending access unit to be processed.
    backlog: VecDeque<Slice>,
    /// SEI messages for the next layer to start, with the view they were received for.
    pending_sei: Vec<(u16, SeiMessage)>,
    recovery_point: Option<RecoveryPoint>,

    /// Keeps frames alive from allocation until their decoding completes.
    decode_pins: Vec<FramePin>,
    /// Decoding order counter.
    uid: u64,
    extra_dpb_size: usize,
    /// Non-intra slices are dropped until an intra slice or a recovery point shows up.
    wait_for_idr: bool,
}

impl<A: VideoAccelerator> TaskSupplier<A> {
    pub fn new(accel: A, params: SupplierParams) -> DecodeResult<Self> {
        let mut views = ViewList::new();
        views.set_view_list(&[&params.target_views[..], &params.dependency_views[..]].concat());
        for &view_id in &params.dependency_views {
            views.get_view(view_id)?.is_displayable = false;
        }

        let mut supplier = Self {
            accel,
            broker: TaskBroker::new(params.blocking_mode, params.buffered_frames),
            pool: FramePool::new(),
            views,
            marking: DecRefPicMarking::new(),
            output: DpbOutput::new(),
            skipping: Skipping::new(),
            active_sps: HashMap::new(),
            current_sps_id: None,
            current: None,
            backlog: VecDeque::new(),
            pending_sei: Vec::new(),
            recovery_point: None,
            decode_pins: Vec::new(),
            uid: 0,
            extra_dpb_size: params.extra_dpb_size,
            wait_for_idr: true,
            params,
        };

        supplier.reset_processing_state();
        Ok(supplier)
    }

    pub fn accelerator(&self) -> &A {
        &self.accel
    }

    pub fn accelerator_mut(&mut self) -> &mut A {
        &mut self.accel
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    pub fn views(&self) -> &ViewList {
        &self.views
    }

    pub fn marking(&self) -> &DecRefPicMarking {
        &self.marking
    }

    pub fn output(&self) -> &DpbOutput {
        &self.output
    }

    pub fn is_waiting_for_idr(&self) -> bool {
        self.wait_for_idr
    }

    /// Number of slices waiting for a free frame.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    fn disable_output_delay(&self) -> bool {
        self.params.disable_output_delay || self.params.buffered_frames != 0
    }

    fn current_sps(&self) -> Option<&Sps> {
        self.current_sps_id
            .and_then(|id| self.active_sps.get(&id))
            .map(|sps| sps.as_ref())
    }

    /// Feeds the next slice in decoding order.
    ///
    /// Returns [`DecodeError::NotEnoughBuffer`] when no frame is free. The slice is kept and
    /// [`Self::retry`] processes it once frames have been released.
    pub fn add_slice(&mut self, slice: Slice) -> DecodeResult<()> {
        self.backlog.push_back(slice);
        self.process_backlog()
    }

    /// Resumes the slices left over by a [`DecodeError::NotEnoughBuffer`] error.
    pub fn retry(&mut self) -> DecodeResult<()> {
        self.process_backlog()
    }

    fn process_backlog(&mut self) -> DecodeResult<()> {
        while let Some(slice) = self.backlog.front().cloned() {
            let res = self.process_slice(slice);
            if matches!(res, Err(DecodeError::NotEnoughBuffer)) {
                return res;
            }

            self.backlog.pop_front();
            res?;
        }

        Ok(())
    }

    fn process_slice(&mut self, slice: Slice) -> DecodeResult<()> {
        if self.views.is_should_skip_slice(&slice.header) {
            debug!(
                "Skipping slice of view {} (temporal_id {})",
                slice.header.view_id, slice.header.temporal_id
            );
            return Ok(());
        }

        if !self.check_wait_for_idr(&slice)? {
            return Ok(());
        }

        self.activate_sps(&slice)?;

        if let Some(au) = self.current.as_mut() {
            if au.add_slice(&slice, &mut self.pending_sei) {
                return Ok(());
            }
        }

        let res = self.process_access_unit(false);
        if matches!(res, Err(DecodeError::NotEnoughBuffer)) {
            return res;
        }

        let mut au = PendingAccessUnit::default();
        au.add_slice(&slice, &mut self.pending_sei);
        self.current = Some(au);

        res
    }

    /// Drops non-intra slices until the stream can be decoded from scratch, and arms recovery
    /// points. Returns whether the slice is kept.
    fn check_wait_for_idr(&mut self, slice: &Slice) -> DecodeResult<bool> {
        let hdr = &slice.header;

        if self.wait_for_idr && !hdr.slice_type.is_i() && self.recovery_point.is_none() {
            debug!(
                "Dropping {:?} slice of frame_num {} while waiting for an IDR",
                hdr.slice_type, hdr.frame_num
            );
            return Ok(false);
        }

        if let Some(recovery_frame_cnt) = self.recovery_point.as_ref().map(|r| r.recovery_frame_cnt)
        {
            if self.wait_for_idr {
                let max_frame_num = slice.sps.max_frame_num();
                let cnt = (recovery_frame_cnt + u32::from(hdr.frame_num)) % max_frame_num;
                let layer = usize::from(hdr.dependency_id);

                debug!("Starting at a recovery point, frame_num {} is exact", cnt);
                self.allocate_and_initialize_view(slice)?;
                self.views
                    .get_view(hdr.view_id)?
                    .dpb_mut(layer)
                    .set_recovery_frame_cnt(Some(cnt as i32));
            }

            if !hdr.slice_type.is_i() {
                self.recovery_point = None;
            }
        }

        self.wait_for_idr = false;
        Ok(true)
    }

    /// Records the SPS of `slice`. A new or changed SPS resizes the view's DPB.
    fn activate_sps(&mut self, slice: &Slice) -> DecodeResult<()> {
        let sps = &slice.sps;
        let id = sps.seq_parameter_set_id;

        let changed = match self.active_sps.get(&id) {
            Some(active) => !Rc::ptr_eq(active, sps) && **active != **sps,
            None => true,
        };

        if changed {
            debug!("Activating SPS {}", id);
            self.output.on_new_sps(sps);
            if let Some(view) = self.views.find_view_mut(slice.header.view_id) {
                view.set_dpb_size(sps, None);
            }
            self.active_sps.insert(id, Rc::clone(sps));
        }

        self.current_sps_id = Some(id);
        Ok(())
    }

    /// Allocates the view of `slice`. A view that has not decoded anything yet is sized after
    /// the slice's SPS.
    fn allocate_and_initialize_view(&mut self, slice: &Slice) -> DecodeResult<()> {
        let view = self.views.get_view(slice.header.view_id)?;
        if view.output_layer().is_none() {
            view.set_dpb_size(&slice.sps, None);
        }

        Ok(())
    }

    /// Records an SEI message. Recovery points arm the recovery logic, everything else applies
    /// to the next frame of `view_id`.
    pub fn add_sei(&mut self, view_id: u16, message: SeiMessage) {
        if let Some(au) = self.current.as_mut() {
            au.complete_last_layer();
        }

        match message {
            SeiMessage::RecoveryPoint(recovery_point) => {
                debug!(
                    "Recovery point: recovery_frame_cnt {}",
                    recovery_point.recovery_frame_cnt
                );
                self.recovery_point = Some(recovery_point);
            }
            message => self.pending_sei.push((view_id, message)),
        }
    }

    /// An access unit delimiter closes the layer being gathered.
    pub fn access_unit_delimiter(&mut self) {
        if let Some(au) = self.current.as_mut() {
            au.complete_last_layer();
        }
    }

    /// End of sequence or stream. The next picture must be an IDR or a recovery point.
    pub fn end_of_sequence(&mut self) {
        if let Some(au) = self.current.as_mut() {
            au.complete_last_layer();
        }

        self.wait_for_idr = true;
    }

    /// Turns the pending access unit into frames. `force` closes unpaired fields, for the end of
    /// the stream.
    fn process_access_unit(&mut self, force: bool) -> DecodeResult<()> {
        let Some(mut au) = self.current.take() else {
            return Ok(());
        };

        au.full = true;
        let res = self.run_access_unit(&mut au, force);
        if matches!(res, Err(DecodeError::NotEnoughBuffer)) {
            self.current = Some(au);
            return res;
        }

        self.complete_decoded_frames()?;
        res
    }

    fn run_access_unit(&mut self, au: &mut PendingAccessUnit, force: bool) -> DecodeResult<()> {
        if !au.initialized {
            let max_dependency_id = au.layers.last().map_or(0, |l| l.dependency_id());

            for layer in &au.layers {
                let slice = layer.first_slice();
                let view_id = slice.header.view_id;
                self.allocate_and_initialize_view(slice)?;

                let cur_frame = self.views.get_view(view_id)?.cur_frame;
                if let Some(cur) = cur_frame {
                    if self.pool[cur].structure_for_dec == CodingStructure::Field
                        && !self.is_field_of_one_frame(cur, slice)
                    {
                        if self.process_non_paired_field(cur) {
                            self.on_full_frame(cur);
                        }
                        self.views.get_view(view_id)?.cur_frame = None;
                    }
                }

                let layer_idx = usize::from(slice.header.dependency_id);
                let gap = self
                    .views
                    .get_view(view_id)?
                    .poc_mut(layer_idx)
                    .detect_frame_num_gap(&slice.header, &slice.sps, false);
                if gap != 0 {
                    self.views.get_view(view_id)?.cur_frame = None;
                    self.process_frame_num_gap(slice, layer.dependency_id(), max_dependency_id)?;
                }
            }

            au.initialized = true;
        }

        for layer in au.layers.iter_mut() {
            if layer.frame.is_some() {
                continue;
            }

            let id = self.allocate_new_frame(layer.first_slice())?;
            layer.frame = Some(id);
            self.apply_payloads_to_frame(id, &layer.slices, &layer.payloads);
        }

        let mut res = Ok(());
        for layer in au.layers.iter_mut() {
            let Some(id) = layer.frame else {
                continue;
            };

            if layer.completed {
                continue;
            }

            let last = layer.last_slice();
            let view_id = last.header.view_id;
            let layer_idx = self.pool[id].layer;
            let view = self.views.get_view(view_id)?;
            view.cur_frame = Some(id);

            if !last.sps.gaps_in_frame_num_value_allowed_flag && !last.header.slice_type.is_b() {
                self.marking
                    .dpb_sanitize(&mut self.pool, view.dpb_mut(layer_idx), id);
            }

            let field_index = self.pool[id].field_index_by_parity(last.header.bottom_field_flag);
            if self.pool[id].aus[field_index].slice_count() == 0 {
                for slice in &layer.slices {
                    self.add_slice_to_frame(id, slice, field_index)?;
                }
            }

            if let Err(err) = self.complete_frame(id, field_index) {
                if res.is_ok() {
                    res = Err(err);
                }
            }

            let is_field = self.pool[id].structure_for_dec == CodingStructure::Field;
            if is_field && force && self.process_non_paired_field(id) {
                self.on_full_frame(id);
                self.views.get_view(view_id)?.cur_frame = None;
            }

            if !is_field || field_index != 0 {
                self.on_full_frame(id);
                self.views.get_view(view_id)?.cur_frame = None;
            }

            layer.completed = true;
        }

        res
    }

    /// Whether `slice` is the second field of the frame whose first field is `id`.
    fn is_field_of_one_frame(&self, id: FrameId, slice: &Slice) -> bool {
        let frame = &self.pool[id];
        let Some(first) = frame.aus[0].first_slice() else {
            return false;
        };

        if frame.au_count() == 2 && frame.aus_reached(FillnessStatus::Filled) {
            return false;
        }

        let (a, b) = (&first.header, &slice.header);
        a.is_reference() == b.is_reference()
            && a.field_pic_flag == b.field_pic_flag
            && a.frame_num == b.frame_num
            && a.bottom_field_flag != b.bottom_field_flag
    }

    /// Gives a field whose opposite field never arrived the POC and PicNum of its missing
    /// partner. Returns whether the frame was such a field.
    fn process_non_paired_field(&mut self, id: FrameId) -> bool {
        let frame = &mut self.pool[id];
        if frame.aus[1].status() != FillnessStatus::NotFilled {
            return false;
        }

        let poc = frame.field_poc(0);
        frame.set_poc(poc, 1);
        frame.aus[1].set_status(FillnessStatus::None);
        frame.bottom_field_flag[1] = !frame.bottom_field_flag[0];
        frame.set_pic_num(frame.frame_num * 2 + 1, 1);
        frame.error_flags |= if frame.bottom_field_flag[0] {
            ErrorFlags::TOP_FIELD_ABSENT
        } else {
            ErrorFlags::BOTTOM_FIELD_ABSENT
        };

        warn!(
            "Frame {} (frame_num {}) lacks its second field",
            id, frame.frame_num
        );
        true
    }

    /// Returns the frame `slice` is decoded into. A second field reuses the frame of the first
    /// one.
    fn allocate_new_frame(&mut self, slice: &Slice) -> DecodeResult<FrameId> {
        let view_id = slice.header.view_id;

        let cur_frame = self.views.get_view(view_id)?.cur_frame;
        if let Some(cur) = cur_frame {
            if self.pool[cur].structure_for_dec == CodingStructure::Field {
                self.views.get_view(view_id)?.cur_frame = None;
                if self.is_field_of_one_frame(cur, slice) {
                    debug!("Second field of frame {}", cur);
                    self.init_frame_counter(cur, slice)?;
                    return Ok(cur);
                }
            }
        }

        let id = self.get_free_frame(slice)?;
        self.uid += 1;
        self.pool[id].uid = Some(self.uid);
        self.decode_pins.push(self.pool.pin(id));

        if slice.header.field_pic_flag {
            self.pool[id].aus[1].set_status(FillnessStatus::NotFilled);
        }

        self.init_frame_counter(id, slice)?;
        Ok(id)
    }

    /// Finds a frame for `slice` in the DPB of its view layer: a new one while the DPB has room,
    /// a disposable one otherwise.
    pub fn get_free_frame(&mut self, slice: &Slice) -> DecodeResult<FrameId> {
        let hdr = &slice.header;
        let layer = usize::from(hdr.dependency_id);
        let view = self.views.get_view(hdr.view_id)?;
        let capacity =
            view.max_dec_frame_buffering + self.extra_dpb_size + self.params.buffered_frames;
        let dpb = view.dpb_mut(layer);

        let id = if dpb.count_all_frames() >= capacity {
            match dpb.get_disposable(&self.pool) {
                Some(id) => {
                    dpb.move_to_tail(id);
                    id
                }
                None => {
                    debug!(
                        "No free frame in view {} layer {} ({} frames)",
                        hdr.view_id,
                        layer,
                        dpb.count_all_frames()
                    );
                    return Err(DecodeError::NotEnoughBuffer);
                }
            }
        } else {
            let id = self.pool.alloc();
            dpb.append(id);
            id
        };

        self.marking.remove(id);

        let frame = &mut self.pool[id];
        frame.init(
            hdr.view_id,
            layer,
            PictureStructure::from_header(hdr.field_pic_flag, hdr.bottom_field_flag),
        );
        frame.frame_num = i32::from(hdr.frame_num);

        Ok(id)
    }

    /// Derives frame_num, PicNum and POC of the picture `slice` starts.
    fn init_frame_counter(&mut self, id: FrameId, slice: &Slice) -> DecodeResult<()> {
        let hdr = &slice.header;
        let sps = &slice.sps;
        let layer = self.pool[id].layer;
        let frame_num = i32::from(hdr.frame_num);
        let view = self.views.get_view(hdr.view_id)?;

        if view.poc_mut(layer).detect_frame_num_gap(hdr, sps, true) != 0 {
            let dpb = view.dpb_mut(layer);
            let (short_term, long_term) = dpb.count_active_refs(&self.pool);
            if short_term + long_term > 0 {
                warn!("Unexpected frame_num {} with references left", frame_num);
                self.pool[id].error_flags |= ErrorFlags::REFERENCE_FRAME;

                for other in dpb.ids() {
                    let frame = &mut self.pool[other];
                    if frame.frame_num > frame_num && frame.is_short_term_ref() {
                        frame.error_flags |= ErrorFlags::SHORT_TERM_STUCK;
                    }
                }
            }
        }

        let poc = view.poc_mut(layer);
        if hdr.idr_pic_flag {
            poc.reset(frame_num);
        }
        poc.decode(hdr, sps, frame_num);

        let recovery_frame_cnt = view.dpb_mut(layer).recovery_frame_cnt();
        let frame = &mut self.pool[id];
        frame.idr_flag = hdr.idr_pic_flag;
        frame.i_flag = hdr.slice_type.is_i() || recovery_frame_cnt == Some(frame.frame_num);

        if hdr.idr_pic_flag {
            view.dpb_mut(layer)
                .increase_ref_pic_list_reset_count(&mut self.pool, Some(id));
        }

        let frame = &mut self.pool[id];
        frame.frame_num = frame_num;

        let field_index = frame.field_index_by_parity(hdr.bottom_field_flag);
        if hdr.field_pic_flag {
            frame.set_pic_num(frame_num * 2 + 1, field_index);
        } else {
            frame.set_pic_num(frame_num, 0);
        }

        view.poc_mut(layer)
            .init_frame(frame.pocs_mut(), hdr.field_pic_flag, field_index);
        frame.init_ref_pic_list_reset_count(field_index);

        debug!(
            "Frame {} uid {:?}: view {} frame_num {} field {} POC {:?}",
            id,
            frame.uid,
            hdr.view_id,
            frame_num,
            field_index,
            [frame.field_poc(0), frame.field_poc(1)]
        );

        Ok(())
    }

    /// Fills every frame_num skipped before `slice` with a non-existing short-term reference,
    /// see 8.2.5.2.
    fn process_frame_num_gap(
        &mut self,
        slice: &Slice,
        dependency_id: u8,
        max_dependency_id: u8,
    ) -> DecodeResult<()> {
        let hdr = &slice.header;
        let sps = &slice.sps;
        let layer = usize::from(dependency_id);
        let view = self.views.get_view(hdr.view_id)?;

        let gap = view.poc_mut(layer).detect_frame_num_gap(hdr, sps, false);
        if gap == 0 {
            return Ok(());
        }

        let cap = if dependency_id == max_dependency_id {
            view.max_dec_frame_buffering
        } else {
            usize::from(sps.max_num_ref_frames)
        };
        let gap = (gap as usize).min(cap) as i32;

        let max_frame_num = sps.max_frame_num() as i32;
        let target_frame_num = i32::from(hdr.frame_num);
        let mut frame_num = (target_frame_num - gap).rem_euclid(max_frame_num);
        let structure = PictureStructure::from_header(hdr.field_pic_flag, hdr.bottom_field_flag);

        warn!(
            "frame_num gap before {}: synthesizing {} frame(s)",
            target_frame_num, gap
        );

        let mut gap_hdr = hdr.clone();
        gap_hdr.delta_pic_order_cnt = [0, 0];

        while frame_num != target_frame_num {
            let id = self.get_free_frame(slice)?;
            let _pin = self.pool.pin(id);
            self.uid += 1;
            self.pool[id].uid = Some(self.uid);

            let view = self.views.get_view(hdr.view_id)?;
            let poc = view.poc_mut(layer);
            if sps.pic_order_cnt_type != 0 {
                poc.decode(&gap_hdr, sps, frame_num);
            }
            let pocs = poc.frame_gap(hdr.field_pic_flag, frame_num);

            let frame = &mut self.pool[id];
            frame.frame_num = frame_num;
            *frame.pocs_mut() = pocs;
            if hdr.field_pic_flag {
                frame.set_pic_num(frame_num * 2 + 1, 0);
                frame.set_pic_num(frame_num * 2 + 1, 1);
            } else {
                frame.set_pic_num(frame_num, 0);
            }

            let dpb = view.dpb_mut(layer);
            for other in dpb.ids() {
                self.pool[other].update_frame_num_wrap(frame_num, max_frame_num, structure);
            }

            self.marking.slide_window(
                &mut self.pool,
                dpb,
                id,
                usize::from(sps.max_num_ref_frames),
                0,
            );

            let frame = &mut self.pool[id];
            frame.set_short_term_ref(true, 0);
            frame.set_short_term_ref(true, 1);
            frame.set_frame_as_non_exist();

            debug!(
                "Synthesized frame_num {} as frame {} (POC {:?})",
                frame_num, id, pocs
            );

            frame_num = (frame_num + 1) % max_frame_num;
        }

        Ok(())
    }

    /// Applies the SEI messages received ahead of a frame: display structure, output delay and
    /// marking repetition checks.
    fn apply_payloads_to_frame(
        &mut self,
        id: FrameId,
        slices: &[Slice],
        payloads: &[(u16, SeiMessage)],
    ) {
        let pic_timing = payloads.iter().find_map(|(_, message)| match message {
            SeiMessage::PicTiming(pic_timing) => Some(pic_timing),
            _ => None,
        });

        let frame = &mut self.pool[id];
        if frame.display_struct == DisplayPictureStruct::Unknown {
            let from_sei = pic_timing
                .and_then(|pt| pt.pic_struct)
                .and_then(DisplayPictureStruct::n);

            frame.display_struct = match from_sei {
                Some(display_struct) => display_struct,
                None if slices[0].header.field_pic_flag => {
                    if frame.field_index_by_parity(false) != 0 {
                        DisplayPictureStruct::Bottom
                    } else {
                        DisplayPictureStruct::Top
                    }
                }
                None if frame.field_poc(0) == frame.field_poc(1) => DisplayPictureStruct::Frame,
                None if frame.field_poc(0) < frame.field_poc(1) => DisplayPictureStruct::TopBottom,
                None => DisplayPictureStruct::BottomTop,
            };
        }

        frame.dpb_output_delay = self.output.get_dpb_output_delay(pic_timing);
        if slices.iter().any(|s| s.header.slice_type.is_b()) {
            self.output.get_dpb_output_delay(None);
        }

        for (view_id, message) in payloads {
            let SeiMessage::DecRefPicMarkingRepetition(repetition) = message else {
                continue;
            };

            let Some(dpb) = self.views.find_view(*view_id).and_then(|v| v.dpb(0)) else {
                continue;
            };

            if let Err(err) = self.marking.check_sei_repetition(&mut self.pool, dpb, repetition) {
                debug!("{}", err);
            }
        }
    }

    fn add_slice_to_frame(
        &mut self,
        id: FrameId,
        slice: &Slice,
        field_index: usize,
    ) -> DecodeResult<()> {
        let hdr = &slice.header;
        let layer = self.pool[id].layer;
        self.pool[id].aus[field_index].add_slice(slice.clone());

        let dpb = self.views.get_view(hdr.view_id)?.dpb_mut(layer);

        if !hdr.slice_type.is_i() {
            let (short_term, long_term) = dpb.count_active_refs(&self.pool);
            if short_term + long_term == 0 {
                warn!(
                    "{:?} slice of frame_num {} has no reference to predict from",
                    hdr.slice_type, hdr.frame_num
                );
            }
        }

        // PicNums of every reference, relative to this picture.
        let max_frame_num = slice.sps.max_frame_num() as i32;
        let frame_num = i32::from(hdr.frame_num);
        let structure = PictureStructure::from_header(hdr.field_pic_flag, hdr.bottom_field_flag);
        for other in dpb.ids() {
            let frame = &mut self.pool[other];
            frame.update_frame_num_wrap(frame_num, max_frame_num, structure);
            frame.update_long_term_pic_num(structure);
        }

        Ok(())
    }

    /// Closes field `field` of frame `id`: runs reference marking and decides whether the frame
    /// is skipped.
    ///
    /// A marking error is returned once the field is closed, so that the pipeline keeps going.
    pub fn complete_frame(&mut self, id: FrameId, field: usize) -> DecodeResult<()> {
        if self.pool[id].aus[field].status() > FillnessStatus::NotFilled {
            return Ok(());
        }

        let res = self.dbp_update(id, field);

        let au_is_field = self.pool[id].aus[field].is_field();
        if (!au_is_field || field != 0) && self.skipping.is_should_skip_frame(&self.pool[id]) {
            let frame = &mut self.pool[id];
            debug!("Skipping frame {} (frame_num {})", id, frame.frame_num);

            frame.aus[field].set_status(FillnessStatus::Completed);
            if au_is_field {
                frame.aus[0].set_status(FillnessStatus::Completed);
            }

            for index in 0..2 {
                frame.set_short_term_ref(false, index);
                frame.set_long_term_ref(false, index);
            }

            frame.skipped = true;
            frame.on_decoding_completed();
            return res;
        }

        if self.skipping.is_should_skip_deblocking(&self.pool[id], field) {
            self.pool[id].aus[field].skip_deblocking();
        }

        self.pool[id].aus[field].set_status(FillnessStatus::Filled);
        res
    }

    /// Runs reference marking for a field, driven by its first reference slice.
    fn dbp_update(&mut self, id: FrameId, field: usize) -> DecodeResult<()> {
        let Some(slice) = self.pool[id].aus[field]
            .slices()
            .iter()
            .find(|s| s.header.is_reference())
            .cloned()
        else {
            return Ok(());
        };

        let layer = self.pool[id].layer;
        let view = self.views.get_view(slice.header.view_id)?;
        let mut target = view.marking_target(&mut self.pool, layer);
        self.marking
            .update_ref_pic_marking(&mut target, id, &slice, field)?;

        Ok(())
    }

    /// Called once every field of frame `id` is in.
    pub fn on_full_frame(&mut self, id: FrameId) {
        let view_id = self.pool[id].view_id;
        let is_displayable = self
            .views
            .find_view(view_id)
            .map_or(true, |view| view.is_displayable);

        let frame = &mut self.pool[id];
        frame.full = true;

        if !is_displayable {
            frame.outputted = true;
            frame.displayed = true;
        }

        if frame.skipped {
            return;
        }

        if frame.idr_flag && !frame.error_flags.contains(ErrorFlags::DPB) {
            self.marking.reset_error();
        }

        if self.marking.dpb_error_found() {
            frame.error_flags |= ErrorFlags::DPB;
        }
    }

    /// Submits every full frame to the accelerator in decoding order, then collects the frames
    /// the broker reports as decoded. Returns the last frame whose decoding completed.
    pub fn complete_decoded_frames(&mut self) -> DecodeResult<Option<FrameId>> {
        self.submit_full_frames()?;

        while self.broker.is_enough_for_start_decoding(false) {
            if self
                .broker
                .get_next_task(&mut self.accel, &mut self.pool)?
                .is_none()
            {
                break;
            }
        }

        Ok(self.collect_decoded_frames())
    }

    fn submit_full_frames(&mut self) -> DecodeResult<()> {
        let mut ready: Vec<(u64, FrameId)> = Vec::new();
        for view in self.views.iter() {
            for (_, dpb) in view.dpbs() {
                for id in dpb.ids() {
                    let frame = &self.pool[id];
                    if frame.full && frame.exists && !frame.decoded && !frame.decoding_started {
                        ready.push((frame.uid.unwrap_or(0), id));
                    }
                }
            }
        }

        ready.sort_unstable();

        for (_, id) in ready {
            self.broker
                .add_frame_to_decoding(&mut self.accel, &mut self.pool, id)?;
        }

        Ok(())
    }

    fn collect_decoded_frames(&mut self) -> Option<FrameId> {
        let mut completed = None;
        for view in self.views.iter() {
            for (_, dpb) in view.dpbs() {
                for id in dpb.ids() {
                    let frame = &mut self.pool[id];
                    if frame.decoding_completed && !frame.decoded {
                        frame.on_decoding_completed();
                        completed = Some(id);
                    }
                }
            }
        }

        let pool = &self.pool;
        self.decode_pins.retain(|pin| !pool[pin.id()].decoded);

        completed
    }

    /// Picks the next frame to output.
    ///
    /// Views take turns. A frame is output once the DPB holds more frames than the stream needs
    /// to be stored, or right away when its output delay allows it. `force` outputs the oldest
    /// frame regardless, to drain the DPB.
    pub fn get_frame_to_display(&mut self, force: bool) -> Option<DecodedFrame> {
        let id = self.find_frame_to_display(force)?;

        if !self.pool[id].decoded {
            debug!("Frame {} is due for output but still decoding", id);
            return None;
        }

        let frame = &mut self.pool[id];
        frame.outputted = true;
        let (view_id, layer) = (frame.view_id, frame.layer);

        let view = self.views.find_view_mut(view_id)?;
        let timestamp = view.local_frame_time;
        view.local_frame_time += 1;
        view.dpb_mut(layer).set_recovery_frame_cnt(None);
        self.views.increase_current_view();

        let frame = &self.pool[id];
        debug!(
            "Output frame {} of view {}: frame_num {} POC {}",
            id,
            view_id,
            frame.frame_num,
            frame.min_poc()
        );

        Some(DecodedFrame {
            view_id,
            id,
            poc: frame.min_poc(),
            frame_num: frame.frame_num,
            display_struct: frame.display_struct,
            error_flags: frame.error_flags,
            is_skipped: frame.skipped,
            uid: frame.uid.unwrap_or(0),
            timestamp,
        })
    }

    fn find_frame_to_display(&mut self, force: bool) -> Option<FrameId> {
        for number in 0..self.views.len() {
            let current = self.views.current_view();
            let view = self.views.get_view_by_number(number)?;

            if number != current || !view.is_valid() || !view.is_displayable {
                if number == current {
                    self.views.increase_current_view();
                }
                continue;
            }

            let dpb = view.dpb(view.output_layer()?)?;
            let displayable = dpb.count_num_displayable(&self.pool);

            if force || displayable > view.max_dec_frame_buffering + self.params.buffered_frames {
                let id = dpb.find_oldest_displayable(&self.pool)?;
                let recovery_frame_cnt = dpb.recovery_frame_cnt();

                let frame = &mut self.pool[id];
                if !frame.exists || recovery_frame_cnt.is_some_and(|cnt| cnt != frame.frame_num) {
                    frame.error_flags |= ErrorFlags::RECOVERY;
                }

                return Some(id);
            }

            if self.output.is_use_delay_output_value() {
                return dpb.find_displayable_by_dpb_delay(&self.pool);
            }

            return None;
        }

        None
    }

    /// The display consumer is done with frame `id`.
    pub fn frame_displayed(&mut self, id: FrameId) {
        if let Some(frame) = self.pool.get_mut(id) {
            frame.displayed = true;
        }
    }

    /// Makes progress after [`DecodeError::NotEnoughBuffer`] when the client cannot release
    /// frames. May hand out a frame ahead of time, which the client must output before calling
    /// [`Self::retry`].
    pub fn recover_dpb_space(&mut self) -> DecodeResult<Option<DecodedFrame>> {
        let Some(slice) = self.backlog.front() else {
            return Ok(None);
        };

        let (view_id, layer) = (slice.header.view_id, usize::from(slice.header.dependency_id));
        if let Some(dpb) = self.views.find_view(view_id).and_then(|v| v.dpb(layer)) {
            // Frames are on their way out, the client has to release them.
            if dpb.is_disposable_exist(&self.pool) || dpb.is_almost_disposable_exist(&self.pool) {
                return Ok(None);
            }
        }

        if !self.broker.is_empty() {
            self.broker.get_next_task(&mut self.accel, &mut self.pool)?;
            self.collect_decoded_frames();
            return Ok(None);
        }

        if self.complete_decoded_frames()?.is_some() {
            return Ok(None);
        }

        if let Some(frame) = self.get_frame_to_display(true) {
            return Ok(Some(frame));
        }

        self.prevent_dpb_fullness();
        Ok(None)
    }

    /// Frees a DPB slot by dropping the oldest long-term reference when the DPB only holds
    /// long-term references. Restarts the session if that is not enough.
    pub fn prevent_dpb_fullness(&mut self) {
        let Some(num_ref_frames) = self.current_sps().map(|sps| usize::from(sps.max_num_ref_frames))
        else {
            return;
        };

        let mut exhausted = false;
        for view in self.views.iter() {
            for (layer, dpb) in view.dpbs() {
                let (_, long_term) = dpb.count_active_refs(&self.pool);
                if long_term == num_ref_frames {
                    if let Some(id) = dpb.find_oldest_long_term_ref(&self.pool) {
                        warn!(
                            "DPB of view {} layer {} is full of long-term references, dropping frame {}",
                            view.view_id, layer, id
                        );
                        let frame = &mut self.pool[id];
                        frame.set_long_term_ref(false, 0);
                        frame.set_long_term_ref(false, 1);
                        frame.reset();
                    }
                }

                if !dpb.is_disposable_exist(&self.pool) {
                    exhausted = true;
                }
            }
        }

        if exhausted {
            self.after_error_restore();
        }
    }

    pub fn change_video_decoding_speed(&mut self, delta: i32) -> i32 {
        self.skipping.change_video_decoding_speed(delta)
    }

    pub fn skip_info(&self) -> SkipInfo {
        self.skipping.skip_info()
    }

    /// Fetches the decode statistics of frame `id`.
    pub fn query_stream_out(&mut self, id: FrameId) -> DecodeResult<Option<StreamOut>> {
        self.broker.query_stream_out(&mut self.accel, id)
    }

    /// End of stream: processes the pending access unit, closing unpaired fields, and waits for
    /// every frame to be decoded. Frames are then drained with `get_frame_to_display(true)`.
    pub fn flush(&mut self) -> DecodeResult<()> {
        self.process_backlog()?;
        self.process_access_unit(true)?;
        self.submit_full_frames()?;

        while !self.broker.is_empty() {
            let completed = self.broker.get_next_task_internal(
                &mut self.accel,
                &mut self.pool,
                BlockingMode::Blocking,
            )?;

            if completed.is_none() {
                break;
            }
        }

        self.collect_decoded_frames();
        Ok(())
    }

    fn reset_processing_state(&mut self) {
        self.broker.reset();
        self.marking.reset();
        self.output.reset(self.disable_output_delay());
        self.skipping.reset();
        self.skipping
            .change_video_decoding_speed(self.params.decoding_speed);

        self.current = None;
        self.backlog.clear();
        self.pending_sei.clear();
        self.recovery_point = None;
        self.decode_pins.clear();
        self.wait_for_idr = true;
    }

    /// Drops every frame and pending slice after an unrecoverable stream error. Decoding
    /// resumes at the next IDR or recovery point.
    pub fn after_error_restore(&mut self) {
        warn!("Restarting the session after an error");
        self.views.reset(&mut self.pool);
        self.reset_processing_state();
    }

    /// Returns the session to its initial state, keeping the views and frames allocated.
    pub fn reset(&mut self) {
        debug!("Resetting the session");
        self.views.reset(&mut self.pool);
        self.reset_processing_state();
        self.active_sps.clear();
        self.current_sps_id = None;
    }

    /// Releases every view and frame.
    pub fn close(&mut self) {
        self.reset();
        self.views.clear();
        self.pool.clear();
        self.extra_dpb_size = 1;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::dummy::Backend;
    use crate::codec::h264::parser::RefPicMarkingInner;
    use crate::codec::h264::parser::SliceHeaderBuilder;
    use crate::codec::h264::parser::SliceType;
    use crate::codec::h264::parser::SpsBuilder;
    use crate::codec::h264::sei::DecRefPicMarkingRepetition;
    use crate::codec::h264::sei::PicTiming;
    use crate::decoder::Corruption;
    use crate::decoder::SyncStatus;

    /// A POC type 0 SPS with MaxFrameNum 16 and the given reference and DPB sizes.
    pub(crate) fn sps(max_num_ref_frames: u8, max_dec_frame_buffering: u32) -> Rc<Sps> {
        SpsBuilder::new()
            .max_num_ref_frames(max_num_ref_frames)
            .max_frame_num(16)
            .max_pic_order_cnt_lsb(64)
            .bitstream_restriction(max_dec_frame_buffering, max_dec_frame_buffering)
            .build()
    }

    pub(crate) fn idr(sps: &Rc<Sps>) -> Slice {
        let hdr = SliceHeaderBuilder::new()
            .slice_type(SliceType::I)
            .idr(0)
            .build();
        Slice::new(hdr, Rc::clone(sps))
    }

    /// A reference P frame with POC `2 * frame_num` unless overridden.
    pub(crate) fn p(sps: &Rc<Sps>, frame_num: u16, poc_lsb: u16) -> Slice {
        let hdr = SliceHeaderBuilder::new()
            .slice_type(SliceType::P)
            .nal_ref_idc(1)
            .frame_num(frame_num)
            .pic_order_cnt_lsb(poc_lsb)
            .build();
        Slice::new(hdr, Rc::clone(sps))
    }

    /// A non-reference B frame.
    pub(crate) fn b(sps: &Rc<Sps>, frame_num: u16, poc_lsb: u16) -> Slice {
        let hdr = SliceHeaderBuilder::new()
            .slice_type(SliceType::B)
            .frame_num(frame_num)
            .pic_order_cnt_lsb(poc_lsb)
            .build();
        Slice::new(hdr, Rc::clone(sps))
    }

    pub(crate) fn session(params: SupplierParams) -> TaskSupplier<Backend> {
        let _ = env_logger::try_init();
        TaskSupplier::new(Backend::new(), params).unwrap()
    }

    /// Outputs and releases every frame left.
    pub(crate) fn drain(supplier: &mut TaskSupplier<Backend>) -> Vec<DecodedFrame> {
        supplier.flush().unwrap();
        let mut frames = Vec::new();
        while let Some(frame) = supplier.get_frame_to_display(true) {
            supplier.frame_displayed(frame.id);
            frames.push(frame);
        }
        frames
    }

    fn short_term_frame_nums(supplier: &TaskSupplier<Backend>, view_id: u16) -> Vec<i32> {
        let Some(dpb) = supplier.views().find_view(view_id).and_then(|v| v.dpb(0)) else {
            return Vec::new();
        };

        let mut frame_nums: Vec<i32> = dpb
            .ids()
            .map(|id| &supplier.pool()[id])
            .filter(|f| f.is_short_term_ref())
            .map(|f| f.frame_num)
            .collect();
        frame_nums.sort_unstable();
        frame_nums
    }

    fn frame_with_num(supplier: &TaskSupplier<Backend>, frame_num: i32) -> FrameId {
        let dpb = supplier.views().find_view(0).unwrap().dpb(0).unwrap();
        dpb.ids()
            .find(|&id| {
                let f = &supplier.pool()[id];
                f.frame_num == frame_num && f.exists && f.uid.is_some()
            })
            .unwrap()
    }

    #[test]
    fn sliding_window_keeps_latest_references() {
        let sps = sps(2, 4);
        let mut supplier = session(Default::default());

        supplier.add_slice(idr(&sps)).unwrap();
        for frame_num in 1..=4 {
            supplier
                .add_slice(p(&sps, frame_num, frame_num * 2))
                .unwrap();
        }

        // Frame 4 is still gathering slices, frame 3 went through marking.
        assert_eq!(short_term_frame_nums(&supplier, 0), vec![2, 3]);

        let frames = drain(&mut supplier);
        let pocs: Vec<i32> = frames.iter().map(|f| f.poc).collect();
        assert_eq!(pocs, vec![0, 2, 4, 6, 8]);
        assert!(frames.iter().all(|f| f.error_flags.is_empty()));
        assert_eq!(short_term_frame_nums(&supplier, 0), vec![3, 4]);
    }

    #[test]
    fn mmco5_acts_as_idr() {
        let sps = sps(4, 4);
        let mut supplier = session(Default::default());

        supplier.add_slice(idr(&sps)).unwrap();
        supplier.add_slice(p(&sps, 1, 2)).unwrap();
        supplier.add_slice(p(&sps, 2, 4)).unwrap();

        let hdr = SliceHeaderBuilder::new()
            .slice_type(SliceType::P)
            .nal_ref_idc(1)
            .frame_num(3)
            .pic_order_cnt_lsb(6)
            .mmco(RefPicMarkingInner {
                memory_management_control_operation: 5,
                ..Default::default()
            })
            .build();
        supplier.add_slice(Slice::new(hdr, Rc::clone(&sps))).unwrap();
        supplier.flush().unwrap();

        let dpb = supplier.views().find_view(0).unwrap().dpb(0).unwrap();
        let refs: Vec<FrameId> = dpb
            .ids()
            .filter(|&id| supplier.pool()[id].is_reference())
            .collect();
        assert_eq!(refs.len(), 1);

        let frame = &supplier.pool()[refs[0]];
        assert!(frame.idr_flag);
        assert_eq!(frame.frame_num, 0);
        assert_eq!(frame.min_poc(), 0);
        assert_eq!(
            supplier
                .views()
                .find_view(0)
                .unwrap()
                .poc(0)
                .unwrap()
                .prev_frame_ref_num(),
            0
        );
    }

    #[test]
    fn frame_num_gap_is_filled() {
        let sps = SpsBuilder::new()
            .max_num_ref_frames(3)
            .max_frame_num(16)
            .gaps_in_frame_num_value_allowed_flag(true)
            .bitstream_restriction(4, 4)
            .build();
        let mut supplier = session(Default::default());

        supplier.add_slice(idr(&sps)).unwrap();
        supplier.add_slice(p(&sps, 3, 6)).unwrap();
        supplier.flush().unwrap();

        let dpb = supplier.views().find_view(0).unwrap().dpb(0).unwrap();
        let mut synthesized: Vec<i32> = dpb
            .ids()
            .map(|id| &supplier.pool()[id])
            .filter(|f| !f.exists)
            .map(|f| f.frame_num)
            .collect();
        synthesized.sort_unstable();
        assert_eq!(synthesized, vec![1, 2]);
        assert_eq!(short_term_frame_nums(&supplier, 0), vec![1, 2, 3]);

        // Non-existing frames are never output.
        let frames = drain(&mut supplier);
        let frame_nums: Vec<i32> = frames.iter().map(|f| f.frame_num).collect();
        assert_eq!(frame_nums, vec![0, 3]);
    }

    #[test]
    fn frame_num_gap_is_capped() {
        let sps = SpsBuilder::new()
            .max_num_ref_frames(2)
            .max_frame_num(16)
            .gaps_in_frame_num_value_allowed_flag(true)
            .bitstream_restriction(2, 2)
            .build();
        let mut supplier = session(SupplierParams {
            extra_dpb_size: 3,
            ..Default::default()
        });

        supplier.add_slice(idr(&sps)).unwrap();
        supplier.add_slice(p(&sps, 9, 18)).unwrap();
        supplier.flush().unwrap();

        // Only as many frames as the DPB holds are synthesized.
        let dpb = supplier.views().find_view(0).unwrap().dpb(0).unwrap();
        let mut synthesized: Vec<i32> = dpb
            .ids()
            .map(|id| &supplier.pool()[id])
            .filter(|f| !f.exists)
            .map(|f| f.frame_num)
            .collect();
        synthesized.sort_unstable();
        assert_eq!(synthesized, vec![7, 8]);
        assert_eq!(short_term_frame_nums(&supplier, 0), vec![8, 9]);
    }

    #[test]
    fn unexpected_frame_num_is_flagged() {
        let sps = sps(4, 4);
        let mut supplier = session(Default::default());

        supplier.add_slice(idr(&sps)).unwrap();
        supplier.add_slice(p(&sps, 5, 2)).unwrap();
        supplier.flush().unwrap();

        let id = frame_with_num(&supplier, 5);
        assert!(supplier.pool()[id]
            .error_flags
            .contains(ErrorFlags::REFERENCE_FRAME));
    }

    #[test]
    fn fields_are_paired() {
        let sps = sps(2, 4);
        let mut supplier = session(Default::default());

        let top = SliceHeaderBuilder::new()
            .slice_type(SliceType::I)
            .idr(0)
            .field(false)
            .build();
        let bottom = SliceHeaderBuilder::new()
            .slice_type(SliceType::P)
            .nal_ref_idc(3)
            .field(true)
            .delta_pic_order_cnt_bottom(0)
            .pic_order_cnt_lsb(1)
            .build();

        supplier.add_slice(Slice::new(top, Rc::clone(&sps))).unwrap();
        supplier.add_slice(Slice::new(bottom, Rc::clone(&sps))).unwrap();

        let frames = drain(&mut supplier);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].display_struct, DisplayPictureStruct::Top);
        assert!(frames[0].error_flags.is_empty());

        let submitted = supplier.accelerator().submitted();
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[0].0, submitted[1].0);
        assert_eq!((submitted[0].1, submitted[1].1), (0, 1));

        let frame = &supplier.pool()[frames[0].id];
        assert_eq!(frame.short_term_mask(), 3);
        assert_eq!([frame.field_poc(0), frame.field_poc(1)], [0, 1]);
    }

    #[test]
    fn unpaired_field_is_completed() {
        let sps = sps(2, 4);
        let mut supplier = session(Default::default());

        let top = SliceHeaderBuilder::new()
            .slice_type(SliceType::I)
            .idr(0)
            .field(false)
            .build();
        supplier.add_slice(Slice::new(top, Rc::clone(&sps))).unwrap();
        supplier.add_slice(p(&sps, 1, 4)).unwrap();

        let frames = drain(&mut supplier);
        assert_eq!(frames.len(), 2);
        assert!(frames[0]
            .error_flags
            .contains(ErrorFlags::BOTTOM_FIELD_ABSENT));

        let frame = &supplier.pool()[frames[0].id];
        assert_eq!(frame.field_poc(1), frame.field_poc(0));
        assert_eq!(frame.aus[1].status(), FillnessStatus::None);
        assert!(frame.bottom_field_flag[1]);
    }

    #[test]
    fn unpaired_field_at_end_of_stream() {
        let sps = sps(2, 4);
        let mut supplier = session(Default::default());

        let bottom = SliceHeaderBuilder::new()
            .slice_type(SliceType::I)
            .idr(0)
            .field(true)
            .build();
        supplier.add_slice(Slice::new(bottom, Rc::clone(&sps))).unwrap();

        let frames = drain(&mut supplier);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].error_flags.contains(ErrorFlags::TOP_FIELD_ABSENT));
    }

    #[test]
    fn waits_for_intra_slice() {
        let sps = sps(2, 4);
        let mut supplier = session(Default::default());

        supplier.add_slice(p(&sps, 3, 6)).unwrap();
        supplier.add_slice(b(&sps, 4, 4)).unwrap();
        assert!(supplier.is_waiting_for_idr());
        assert!(supplier.views().is_empty());

        supplier.add_slice(idr(&sps)).unwrap();
        assert!(!supplier.is_waiting_for_idr());

        supplier.add_slice(p(&sps, 1, 2)).unwrap();
        supplier.end_of_sequence();
        assert!(supplier.is_waiting_for_idr());

        // Dropped, the sequence ended.
        supplier.add_slice(p(&sps, 2, 4)).unwrap();

        let frames = drain(&mut supplier);
        let frame_nums: Vec<i32> = frames.iter().map(|f| f.frame_num).collect();
        assert_eq!(frame_nums, vec![0, 1]);
    }

    #[test]
    fn recovery_point_starts_decoding() {
        let sps = sps(2, 4);
        let mut supplier = session(Default::default());

        supplier.add_sei(
            0,
            SeiMessage::RecoveryPoint(RecoveryPoint {
                recovery_frame_cnt: 2,
                ..Default::default()
            }),
        );
        supplier.add_slice(p(&sps, 4, 8)).unwrap();
        supplier.add_slice(p(&sps, 5, 10)).unwrap();
        supplier.add_slice(p(&sps, 6, 12)).unwrap();

        let frames = drain(&mut supplier);
        let frame_nums: Vec<i32> = frames.iter().map(|f| f.frame_num).collect();
        assert_eq!(frame_nums, vec![4, 5, 6]);

        // The first frame output precedes the recovery point.
        assert!(frames[0].error_flags.contains(ErrorFlags::RECOVERY));
        assert!(!frames[1].error_flags.contains(ErrorFlags::RECOVERY));
    }

    #[test]
    fn not_enough_buffer_and_recovery() {
        let sps = sps(1, 1);
        let mut supplier = session(SupplierParams {
            extra_dpb_size: 0,
            ..Default::default()
        });

        supplier.add_slice(idr(&sps)).unwrap();
        supplier.add_slice(p(&sps, 1, 2)).unwrap();
        assert!(matches!(
            supplier.add_slice(p(&sps, 2, 4)),
            Err(DecodeError::NotEnoughBuffer)
        ));
        assert_eq!(supplier.backlog_len(), 1);

        // The IDR is still a reference: nothing can be released, so it is output early.
        let frame = supplier.recover_dpb_space().unwrap().unwrap();
        assert_eq!(frame.frame_num, 0);
        assert!(matches!(
            supplier.retry(),
            Err(DecodeError::NotEnoughBuffer)
        ));

        // Nothing left to output: the session restarts.
        supplier.frame_displayed(frame.id);
        assert!(supplier.recover_dpb_space().unwrap().is_none());
        assert_eq!(supplier.backlog_len(), 0);
        assert!(supplier.is_waiting_for_idr());
        supplier.retry().unwrap();
    }

    #[test]
    fn retry_after_release() {
        let sps = sps(1, 1);
        let mut supplier = session(Default::default());

        supplier.add_slice(idr(&sps)).unwrap();
        supplier.add_slice(b(&sps, 1, 2)).unwrap();
        supplier.add_slice(b(&sps, 1, 4)).unwrap();
        assert!(matches!(
            supplier.add_slice(b(&sps, 1, 6)),
            Err(DecodeError::NotEnoughBuffer)
        ));
        assert_eq!(supplier.backlog_len(), 1);
        assert!(matches!(
            supplier.retry(),
            Err(DecodeError::NotEnoughBuffer)
        ));

        for poc in [0, 2] {
            let frame = supplier.get_frame_to_display(true).unwrap();
            assert_eq!(frame.poc, poc);
            supplier.frame_displayed(frame.id);
        }

        supplier.retry().unwrap();
        assert_eq!(supplier.backlog_len(), 0);

        let frame = supplier.get_frame_to_display(true).unwrap();
        assert_eq!(frame.poc, 4);
        supplier.frame_displayed(frame.id);

        let pocs: Vec<i32> = drain(&mut supplier).iter().map(|f| f.poc).collect();
        assert_eq!(pocs, vec![6]);
    }

    #[test]
    fn skipping_drops_non_reference_frames() {
        let sps = sps(2, 4);
        let mut supplier = session(Default::default());
        supplier.change_video_decoding_speed(7);

        supplier.add_slice(idr(&sps)).unwrap();
        supplier.add_slice(b(&sps, 1, 2)).unwrap();
        supplier.add_slice(p(&sps, 1, 4)).unwrap();

        let frames = drain(&mut supplier);
        assert_eq!(frames.len(), 3);
        assert!(frames[1].is_skipped);
        assert!(!frames[2].is_skipped);
        assert_eq!(supplier.skip_info().number_of_skipped_frames, 1);

        // The skipped frame never reached the accelerator.
        assert_eq!(supplier.accelerator().submitted().len(), 2);
    }

    #[test]
    fn deblocking_is_skipped_on_non_reference_frames() {
        let sps = sps(2, 4);
        let mut supplier = session(SupplierParams {
            decoding_speed: 5,
            ..Default::default()
        });

        supplier.add_slice(idr(&sps)).unwrap();
        supplier.add_slice(b(&sps, 1, 2)).unwrap();
        supplier.add_slice(b(&sps, 1, 4)).unwrap();
        supplier.add_slice(p(&sps, 1, 6)).unwrap();

        let frames = drain(&mut supplier);
        let skipped: Vec<bool> = frames.iter().map(|f| f.is_skipped).collect();
        assert_eq!(skipped, vec![false, true, false, false]);

        let deblocking_skipped: Vec<bool> = frames
            .iter()
            .map(|f| supplier.pool()[f.id].aus[0].is_deblocking_skipped())
            .collect();
        assert_eq!(deblocking_skipped, vec![false, false, true, false]);
    }

    #[test]
    fn views_are_output_in_turns() {
        let sps = sps(2, 4);
        let mut supplier = session(Default::default());

        for view_id in [0, 1] {
            let hdr = SliceHeaderBuilder::new()
                .slice_type(SliceType::I)
                .idr(0)
                .view_id(view_id)
                .build();
            supplier.add_slice(Slice::new(hdr, Rc::clone(&sps))).unwrap();
        }
        for view_id in [0, 1] {
            let hdr = SliceHeaderBuilder::new()
                .slice_type(SliceType::P)
                .nal_ref_idc(1)
                .frame_num(1)
                .pic_order_cnt_lsb(2)
                .view_id(view_id)
                .build();
            supplier.add_slice(Slice::new(hdr, Rc::clone(&sps))).unwrap();
        }

        assert_eq!(supplier.views().len(), 2);

        let frames = drain(&mut supplier);
        let order: Vec<(u16, i32)> = frames.iter().map(|f| (f.view_id, f.poc)).collect();
        assert_eq!(order, vec![(0, 0), (1, 0), (0, 2), (1, 2)]);
        assert_eq!(frames[2].timestamp, 1);
    }

    #[test]
    fn dependency_views_are_not_output() {
        let sps = sps(2, 4);
        let mut supplier = session(SupplierParams {
            target_views: vec![1],
            dependency_views: vec![0],
            ..Default::default()
        });

        for view_id in [0, 1, 2] {
            let hdr = SliceHeaderBuilder::new()
                .slice_type(SliceType::I)
                .idr(0)
                .view_id(view_id)
                .build();
            supplier.add_slice(Slice::new(hdr, Rc::clone(&sps))).unwrap();
        }

        assert!(supplier.views().find_view(2).is_none());

        let frames = drain(&mut supplier);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].view_id, 1);
        assert_eq!(supplier.accelerator().submitted().len(), 2);
    }

    #[test]
    fn invalid_mmco_flags_the_frame() {
        let sps = sps(4, 4);
        let mut supplier = session(Default::default());

        supplier.add_slice(idr(&sps)).unwrap();
        let hdr = SliceHeaderBuilder::new()
            .slice_type(SliceType::P)
            .nal_ref_idc(1)
            .frame_num(1)
            .pic_order_cnt_lsb(2)
            .mmco(RefPicMarkingInner {
                memory_management_control_operation: 9,
                ..Default::default()
            })
            .build();
        supplier.add_slice(Slice::new(hdr, Rc::clone(&sps))).unwrap();

        let res = supplier.add_slice(p(&sps, 2, 4));
        assert!(matches!(res, Err(DecodeError::InvalidStream(_))));
        assert!(supplier.marking().dpb_error_found());

        // The stream goes on and the error stays on every frame until the next IDR.
        supplier.add_slice(p(&sps, 3, 6)).unwrap();
        let frames = drain(&mut supplier);
        assert_eq!(frames.len(), 4);
        assert!(!frames[0].error_flags.contains(ErrorFlags::DPB));
        assert!(frames[1..].iter().all(|f| f.error_flags.contains(ErrorFlags::DPB)));
    }

    #[test]
    fn output_follows_poc_order() {
        let sps = sps(2, 2);
        let mut supplier = session(Default::default());

        let slices = [
            idr(&sps),
            p(&sps, 1, 6),
            b(&sps, 2, 2),
            b(&sps, 2, 4),
            p(&sps, 2, 12),
        ];

        let mut pocs = Vec::new();
        for slice in slices {
            supplier.add_slice(slice).unwrap();
            while let Some(frame) = supplier.get_frame_to_display(false) {
                supplier.frame_displayed(frame.id);
                pocs.push(frame.poc);
            }
        }

        // Bumping starts once the DPB is full.
        assert_eq!(pocs, vec![0, 2, 4]);

        pocs.extend(drain(&mut supplier).iter().map(|f| f.poc));
        assert_eq!(pocs, vec![0, 2, 4, 6, 12]);
    }

    #[test]
    fn pic_timing_zero_delay_outputs_early() {
        let sps = sps(2, 4);
        let mut supplier = session(Default::default());

        supplier.add_sei(
            0,
            SeiMessage::PicTiming(PicTiming {
                dpb_output_delay: Some(0),
                pic_struct: Some(DisplayPictureStruct::FrameDoubling as u8),
                ..Default::default()
            }),
        );
        supplier.add_slice(idr(&sps)).unwrap();
        supplier.add_slice(p(&sps, 1, 2)).unwrap();

        let frame = supplier.get_frame_to_display(false).unwrap();
        assert_eq!(frame.poc, 0);
        assert_eq!(frame.display_struct, DisplayPictureStruct::FrameDoubling);

        // Without timing the delay is not trusted anymore.
        supplier.add_slice(p(&sps, 2, 4)).unwrap();
        assert!(supplier.get_frame_to_display(false).is_none());
    }

    #[test]
    fn marking_repetition_is_checked() {
        let sps = sps(2, 4);
        let mut supplier = session(Default::default());
        let repetition = |original_idr_flag, original_frame_num| {
            SeiMessage::DecRefPicMarkingRepetition(DecRefPicMarkingRepetition {
                original_idr_flag,
                original_frame_num,
                ..Default::default()
            })
        };

        supplier.add_slice(idr(&sps)).unwrap();
        supplier.add_sei(0, repetition(true, 0));
        supplier.add_slice(p(&sps, 1, 2)).unwrap();
        supplier.add_slice(p(&sps, 2, 4)).unwrap();
        assert!(!supplier.marking().dpb_error_found());

        // frame_num 1 was not an IDR.
        supplier.add_sei(0, repetition(true, 1));
        supplier.add_slice(p(&sps, 3, 6)).unwrap();
        supplier.add_slice(p(&sps, 4, 8)).unwrap();
        assert!(supplier.marking().dpb_error_found());

        let id = frame_with_num(&supplier, 1);
        assert!(supplier.pool()[id].error_flags.contains(ErrorFlags::DPB));
    }

    #[test]
    fn device_failure_is_reported() {
        let sps = sps(2, 4);
        let mut supplier = session(Default::default());

        supplier
            .accelerator_mut()
            .push_status(SyncStatus::DeviceFailed);
        supplier.add_slice(idr(&sps)).unwrap();
        assert!(matches!(
            supplier.add_slice(p(&sps, 1, 2)),
            Err(DecodeError::DeviceFailed)
        ));

        supplier
            .accelerator_mut()
            .push_status(SyncStatus::Ready(Corruption::Major));
        let frames = drain(&mut supplier);
        assert_eq!(frames.len(), 2);
        assert!(frames[0].error_flags.contains(ErrorFlags::MAJOR));
    }

    #[test]
    fn buffered_frames_hold_output_back() {
        let sps = sps(2, 1);
        let mut supplier = session(SupplierParams {
            buffered_frames: 1,
            ..Default::default()
        });
        assert!(!supplier.output().is_use_delay_output_value());

        supplier.add_slice(idr(&sps)).unwrap();
        supplier.add_slice(p(&sps, 1, 2)).unwrap();
        supplier.add_slice(p(&sps, 2, 4)).unwrap();
        assert!(supplier.get_frame_to_display(false).is_none());

        supplier.add_slice(p(&sps, 3, 6)).unwrap();
        let frame = supplier.get_frame_to_display(false).unwrap();
        assert_eq!(frame.poc, 0);
    }

    #[test]
    fn reset_waits_for_idr() {
        let sps = sps(2, 4);
        let mut supplier = session(Default::default());

        supplier.add_slice(idr(&sps)).unwrap();
        supplier.add_slice(p(&sps, 1, 2)).unwrap();
        supplier.reset();

        assert!(supplier.is_waiting_for_idr());
        assert!(supplier.marking().log().is_empty());
        assert!(supplier.get_frame_to_display(true).is_none());

        supplier.add_slice(p(&sps, 2, 4)).unwrap();
        supplier.add_slice(idr(&sps)).unwrap();
        let frames = drain(&mut supplier);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_num, 0);

        supplier.close();
        assert!(supplier.views().is_empty());
        assert!(supplier.pool().is_empty());
    }

    #[test]
    fn prevent_dpb_fullness_drops_long_term_references() {
        let sps = sps(1, 1);
        let mut supplier = session(Default::default());

        let hdr = SliceHeaderBuilder::new()
            .slice_type(SliceType::I)
            .idr(0)
            .long_term_reference()
            .build();
        supplier.add_slice(Slice::new(hdr, Rc::clone(&sps))).unwrap();
        supplier.flush().unwrap();

        let id = frame_with_num(&supplier, 0);
        assert!(supplier.pool()[id].is_long_term_ref());

        supplier.prevent_dpb_fullness();
        assert!(!supplier.pool()[id].is_reference());
        assert!(supplier.pool()[id].is_disposable());
    }

    #[test]
    fn recycled_frames_keep_decoding_order() {
        let sps = sps(1, 1);
        let mut supplier = session(Default::default());
        let mut frames = Vec::new();

        supplier.add_slice(idr(&sps)).unwrap();
        for frame_num in 1..=4 {
            let mut res = supplier.add_slice(p(&sps, frame_num, frame_num * 2));
            for _ in 0..8 {
                if !matches!(res, Err(DecodeError::NotEnoughBuffer)) {
                    break;
                }
                if let Some(frame) = supplier.recover_dpb_space().unwrap() {
                    supplier.frame_displayed(frame.id);
                    frames.push(frame);
                }
                res = supplier.retry();
            }
            res.unwrap();

            while let Some(frame) = supplier.get_frame_to_display(false) {
                supplier.frame_displayed(frame.id);
                frames.push(frame);
            }
        }
        frames.extend(drain(&mut supplier));

        let pocs: Vec<i32> = frames.iter().map(|f| f.poc).collect();
        assert_eq!(pocs, vec![0, 2, 4, 6, 8]);

        let dpb = supplier.views().find_view(0).unwrap().dpb(0).unwrap();
        assert_eq!(dpb.count_all_frames(), 2);
        let uids: Vec<u64> = dpb
            .ids()
            .map(|id| supplier.pool()[id].uid.unwrap())
            .collect();
        assert!(uids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn picture_boundaries() {
        let sps = sps(2, 4);
        let first = p(&sps, 1, 2);

        assert!(is_picture_the_same(&first, &p(&sps, 1, 2)));
        assert!(!is_picture_the_same(&first, &p(&sps, 2, 2)));
        assert!(!is_picture_the_same(&first, &p(&sps, 1, 4)));
        assert!(!is_picture_the_same(&first, &b(&sps, 1, 2)));
        assert!(!is_picture_the_same(&idr(&sps), &first));

        let mut other_idr = idr(&sps);
        other_idr.header.idr_pic_id = 1;
        assert!(!is_picture_the_same(&idr(&sps), &other_idr));

        let mut enhancement = first.clone();
        enhancement.header.dependency_id = 1;
        assert!(is_picture_the_same(&first, &enhancement));
        assert!(!is_picture_the_same(&enhancement, &first));
    }
}
