// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Views of a multiview stream and the layers of each view.
//!
//! Every view keeps one DPB and one POC decoder per layer (SVC `dependency_id`). Plain AVC
//! streams only ever use layer 0 of view 0. Layers are created on first use.

use anyhow::anyhow;
use log::debug;

use crate::codec::h264::dpb::DpbList;
use crate::codec::h264::frame::FrameId;
use crate::codec::h264::frame::FramePool;
use crate::codec::h264::marking::MarkingTarget;
use crate::codec::h264::parser::Level;
use crate::codec::h264::parser::MaxLongTermFrameIdx;
use crate::codec::h264::parser::SliceHeader;
use crate::codec::h264::parser::Sps;
use crate::codec::h264::poc::PocDecoder;
use crate::decoder::DecodeError;
use crate::decoder::DecodeResult;

pub const MAX_NUM_LAYERS: usize = 16;
pub const MAX_NUM_VIEW: u16 = 1024;
/// Marks a view slot that can be reused.
pub const INVALID_VIEW_ID: u16 = u16::MAX;

const DEFAULT_MAX_DEC_FRAME_BUFFERING: usize = 16;
const HIGHEST_TEMPORAL_ID: u8 = 7;
const HIGHEST_PRIORITY_ID: u8 = 63;

#[derive(Debug)]
pub struct ViewItem {
    pub view_id: u16,
    dpbs: [Option<DpbList>; MAX_NUM_LAYERS],
    pocs: [Option<PocDecoder>; MAX_NUM_LAYERS],
    max_long_term_frame_idx: [MaxLongTermFrameIdx; MAX_NUM_LAYERS],
    pub max_dec_frame_buffering: usize,
    pub max_num_reorder_frames: usize,
    /// Whether frames of this view are handed to the client.
    pub is_displayable: bool,
    /// Number of frames output so far.
    pub local_frame_time: u64,
    /// Frame whose second field is still expected.
    pub cur_frame: Option<FrameId>,
}

impl ViewItem {
    pub fn new(view_id: u16) -> Self {
        Self {
            view_id,
            dpbs: Default::default(),
            pocs: Default::default(),
            max_long_term_frame_idx: Default::default(),
            max_dec_frame_buffering: DEFAULT_MAX_DEC_FRAME_BUFFERING,
            max_num_reorder_frames: DEFAULT_MAX_DEC_FRAME_BUFFERING,
            is_displayable: true,
            local_frame_time: 0,
            cur_frame: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.view_id != INVALID_VIEW_ID
    }

    /// Resets every layer. Frames stay allocated but become free.
    pub fn reset(&mut self, pool: &mut FramePool) {
        for dpb in self.dpbs.iter_mut().flatten() {
            dpb.reset(pool);
        }

        for poc in self.pocs.iter_mut().flatten() {
            poc.reset(0);
        }

        self.max_long_term_frame_idx = Default::default();
        self.local_frame_time = 0;
        self.cur_frame = None;
    }

    /// Releases the slot so that another view can take it.
    pub fn close(&mut self) {
        *self = Self::new(INVALID_VIEW_ID);
    }

    /// Sizes the DPB of every layer after the stream's requirements. `level_override` replaces
    /// the SPS level when the stream carries no bitstream restriction.
    pub fn set_dpb_size(&mut self, sps: &Sps, level_override: Option<Level>) {
        let dpb_size = match (level_override, sps.bitstream_restriction()) {
            (Some(level), None) => sps.level_dpb_frames(level),
            _ => sps.max_dpb_frames(),
        };

        self.max_dec_frame_buffering = dpb_size;
        self.max_num_reorder_frames = (sps.max_num_reorder_frames() as usize).min(dpb_size);

        debug!(
            "View {}: DPB size {}, reorder frames {}",
            self.view_id, dpb_size, self.max_num_reorder_frames
        );

        for dpb in self.dpbs.iter_mut().flatten() {
            dpb.set_dpb_size(dpb_size);
        }
    }

    pub fn dpb(&self, layer: usize) -> Option<&DpbList> {
        self.dpbs.get(layer)?.as_ref()
    }

    /// The DPB of `layer`, created if needed.
    pub fn dpb_mut(&mut self, layer: usize) -> &mut DpbList {
        let size = self.max_dec_frame_buffering;
        self.dpbs[layer].get_or_insert_with(|| {
            let mut dpb = DpbList::new();
            dpb.set_dpb_size(size);
            dpb
        })
    }

    /// Existing DPBs along with their layer.
    pub fn dpbs(&self) -> impl Iterator<Item = (usize, &DpbList)> {
        self.dpbs
            .iter()
            .enumerate()
            .filter_map(|(layer, dpb)| dpb.as_ref().map(|dpb| (layer, dpb)))
    }

    /// The layer frames are output from: the highest one decoded so far.
    pub fn output_layer(&self) -> Option<usize> {
        self.dpbs().map(|(layer, _)| layer).last()
    }

    pub fn poc(&self, layer: usize) -> Option<&PocDecoder> {
        self.pocs.get(layer)?.as_ref()
    }

    pub fn poc_mut(&mut self, layer: usize) -> &mut PocDecoder {
        self.pocs[layer].get_or_insert_with(PocDecoder::new)
    }

    pub fn max_long_term_frame_idx(&self, layer: usize) -> MaxLongTermFrameIdx {
        self.max_long_term_frame_idx[layer]
    }

    /// Borrows the state the marking process of `layer` works on.
    pub fn marking_target<'a>(
        &'a mut self,
        pool: &'a mut FramePool,
        layer: usize,
    ) -> MarkingTarget<'a> {
        let size = self.max_dec_frame_buffering;
        let dpb = self.dpbs[layer].get_or_insert_with(|| {
            let mut dpb = DpbList::new();
            dpb.set_dpb_size(size);
            dpb
        });

        MarkingTarget {
            pool,
            dpb,
            poc: self.pocs[layer].get_or_insert_with(PocDecoder::new),
            max_long_term_frame_idx: &mut self.max_long_term_frame_idx[layer],
        }
    }
}

/// The views of a session, in allocation order. The base view is number 0.
#[derive(Debug)]
pub struct ViewList {
    views: Vec<ViewItem>,
    /// View whose turn it is to output a frame.
    current_view: usize,
    /// Views selected for decoding. Empty selects all of them.
    view_list: Vec<u16>,
    temporal_id: u8,
}

impl Default for ViewList {
    fn default() -> Self {
        Self {
            views: Vec::new(),
            current_view: 0,
            view_list: Vec::new(),
            temporal_id: HIGHEST_TEMPORAL_ID,
        }
    }
}

impl ViewList {
    pub fn new() -> Self {
        Default::default()
    }

    /// Makes room for `view_id`, reusing a released slot if there is one. Allocating an
    /// existing view does nothing.
    pub fn allocate_view(&mut self, view_id: u16) -> DecodeResult<usize> {
        if view_id >= MAX_NUM_VIEW {
            return Err(DecodeError::InvalidStream(anyhow!(
                "view_id {} out of range",
                view_id
            )));
        }

        if let Some(number) = self.view_number(view_id) {
            return Ok(number);
        }

        debug!("Allocating view {}", view_id);

        if let Some(number) = self.views.iter().position(|v| !v.is_valid()) {
            self.views[number] = ViewItem::new(view_id);
            return Ok(number);
        }

        self.views.push(ViewItem::new(view_id));
        Ok(self.views.len() - 1)
    }

    fn view_number(&self, view_id: u16) -> Option<usize> {
        self.views.iter().position(|v| v.view_id == view_id)
    }

    pub fn find_view(&self, view_id: u16) -> Option<&ViewItem> {
        self.views.iter().find(|v| v.view_id == view_id)
    }

    pub fn find_view_mut(&mut self, view_id: u16) -> Option<&mut ViewItem> {
        self.views.iter_mut().find(|v| v.view_id == view_id)
    }

    /// Returns `view_id`, allocating it on first use.
    pub fn get_view(&mut self, view_id: u16) -> DecodeResult<&mut ViewItem> {
        let number = self.allocate_view(view_id)?;
        Ok(&mut self.views[number])
    }

    pub fn get_view_by_number(&self, number: usize) -> Option<&ViewItem> {
        self.views.get(number)
    }

    pub fn get_view_by_number_mut(&mut self, number: usize) -> Option<&mut ViewItem> {
        self.views.get_mut(number)
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ViewItem> {
        self.views.iter().filter(|v| v.is_valid())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ViewItem> {
        self.views.iter_mut().filter(|v| v.is_valid())
    }

    pub fn current_view(&self) -> usize {
        self.current_view
    }

    /// Passes the output turn to the next view. Returns whether it wrapped to the base view.
    pub fn increase_current_view(&mut self) -> bool {
        self.current_view += 1;
        if self.current_view >= self.views.len() {
            self.current_view = 0;
            return true;
        }

        false
    }

    pub fn set_view_list(&mut self, target_views: &[u16]) {
        let mut view_list = target_views.to_vec();
        view_list.sort_unstable();
        view_list.dedup();
        self.view_list = view_list;
    }

    pub fn set_temporal_id(&mut self, temporal_id: u8) {
        self.temporal_id = temporal_id;
    }

    /// Whether a slice belongs to a view or sub-layer that is not decoded.
    pub fn is_should_skip_slice(&self, hdr: &SliceHeader) -> bool {
        if hdr.temporal_id > self.temporal_id || hdr.priority_id > HIGHEST_PRIORITY_ID {
            return true;
        }

        !self.view_list.is_empty() && self.view_list.binary_search(&hdr.view_id).is_err()
    }

    pub fn reset(&mut self, pool: &mut FramePool) {
        for view in self.iter_mut() {
            view.reset(pool);
        }

        self.current_view = 0;
    }

    /// Drops every view. The frames of the pool are left to the caller.
    pub fn clear(&mut self) {
        self.views.clear();
        self.current_view = 0;
    }
}
