// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame records tracked by the reference management core.
//!
//! Frames live in a [`FramePool`] arena and are addressed by [`FrameId`], which stays valid for
//! the lifetime of the pool. A slot is recycled only once its frame is disposable: it has been
//! output (or was never completed), it is not a reference, and nothing holds a [`FramePin`] on
//! it.

use std::ops::Index;
use std::ops::IndexMut;
use std::rc::Rc;

use bitflags::bitflags;
use enumn::N;

use crate::codec::h264::parser::Slice;
use crate::codec::h264::sei::DecRefPicMarkingRepetition;

bitflags! {
    /// Error classification attached to a frame and reported with it on output.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ErrorFlags: u32 {
        const MINOR = 0x1;
        const MAJOR = 0x2;
        const REFERENCE_FRAME = 0x4;
        const DPB = 0x8;
        const RECOVERY = 0x10;
        const TOP_FIELD_ABSENT = 0x20;
        const BOTTOM_FIELD_ABSENT = 0x40;
        const SHORT_TERM_STUCK = 0x100;
    }
}

/// Stable index of a frame inside a [`FramePool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(usize);

impl FrameId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The structure of the picture currently being decoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PictureStructure {
    TopField = 0,
    BottomField = 1,
    #[default]
    Frame = 2,
}

impl PictureStructure {
    pub fn from_header(field_pic_flag: bool, bottom_field_flag: bool) -> Self {
        match (field_pic_flag, bottom_field_flag) {
            (false, _) => Self::Frame,
            (true, false) => Self::TopField,
            (true, true) => Self::BottomField,
        }
    }

    pub fn is_frame(self) -> bool {
        matches!(self, Self::Frame)
    }
}

/// Whether a frame is referenced, or decoded, as a whole frame or as separate fields.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CodingStructure {
    Field,
    #[default]
    Frame,
}

/// Lifecycle of an access unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum FillnessStatus {
    #[default]
    None,
    NotFilled,
    Filled,
    Started,
    Completed,
}

/// Display structure of a picture, Table D-1 values plus `Unknown`.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum DisplayPictureStruct {
    Frame = 0,
    Top = 1,
    Bottom = 2,
    TopBottom = 3,
    BottomTop = 4,
    TopBottomTop = 5,
    BottomTopBottom = 6,
    FrameDoubling = 7,
    FrameTripling = 8,
    #[default]
    Unknown = 100,
}

/// The slices of one field, or of a whole frame.
#[derive(Clone, Debug)]
pub struct AccessUnit {
    slices: Vec<Slice>,
    status: FillnessStatus,
    is_reference: bool,
    is_intra: bool,
    is_field: bool,
    is_idr: bool,
    has_b_slices: bool,
    is_bottom: bool,
    skip_deblocking: bool,
    /// Marking the first slice was decoded with, compared against repetition SEIs.
    marking: Option<DecRefPicMarkingRepetition>,
}

impl Default for AccessUnit {
    fn default() -> Self {
        Self {
            slices: Vec::new(),
            status: FillnessStatus::None,
            is_reference: false,
            is_intra: true,
            is_field: false,
            is_idr: false,
            has_b_slices: false,
            is_bottom: false,
            skip_deblocking: false,
            marking: None,
        }
    }
}

impl AccessUnit {
    pub fn add_slice(&mut self, slice: Slice) {
        let hdr = &slice.header;

        if self.slices.is_empty() {
            self.marking = Some(DecRefPicMarkingRepetition {
                original_idr_flag: hdr.idr_pic_flag,
                original_frame_num: u32::from(hdr.frame_num),
                original_field_pic_flag: hdr.field_pic_flag,
                original_bottom_field_flag: hdr.bottom_field_flag,
                dec_ref_pic_marking: hdr.dec_ref_pic_marking.clone(),
            });
        }

        self.is_reference |= hdr.is_reference();
        self.is_bottom = hdr.bottom_field_flag;
        self.is_intra &= hdr.slice_type.is_i();
        self.is_field = hdr.field_pic_flag;
        self.is_idr = hdr.idr_pic_flag;
        self.has_b_slices |= hdr.slice_type.is_b();

        self.slices.push(slice);
    }

    pub fn reset(&mut self) {
        *self = Default::default();
    }

    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    pub fn first_slice(&self) -> Option<&Slice> {
        self.slices.first()
    }

    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    pub fn status(&self) -> FillnessStatus {
        self.status
    }

    /// Asks the accelerator to leave this field unfiltered.
    pub fn skip_deblocking(&mut self) {
        self.skip_deblocking = true;
    }

    pub fn is_deblocking_skipped(&self) -> bool {
        self.skip_deblocking
    }

    pub fn set_status(&mut self, status: FillnessStatus) {
        self.status = status;
    }

    pub fn is_reference(&self) -> bool {
        self.is_reference
    }

    pub fn is_intra(&self) -> bool {
        self.is_intra
    }

    pub fn is_field(&self) -> bool {
        self.is_field
    }

    pub fn is_idr(&self) -> bool {
        self.is_idr
    }

    pub fn has_b_slices(&self) -> bool {
        self.has_b_slices
    }

    pub fn is_bottom(&self) -> bool {
        self.is_bottom
    }

    pub fn marking(&self) -> Option<&DecRefPicMarkingRepetition> {
        self.marking.as_ref()
    }
}

/// A decoded frame or complementary field pair.
///
/// Per-field arrays are indexed by field number in decoding order, not by parity: index 0 is the
/// first field decoded. `bottom_field_flag` maps one to the other.
#[derive(Debug)]
pub struct Frame {
    pub uid: Option<u64>,
    pub view_id: u16,
    /// Layer (dependency_id) whose DPB owns the frame.
    pub layer: usize,

    pub frame_num: i32,
    pub frame_num_wrap: i32,
    pub long_term_frame_idx: Option<u32>,
    pic_num: [i32; 2],
    long_term_pic_num: [i32; 2],
    poc: [i32; 2],
    pub bottom_field_flag: [bool; 2],

    short_term: [bool; 2],
    long_term: [bool; 2],
    pub structure_for_ref: CodingStructure,
    pub structure_for_dec: CodingStructure,
    ref_pic_list_reset_count: [u32; 2],

    pub idr_flag: bool,
    /// Intra picture that may clear stuck references.
    pub i_flag: bool,
    pub error_flags: ErrorFlags,
    pub aus: [AccessUnit; 2],

    pub dpb_output_delay: Option<u32>,
    pub display_struct: DisplayPictureStruct,

    pub full: bool,
    pub skipped: bool,
    pub decoded: bool,
    pub decoding_started: bool,
    pub decoding_completed: bool,
    pub outputted: bool,
    pub displayed: bool,
    pub exists: bool,

    pin: Rc<()>,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            uid: None,
            view_id: 0,
            layer: 0,
            frame_num: -1,
            frame_num_wrap: -1,
            long_term_frame_idx: None,
            pic_num: [-1; 2],
            long_term_pic_num: [-1; 2],
            poc: [0; 2],
            bottom_field_flag: [false, true],
            short_term: [false; 2],
            long_term: [false; 2],
            structure_for_ref: CodingStructure::Frame,
            structure_for_dec: CodingStructure::Frame,
            ref_pic_list_reset_count: [0; 2],
            idr_flag: false,
            i_flag: false,
            error_flags: ErrorFlags::empty(),
            aus: Default::default(),
            dpb_output_delay: None,
            display_struct: DisplayPictureStruct::Unknown,
            full: false,
            skipped: false,
            decoded: false,
            decoding_started: false,
            decoding_completed: false,
            outputted: false,
            displayed: false,
            exists: true,
            pin: Rc::new(()),
        }
    }
}

impl Frame {
    /// Returns the frame to its freshly allocated state. Outstanding pins stay valid.
    pub fn reset(&mut self) {
        let pin = Rc::clone(&self.pin);
        *self = Self {
            pin,
            ..Default::default()
        };
    }

    /// Prepares a recycled frame for a new picture.
    pub fn init(&mut self, view_id: u16, layer: usize, structure: PictureStructure) {
        self.reset();
        self.view_id = view_id;
        self.layer = layer;

        match structure {
            PictureStructure::Frame => {
                self.bottom_field_flag = [false, true];
                self.structure_for_ref = CodingStructure::Frame;
                self.structure_for_dec = CodingStructure::Frame;
            }
            field => {
                let bottom = field == PictureStructure::BottomField;
                self.bottom_field_flag = [bottom, !bottom];
                self.structure_for_ref = CodingStructure::Field;
                self.structure_for_dec = CodingStructure::Field;
            }
        }
    }

    fn ref_is_frame(&self) -> bool {
        self.structure_for_ref == CodingStructure::Frame
    }

    /// Whether `field` is a short-term reference. When referenced as a frame both fields must be.
    pub fn is_short_term_field(&self, field: usize) -> bool {
        if self.ref_is_frame() {
            self.short_term[0] && self.short_term[1]
        } else {
            self.short_term[field]
        }
    }

    pub fn is_long_term_field(&self, field: usize) -> bool {
        if self.ref_is_frame() {
            self.long_term[0] && self.long_term[1]
        } else {
            self.long_term[field]
        }
    }

    /// Short-term marking of both fields as a mask: bit 0 for the first field, bit 1 for the
    /// second. 3 means the whole frame.
    pub fn short_term_mask(&self) -> u8 {
        u8::from(self.short_term[0]) | (u8::from(self.short_term[1]) << 1)
    }

    pub fn long_term_mask(&self) -> u8 {
        u8::from(self.long_term[0]) | (u8::from(self.long_term[1]) << 1)
    }

    pub fn is_short_term_ref(&self) -> bool {
        self.short_term_mask() != 0
    }

    pub fn is_long_term_ref(&self) -> bool {
        self.long_term_mask() != 0
    }

    pub fn is_reference(&self) -> bool {
        self.is_short_term_ref() || self.is_long_term_ref()
    }

    /// Marks or unmarks `field` as short-term. Frames referenced as a whole change both fields.
    pub fn set_short_term_ref(&mut self, is_ref: bool, field: usize) {
        if self.ref_is_frame() {
            self.short_term = [is_ref; 2];
        } else {
            self.short_term[field] = is_ref;
        }
    }

    pub fn set_long_term_ref(&mut self, is_ref: bool, field: usize) {
        if self.ref_is_frame() {
            self.long_term = [is_ref; 2];
        } else {
            self.long_term[field] = is_ref;
        }
    }

    /// PicNum of `field`, or the smaller of both when referenced as a frame.
    pub fn pic_num(&self, field: usize) -> i32 {
        if self.ref_is_frame() {
            self.min_pic_num()
        } else {
            self.pic_num[field]
        }
    }

    pub fn min_pic_num(&self) -> i32 {
        self.pic_num[0].min(self.pic_num[1])
    }

    pub fn set_pic_num(&mut self, pic_num: i32, field: usize) {
        if self.ref_is_frame() {
            self.pic_num = [pic_num; 2];
        } else {
            self.pic_num[field] = pic_num;
        }
    }

    pub fn long_term_pic_num(&self, field: usize) -> i32 {
        if self.ref_is_frame() {
            self.long_term_pic_num[0].min(self.long_term_pic_num[1])
        } else {
            self.long_term_pic_num[field]
        }
    }

    /// POC of `field`, or of the earliest field when referenced as a frame.
    pub fn poc(&self, field: usize) -> i32 {
        if self.ref_is_frame() {
            self.min_poc()
        } else {
            self.poc[field]
        }
    }

    pub fn min_poc(&self) -> i32 {
        self.poc[0].min(self.poc[1])
    }

    /// POC of `field` regardless of how the frame is referenced.
    pub fn field_poc(&self, field: usize) -> i32 {
        self.poc[field]
    }

    pub fn set_poc(&mut self, poc: i32, field: usize) {
        self.poc[field] = poc;
    }

    pub fn pocs_mut(&mut self) -> &mut [i32; 2] {
        &mut self.poc
    }

    /// Recomputes FrameNumWrap and PicNum against the picture being decoded, see 8.2.4.1.
    pub fn update_frame_num_wrap(
        &mut self,
        cur_frame_num: i32,
        max_frame_num: i32,
        cur_structure: PictureStructure,
    ) {
        if !self.is_short_term_ref() {
            return;
        }

        self.frame_num_wrap = self.frame_num;
        if self.frame_num > cur_frame_num {
            self.frame_num_wrap -= max_frame_num;
        }

        if cur_structure.is_frame() {
            self.structure_for_ref = CodingStructure::Frame;
            self.pic_num = [self.frame_num_wrap; 2];
            return;
        }

        self.structure_for_ref = CodingStructure::Field;
        let parities = self.field_parities();
        for field in 0..2 {
            if self.short_term[field] {
                self.pic_num[field] =
                    2 * self.frame_num_wrap + i32::from(parities[field] == cur_structure);
            }
        }
    }

    /// Recomputes LongTermPicNum from the long-term frame index, see 8.2.4.1.
    pub fn update_long_term_pic_num(&mut self, cur_structure: PictureStructure) {
        if !self.is_long_term_ref() {
            return;
        }

        let idx = self.long_term_frame_idx.map_or(-1, |i| i as i32);

        if cur_structure.is_frame() {
            self.structure_for_ref = CodingStructure::Frame;
            self.long_term_pic_num = [idx; 2];
            return;
        }

        self.structure_for_ref = CodingStructure::Field;
        let parities = self.field_parities();
        for field in 0..2 {
            self.long_term_pic_num[field] = 2 * idx + i32::from(parities[field] == cur_structure);
        }
    }

    /// Parity of each field, in decoding order.
    fn field_parities(&self) -> [PictureStructure; 2] {
        if self.bottom_field_flag[0] {
            [PictureStructure::BottomField, PictureStructure::TopField]
        } else {
            [PictureStructure::TopField, PictureStructure::BottomField]
        }
    }

    /// Index of the field with the given parity.
    pub fn field_index_by_parity(&self, bottom: bool) -> usize {
        usize::from(self.bottom_field_flag[1] == bottom)
    }

    pub fn increase_ref_pic_list_reset_count(&mut self) {
        self.ref_pic_list_reset_count[0] += 1;
        self.ref_pic_list_reset_count[1] += 1;
    }

    pub fn init_ref_pic_list_reset_count(&mut self, field: usize) {
        if self.ref_is_frame() {
            self.ref_pic_list_reset_count = [0; 2];
        } else {
            self.ref_pic_list_reset_count[field] = 0;
        }
    }

    pub fn ref_pic_list_reset_count(&self, field: usize) -> u32 {
        if self.ref_is_frame() {
            self.ref_pic_list_reset_count[0].max(self.ref_pic_list_reset_count[1])
        } else {
            self.ref_pic_list_reset_count[field]
        }
    }

    /// Whether a [`FramePin`] is currently alive for this frame.
    pub fn is_pinned(&self) -> bool {
        Rc::strong_count(&self.pin) > 1
    }

    /// Whether anything still needs the frame: a reference marking or a pin.
    pub fn is_in_use(&self) -> bool {
        self.is_reference() || self.is_pinned()
    }

    /// The frame can be recycled right away.
    pub fn is_disposable(&self) -> bool {
        (!self.full || (self.outputted && self.displayed)) && !self.is_in_use()
    }

    /// The frame becomes disposable once the display consumer releases it.
    pub fn is_almost_disposable(&self) -> bool {
        (self.outputted || !self.full) && !self.is_in_use()
    }

    /// Turns the frame into a placeholder for a missing frame_num, never shown.
    pub fn set_frame_as_non_exist(&mut self) {
        self.exists = false;
        self.full = true;
        self.skipped = true;
        self.decoded = true;
        self.outputted = true;
        self.displayed = true;
    }

    pub fn on_decoding_completed(&mut self) {
        self.decoded = true;
        self.decoding_completed = true;
    }

    /// Whether every access unit that carries slices has reached `status`.
    pub fn aus_reached(&self, status: FillnessStatus) -> bool {
        self.aus
            .iter()
            .filter(|au| au.status() != FillnessStatus::None)
            .all(|au| au.status() >= status)
    }

    /// Number of fields (or one frame) that received slices.
    pub fn au_count(&self) -> usize {
        self.aus
            .iter()
            .filter(|au| au.status() != FillnessStatus::None)
            .count()
    }
}

/// Keeps a frame alive in the pool while held.
#[derive(Debug)]
pub struct FramePin {
    id: FrameId,
    _token: Rc<()>,
}

impl FramePin {
    pub fn id(&self) -> FrameId {
        self.id
    }
}

/// Arena of all frames of a session. Slots are never removed, only recycled.
#[derive(Debug, Default)]
pub struct FramePool {
    frames: Vec<Frame>,
}

impl FramePool {
    pub fn new() -> Self {
        Default::default()
    }

    /// Appends a fresh frame and returns its id.
    pub fn alloc(&mut self) -> FrameId {
        self.frames.push(Frame::default());
        FrameId(self.frames.len() - 1)
    }

    pub fn get(&self, id: FrameId) -> Option<&Frame> {
        self.frames.get(id.0)
    }

    pub fn get_mut(&mut self, id: FrameId) -> Option<&mut Frame> {
        self.frames.get_mut(id.0)
    }

    pub fn pin(&self, id: FrameId) -> FramePin {
        FramePin {
            id,
            _token: Rc::clone(&self.frames[id.0].pin),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = FrameId> {
        (0..self.frames.len()).map(FrameId)
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

impl Index<FrameId> for FramePool {
    type Output = Frame;

    fn index(&self, id: FrameId) -> &Frame {
        &self.frames[id.0]
    }
}

impl IndexMut<FrameId> for FramePool {
    fn index_mut(&mut self, id: FrameId) -> &mut Frame {
        &mut self.frames[id.0]
    }
}
