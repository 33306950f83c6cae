// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsed H.264 syntax structures consumed by the reference management core.
//!
//! Producing these from a bitstream is the job of an external parser. Only the fields that drive
//! POC derivation, reference marking, DPB sizing and view selection are kept here, together with
//! builders so that tests and tools can synthesize streams without a bitstream.

use std::rc::Rc;

use bytes::Bytes;
use enumn::N;

/// The maximum number of pictures in the DPB, as per A.3.1, clause h)
pub const DPB_MAX_SIZE: usize = 16;

#[derive(N, Debug, PartialEq, Eq, Clone, Copy)]
pub enum NaluType {
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
}

impl Default for NaluType {
    fn default() -> Self {
        Self::Slice
    }
}

/// `MaxLongTermFrameIdx` is derived from `max_long_term_frame_idx_plus1`, an unsigned integer with
/// a special value indicating "no long-term frame indices". This type allows easy conversion
/// between the actual and "plus1" representation, while ensuring that the special value is always
/// handled by the code.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxLongTermFrameIdx {
    #[default]
    NoLongTermFrameIndices,
    Idx(u32),
}

impl MaxLongTermFrameIdx {
    /// Create a value from `max_long_term_frame_idx_plus1`.
    pub fn from_value_plus1(max_long_term_frame_idx_plus1: u32) -> Self {
        match max_long_term_frame_idx_plus1 {
            0 => Self::NoLongTermFrameIndices,
            i @ 1.. => Self::Idx(i - 1),
        }
    }

    /// Convert this value to the representation used by `max_long_term_frame_idx_plus1`.
    pub fn to_value_plus1(self) -> u32 {
        match self {
            Self::NoLongTermFrameIndices => 0,
            Self::Idx(i) => i + 1,
        }
    }
}

impl PartialEq<u32> for MaxLongTermFrameIdx {
    fn eq(&self, other: &u32) -> bool {
        match self {
            MaxLongTermFrameIdx::NoLongTermFrameIndices => false,
            MaxLongTermFrameIdx::Idx(idx) => idx.eq(other),
        }
    }
}

impl PartialOrd<u32> for MaxLongTermFrameIdx {
    fn partial_cmp(&self, other: &u32) -> Option<std::cmp::Ordering> {
        match self {
            MaxLongTermFrameIdx::NoLongTermFrameIndices => Some(std::cmp::Ordering::Less),
            MaxLongTermFrameIdx::Idx(idx) => Some(idx.cmp(other)),
        }
    }
}

/// Memory management control operations, see Table 7-9.
#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MmcoOp {
    End = 0,
    UnmarkShortTerm = 1,
    UnmarkLongTerm = 2,
    ShortTermToLongTerm = 3,
    TrimLongTermIndices = 4,
    UnmarkAll = 5,
    CurrentToLongTerm = 6,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarkingInner {
    /// Specifies a control operation to be applied to affect the reference
    /// picture marking. The values and control operations associated with
    /// `memory_management_control_operation` are specified in Table 7-9.
    pub memory_management_control_operation: u8,

    /// Used (with memory_management_control_operation equal to 3 or 1) to
    /// assign a long-term frame index to a short-term reference picture or to
    /// mark a short-term reference picture as "unused for reference".
    pub difference_of_pic_nums_minus1: u32,

    /// Used (with memory_management_control_operation equal to 2) to mark a
    /// long-term reference picture as "unused for reference".
    pub long_term_pic_num: u32,

    /// Used (with memory_management_control_operation equal to 3 or 6) to
    /// assign a long-term frame index to a picture.
    pub long_term_frame_idx: u32,

    /// Specifies the maximum value of long-term frame index allowed for
    /// long-term reference pictures (until receipt of another value of
    /// `max_long_term_frame_idx_plus1`).
    pub max_long_term_frame_idx: MaxLongTermFrameIdx,
}

impl RefPicMarkingInner {
    /// Returns the typed operation, or `None` for values outside of Table 7-9.
    pub fn op(&self) -> Option<MmcoOp> {
        MmcoOp::n(self.memory_management_control_operation)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarking {
    /// Specifies how the previously-decoded pictures in the decoded picture
    /// buffer are treated after decoding of an IDR picture. See Annex C.
    pub no_output_of_prior_pics_flag: bool,

    /// If unset, specifies that the MaxLongTermFrameIdx variable is set equal
    /// to "no long-term frame indices" and that the IDR picture is marked as
    /// "used for short-term reference". If set, specifies that the
    /// MaxLongTermFrameIdx variable is set equal to 0 and that the current IDR
    /// picture is marked "used for long-term reference" and is assigned
    /// LongTermFrameIdx equal to 0.
    pub long_term_reference_flag: bool,

    /// Selects the reference picture marking mode of the currently decoded
    /// picture as specified in Table 7-8.
    pub adaptive_ref_pic_marking_mode_flag: bool,

    /// An Vec with additional data used in the marking process.
    pub inner: Vec<RefPicMarkingInner>,
}

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
/// See table 7-6 in the specification.
pub enum SliceType {
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    /// Whether this is a P slice. See table 7-6 in the specification.
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P)
    }

    /// Whether this is a B slice. See table 7-6 in the specification.
    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    /// Whether this is an I slice. See table 7-6 in the specification.
    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I)
    }
}

impl Default for SliceType {
    fn default() -> Self {
        Self::P
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    /// Specifies the address of the first macroblock in the slice.
    pub first_mb_in_slice: u32,

    /// Specifies the coding type of the slice according to Table 7-6.
    pub slice_type: SliceType,

    // Specifies the picture parameter set in use
    pub pic_parameter_set_id: u8,

    /// Used as an identifier for pictures and shall be represented by
    /// `log2_max_frame_num_minus4 + 4` bits in the bitstream.
    pub frame_num: u16,

    /// If set, specifies that the slice is a slice of a coded field. If not
    /// set, specifies that the slice is a slice of a coded frame.
    pub field_pic_flag: bool,

    /// If set, specifies that the slice is part of a coded bottom field. If not
    /// set, specifies that the picture is a coded top field.
    pub bottom_field_flag: bool,

    /// Identifies an IDR picture.
    pub idr_pic_id: u16,

    /// Specifies the picture order count modulo `MaxPicOrderCntLsb` for the top
    /// field of a coded frame or for a coded field.
    pub pic_order_cnt_lsb: u16,

    ///  Specifies the picture order count difference between the bottom field
    ///  and the top field of a coded frame.
    pub delta_pic_order_cnt_bottom: i32,

    /// Picture order count differences from the expected picture order count
    /// for the top field (or coded field) and the bottom field, see 8.2.1.2.
    pub delta_pic_order_cnt: [i32; 2],

    /// Decoded reference picture marking parsed using 7.3.3.3
    pub dec_ref_pic_marking: RefPicMarking,

    /// `nal_ref_idc` of the NAL unit carrying this slice.
    pub nal_ref_idc: u8,

    /// Whether the NAL unit carrying this slice is an IDR picture.
    pub idr_pic_flag: bool,

    pub nal_unit_type: NaluType,

    /// MVC `view_id`, 0 for plain AVC streams.
    pub view_id: u16,
    /// MVC/SVC `temporal_id`.
    pub temporal_id: u8,
    /// MVC/SVC `priority_id`.
    pub priority_id: u8,
    /// SVC `dependency_id`, selects the DPB layer of a view.
    pub dependency_id: u8,
    /// SVC `quality_id`.
    pub quality_id: u8,
}

impl SliceHeader {
    /// Whether this slice belongs to a reference picture.
    pub fn is_reference(&self) -> bool {
        self.nal_ref_idc != 0
    }

    /// Whether the adaptive marking process carries at least one command.
    pub fn has_mmco(&self) -> bool {
        self.dec_ref_pic_marking.adaptive_ref_pic_marking_mode_flag
            && !self.dec_ref_pic_marking.inner.is_empty()
    }
}

#[derive(Default)]
pub struct SliceHeaderBuilder(SliceHeader);

impl SliceHeaderBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn slice_type(mut self, type_: SliceType) -> Self {
        self.0.slice_type = type_;
        self
    }

    pub fn first_mb_in_slice(mut self, value: u32) -> Self {
        self.0.first_mb_in_slice = value;
        self
    }

    pub fn frame_num(mut self, value: u16) -> Self {
        self.0.frame_num = value;
        self
    }

    /// Makes this a slice of an IDR picture, which is always a reference.
    pub fn idr(mut self, idr_pic_id: u16) -> Self {
        self.0.idr_pic_flag = true;
        self.0.idr_pic_id = idr_pic_id;
        self.0.nal_unit_type = NaluType::SliceIdr;
        if self.0.nal_ref_idc == 0 {
            self.0.nal_ref_idc = 3;
        }
        self
    }

    pub fn nal_ref_idc(mut self, value: u8) -> Self {
        self.0.nal_ref_idc = value;
        self
    }

    /// Makes this a field slice of the given parity.
    pub fn field(mut self, bottom: bool) -> Self {
        self.0.field_pic_flag = true;
        self.0.bottom_field_flag = bottom;
        self
    }

    pub fn pic_order_cnt_lsb(mut self, value: u16) -> Self {
        self.0.pic_order_cnt_lsb = value;
        self
    }

    pub fn delta_pic_order_cnt_bottom(mut self, value: i32) -> Self {
        self.0.delta_pic_order_cnt_bottom = value;
        self
    }

    pub fn delta_pic_order_cnt(mut self, value: [i32; 2]) -> Self {
        self.0.delta_pic_order_cnt = value;
        self
    }

    pub fn long_term_reference(mut self) -> Self {
        self.0.dec_ref_pic_marking.long_term_reference_flag = true;
        self
    }

    /// Appends a memory management control operation and enables adaptive marking.
    pub fn mmco(mut self, op: RefPicMarkingInner) -> Self {
        self.0.dec_ref_pic_marking.adaptive_ref_pic_marking_mode_flag = true;
        self.0.dec_ref_pic_marking.inner.push(op);
        self
    }

    pub fn view_id(mut self, value: u16) -> Self {
        self.0.view_id = value;
        self
    }

    pub fn temporal_id(mut self, value: u8) -> Self {
        self.0.temporal_id = value;
        self
    }

    pub fn priority_id(mut self, value: u8) -> Self {
        self.0.priority_id = value;
        self
    }

    pub fn dependency_id(mut self, value: u8) -> Self {
        self.0.dependency_id = value;
        self
    }

    pub fn build(self) -> SliceHeader {
        self.0
    }
}

/// A H264 slice as handed over by the parser: its header, the SPS it refers to, and the NAL unit
/// payload that is forwarded to the accelerator.
#[derive(Clone, Debug)]
pub struct Slice {
    /// The slice header.
    pub header: SliceHeader,
    /// The active SPS for this slice.
    pub sps: Rc<Sps>,
    /// The NAL unit backing this slice.
    pub nalu: Bytes,
}

impl Slice {
    pub fn new(header: SliceHeader, sps: Rc<Sps>) -> Self {
        Self {
            header,
            sps,
            nalu: Bytes::new(),
        }
    }
}

#[derive(N, Clone, Copy)]
#[repr(u8)]
pub enum Profile {
    Cavlc444Intra = 44,
    Baseline = 66,
    Main = 77,
    ScalableHigh = 83,
    Extended = 88,
    High = 100,
    High10 = 110,
    MultiviewHigh = 118,
    High422P = 122,
    StereoHigh = 128,
    High444Pred = 244,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    #[default]
    L1 = 10,
    L1B = 9,
    L1_1 = 11,
    L1_2 = 12,
    L1_3 = 13,
    L2_0 = 20,
    L2_1 = 21,
    L2_2 = 22,
    L3 = 30,
    L3_1 = 31,
    L3_2 = 32,
    L4 = 40,
    L4_1 = 41,
    L4_2 = 42,
    L5 = 50,
    L5_1 = 51,
    L5_2 = 52,
    L6 = 60,
    L6_1 = 61,
    L6_2 = 62,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HrdParams {
    /// Specifies the length in bits of the `cpb_removal_delay` syntax element.
    pub cpb_removal_delay_length_minus1: u8,
    /// Specifies the length in bits of the `dpb_output_delay` syntax element.
    pub dpb_output_delay_length_minus1: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VuiParams {
    pub nal_hrd_parameters_present_flag: bool,
    pub nal_hrd_parameters: HrdParams,
    pub vcl_hrd_parameters_present_flag: bool,
    pub vcl_hrd_parameters: HrdParams,
    /// Specifies whether picture timing SEI messages carry `pic_struct`.
    pub pic_struct_present_flag: bool,
    /// Specifies that the coded video sequence bitstream restriction parameters are present.
    pub bitstream_restriction_flag: bool,
    /// Upper bound of frames that precede any frame in decoding order and follow it in output
    /// order.
    pub max_num_reorder_frames: u32,
    /// Required size of the HRD decoded picture buffer in units of frame buffers.
    pub max_dec_frame_buffering: u32,
}

impl VuiParams {
    /// The HRD parameters that define the picture timing syntax, NAL ones first.
    pub fn hrd(&self) -> Option<&HrdParams> {
        if self.nal_hrd_parameters_present_flag {
            Some(&self.nal_hrd_parameters)
        } else if self.vcl_hrd_parameters_present_flag {
            Some(&self.vcl_hrd_parameters)
        } else {
            None
        }
    }
}

/// A H264 Sequence Parameter Set, reduced to the syntax elements that drive reference management.
#[derive(Debug, PartialEq, Eq)]
pub struct Sps {
    /// Identifies the sequence parameter set that is referred to by the picture
    /// parameter set
    pub seq_parameter_set_id: u8,

    /// Profile to which the coded video sequence conforms
    pub profile_idc: u8,

    /// Retains the same meaning as in the specification. See 7.4.2.1.1
    pub constraint_set3_flag: bool,

    /// Level to which the coded video sequence conforms
    pub level_idc: Level,

    /// Specifies the value of the variable MaxFrameNum that is used in
    /// frame_num related derivations as follows: MaxFrameNum = 2 ^
    /// (log2_max_frame_num_minus4 + 4).
    pub log2_max_frame_num_minus4: u8,

    /// Specifies the method to decode picture order count (as specified in
    /// 8.2.1).
    pub pic_order_cnt_type: u8,

    /// Specifies the value of the variable MaxPicOrderCntLsb that is used in
    /// the decoding process for picture order count as specified in 8.2.1.
    pub log2_max_pic_order_cnt_lsb_minus4: u8,

    /// If true, specifies that `delta_pic_order_cnt[0]` and
    /// `delta_pic_order_cnt[1]` are not present in the slice headers of the
    /// sequence and shall be inferred to be equal to 0.
    pub delta_pic_order_always_zero_flag: bool,

    /// Used to calculate the picture order count of a non-reference picture as
    /// specified in 8.2.1.
    pub offset_for_non_ref_pic: i32,

    /// Used to calculate the picture order count of a bottom field as specified
    /// in 8.2.1.
    pub offset_for_top_to_bottom_field: i32,

    /// Used in the decoding process for picture order count as specified in
    /// 8.2.1
    pub num_ref_frames_in_pic_order_cnt_cycle: u8,

    /// An element of a list of `num_ref_frames_in_pic_order_cnt_cycle` values
    /// used in the decoding process for picture order count as specified in
    /// 8.2.1
    pub offset_for_ref_frame: [i32; 255],

    /// Specifies the maximum number of short-term and long-term reference
    /// frames, complementary reference field pairs, and non-paired reference
    /// fields that may be used by the decoding process for inter prediction of
    /// any picture in the coded video sequence.
    pub max_num_ref_frames: u8,

    /// Specifies the allowed values of frame_num as specified in 7.4.3 and the
    /// decoding process in case of an inferred gap between values of frame_num
    /// as specified in 8.2.5.2
    pub gaps_in_frame_num_value_allowed_flag: bool,

    /// Plus 1 specifies the width of each decoded picture in units of
    /// macroblocks.
    pub pic_width_in_mbs_minus1: u16,
    /// Plus 1 specifies the height in slice group map units of a decoded frame
    /// or field.
    pub pic_height_in_map_units_minus1: u16,

    /// If true,  specifies that every coded picture of the coded video sequence
    /// is a coded frame containing only frame macroblocks, else specifies that
    /// coded pictures of the coded video sequence may either be coded fields or
    /// coded frames.
    pub frame_mbs_only_flag: bool,

    // Calculated
    /// Same as ExpectedDeltaPerPicOrderCntCycle, see 7-12 in the specification.
    pub expected_delta_per_pic_order_cnt_cycle: i32,

    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
}

impl Sps {
    /// Returns the coded width of the stream.
    pub const fn width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 as u32 + 1) * 16
    }

    /// Returns the coded height of the stream.
    pub const fn height(&self) -> u32 {
        (self.pic_height_in_map_units_minus1 as u32 + 1)
            * 16
            * (2 - self.frame_mbs_only_flag as u32)
    }

    /// Same as MaxFrameNum. See 7-10 in the specification.
    pub fn max_frame_num(&self) -> u32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    /// Same as MaxPicOrderCntLsb. See 7-11 in the specification.
    pub fn max_pic_order_cnt_lsb(&self) -> u32 {
        1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4)
    }

    /// Returns the VUI parameters if they carry the bitstream restriction syntax.
    pub fn bitstream_restriction(&self) -> Option<&VuiParams> {
        Some(&self.vui_parameters)
            .filter(|vui| self.vui_parameters_present_flag && vui.bitstream_restriction_flag)
    }

    /// DPB size in frames for `level`, following Table A-1. Never smaller than the number of
    /// reference frames.
    pub fn level_dpb_frames(&self, level: Level) -> usize {
        let profile = self.profile_idc;
        let mut level = level;

        // A.3.1 and A.3.2: Level 1b for Baseline, Constrained Baseline and Main
        // profile if level_idc == 11 and constraint_set3_flag == 1
        if matches!(level, Level::L1_1)
            && (profile == Profile::Baseline as u8 || profile == Profile::Main as u8)
            && self.constraint_set3_flag
        {
            level = Level::L1B;
        };

        // Table A.1
        let max_dpb_mbs = match level {
            Level::L1 => 396,
            Level::L1B => 396,
            Level::L1_1 => 900,
            Level::L1_2 => 2376,
            Level::L1_3 => 2376,
            Level::L2_0 => 2376,
            Level::L2_1 => 4752,
            Level::L2_2 => 8100,
            Level::L3 => 8100,
            Level::L3_1 => 18000,
            Level::L3_2 => 20480,
            Level::L4 => 32768,
            Level::L4_1 => 32768,
            Level::L4_2 => 34816,
            Level::L5 => 110400,
            Level::L5_1 => 184320,
            Level::L5_2 => 184320,
            Level::L6 => 696320,
            Level::L6_1 => 696320,
            Level::L6_2 => 696320,
        };

        let width_mb = self.width() / 16;
        let height_mb = self.height() / 16;

        let max_dpb_frames =
            std::cmp::min(max_dpb_mbs / (width_mb * height_mb), DPB_MAX_SIZE as u32) as usize;

        std::cmp::max(max_dpb_frames, self.max_num_ref_frames as usize)
    }

    /// Returns the DPB size the stream requires, in frames.
    pub fn max_dpb_frames(&self) -> usize {
        match self.bitstream_restriction() {
            Some(vui) => std::cmp::max(1, vui.max_dec_frame_buffering as usize),
            None => self.level_dpb_frames(self.level_idc),
        }
    }

    /// Returns `max_num_reorder_frames`, inferred as in E.2.1 when the VUI does not carry it.
    pub fn max_num_reorder_frames(&self) -> u32 {
        if let Some(vui) = self.bitstream_restriction() {
            return vui.max_num_reorder_frames;
        }

        let profile = self.profile_idc;
        if (profile == Profile::Cavlc444Intra as u8
            || profile == Profile::ScalableHigh as u8
            || profile == Profile::High as u8
            || profile == Profile::High10 as u8
            || profile == Profile::High422P as u8
            || profile == Profile::High444Pred as u8)
            && self.constraint_set3_flag
        {
            0
        } else {
            self.max_dpb_frames() as u32
        }
    }
}

impl Default for Sps {
    fn default() -> Self {
        Self {
            offset_for_ref_frame: [0; 255],
            seq_parameter_set_id: Default::default(),
            profile_idc: Profile::High as u8,
            constraint_set3_flag: Default::default(),
            level_idc: Level::L4_1,
            log2_max_frame_num_minus4: Default::default(),
            pic_order_cnt_type: Default::default(),
            log2_max_pic_order_cnt_lsb_minus4: Default::default(),
            delta_pic_order_always_zero_flag: Default::default(),
            offset_for_non_ref_pic: Default::default(),
            offset_for_top_to_bottom_field: Default::default(),
            num_ref_frames_in_pic_order_cnt_cycle: Default::default(),
            max_num_ref_frames: 1,
            gaps_in_frame_num_value_allowed_flag: Default::default(),
            pic_width_in_mbs_minus1: 19,
            pic_height_in_map_units_minus1: 14,
            frame_mbs_only_flag: true,
            expected_delta_per_pic_order_cnt_cycle: Default::default(),
            vui_parameters_present_flag: Default::default(),
            vui_parameters: Default::default(),
        }
    }
}

#[derive(Default)]
pub struct SpsBuilder(Sps);

impl SpsBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn seq_parameter_set_id(mut self, value: u8) -> Self {
        self.0.seq_parameter_set_id = value;
        self
    }

    pub fn profile_idc(mut self, value: Profile) -> Self {
        self.0.profile_idc = value as u8;
        self
    }

    pub fn constraint_set3_flag(mut self, value: bool) -> Self {
        self.0.constraint_set3_flag = value;
        self
    }

    pub fn level_idc(mut self, value: Level) -> Self {
        self.0.level_idc = value;
        self
    }

    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        const MB_SIZE: u32 = 16;

        let mb_width = (width + MB_SIZE - 1) / MB_SIZE;
        let mb_height = (height + MB_SIZE - 1) / MB_SIZE;
        self.0.pic_width_in_mbs_minus1 = (mb_width - 1) as u16;
        self.0.pic_height_in_map_units_minus1 =
            (mb_height / (2 - self.0.frame_mbs_only_flag as u32)).saturating_sub(1) as u16;
        self
    }

    pub fn max_num_ref_frames(mut self, value: u8) -> Self {
        self.0.max_num_ref_frames = value;
        self
    }

    pub fn frame_mbs_only_flag(mut self, value: bool) -> Self {
        self.0.frame_mbs_only_flag = value;
        self
    }

    pub fn gaps_in_frame_num_value_allowed_flag(mut self, value: bool) -> Self {
        self.0.gaps_in_frame_num_value_allowed_flag = value;
        self
    }

    pub fn log2_max_frame_num_minus4(mut self, value: u8) -> Self {
        self.0.log2_max_frame_num_minus4 = value;
        self
    }

    pub fn max_frame_num(self, value: u32) -> Self {
        self.log2_max_frame_num_minus4(value.ilog2() as u8 - 4u8)
    }

    pub fn pic_order_cnt_type(mut self, value: u8) -> Self {
        self.0.pic_order_cnt_type = value;
        self
    }

    pub fn log2_max_pic_order_cnt_lsb_minus4(mut self, value: u8) -> Self {
        self.0.log2_max_pic_order_cnt_lsb_minus4 = value;
        self
    }

    pub fn max_pic_order_cnt_lsb(self, value: u32) -> Self {
        self.log2_max_pic_order_cnt_lsb_minus4(value.ilog2() as u8 - 4u8)
    }

    pub fn delta_pic_order_always_zero_flag(mut self, value: bool) -> Self {
        self.0.delta_pic_order_always_zero_flag = value;
        self
    }

    pub fn offset_for_non_ref_pic(mut self, value: i32) -> Self {
        self.0.offset_for_non_ref_pic = value;
        self
    }

    pub fn offset_for_top_to_bottom_field(mut self, value: i32) -> Self {
        self.0.offset_for_top_to_bottom_field = value;
        self
    }

    /// Sets the POC type 1 cycle, also deriving ExpectedDeltaPerPicOrderCntCycle.
    pub fn offset_for_ref_frame(mut self, offsets: &[i32]) -> Self {
        let count = std::cmp::min(offsets.len(), self.0.offset_for_ref_frame.len());
        self.0.num_ref_frames_in_pic_order_cnt_cycle = count as u8;
        self.0.offset_for_ref_frame[..count].copy_from_slice(&offsets[..count]);
        self.0.expected_delta_per_pic_order_cnt_cycle = offsets[..count].iter().sum();
        self
    }

    /// Enables the VUI bitstream restriction syntax with the given buffering values.
    pub fn bitstream_restriction(mut self, max_dec_frame_buffering: u32, reorder: u32) -> Self {
        self.0.vui_parameters_present_flag = true;
        self.0.vui_parameters.bitstream_restriction_flag = true;
        self.0.vui_parameters.max_dec_frame_buffering = max_dec_frame_buffering;
        self.0.vui_parameters.max_num_reorder_frames = reorder;
        self
    }

    /// Enables NAL HRD parameters with the given `cpb_removal_delay` and `dpb_output_delay`
    /// lengths in bits.
    pub fn nal_hrd(mut self, cpb_removal_delay_length: u8, dpb_output_delay_length: u8) -> Self {
        self.0.vui_parameters_present_flag = true;
        self.0.vui_parameters.nal_hrd_parameters_present_flag = true;
        self.0.vui_parameters.nal_hrd_parameters.cpb_removal_delay_length_minus1 =
            cpb_removal_delay_length - 1;
        self.0.vui_parameters.nal_hrd_parameters.dpb_output_delay_length_minus1 =
            dpb_output_delay_length - 1;
        self
    }

    pub fn build(self) -> Rc<Sps> {
        Rc::new(self.0)
    }
}
