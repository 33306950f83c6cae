// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Picture order count derivation, see 8.2.1.
//!
//! One [`PocDecoder`] is kept per view and layer. It is fed once per picture with the first slice
//! header of that picture and keeps the state the next picture needs.

use log::trace;

use crate::codec::h264::parser::SliceHeader;
use crate::codec::h264::parser::Sps;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PocDecoder {
    /// POC of the last decoded picture, or of its single field.
    pic_order_cnt: i32,
    /// `prevPicOrderCntMsb` for type 0.
    pic_order_cnt_msb: i32,
    /// `prevPicOrderCntLsb` for type 0.
    pic_order_cnt_lsb: i32,
    /// `prevFrameNum`, the frame_num of the previous picture.
    frame_num: i32,
    /// frame_num of the previous reference picture, drives gap detection.
    prev_frame_ref_num: i32,
    /// `prevFrameNumOffset` for types 1 and 2.
    frame_num_offset: i32,
    top_field_poc: i32,
    bottom_field_poc: i32,
}

impl PocDecoder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Resets the state after an IDR picture or a memory_management_control_operation 5.
    pub fn reset(&mut self, idr_frame_num: i32) {
        *self = Self {
            frame_num: idr_frame_num,
            prev_frame_ref_num: idr_frame_num,
            ..Default::default()
        };
    }

    pub fn pic_order_cnt(&self) -> i32 {
        self.pic_order_cnt
    }

    pub fn top_field_poc(&self) -> i32 {
        self.top_field_poc
    }

    pub fn bottom_field_poc(&self) -> i32 {
        self.bottom_field_poc
    }

    pub fn prev_frame_ref_num(&self) -> i32 {
        self.prev_frame_ref_num
    }

    /// Derives the POC of the picture `hdr` belongs to. `frame_num` is passed separately because
    /// it is rewritten to 0 after a memory_management_control_operation 5.
    pub fn decode(&mut self, hdr: &SliceHeader, sps: &Sps, frame_num: i32) {
        let max_frame_num = sps.max_frame_num() as i32;

        match sps.pic_order_cnt_type {
            0 => self.decode_type0(hdr, sps),
            1 => self.decode_type1(hdr, sps, frame_num, max_frame_num),
            2 => {
                if frame_num < self.frame_num {
                    self.frame_num_offset += max_frame_num;
                }

                let abs_frame_num = frame_num + self.frame_num_offset;
                self.pic_order_cnt = abs_frame_num * 2;
                if !hdr.is_reference() {
                    self.pic_order_cnt -= 1;
                }
                self.top_field_poc = self.pic_order_cnt;
                self.bottom_field_poc = self.pic_order_cnt;
            }
            // Rejected when validating the SPS.
            _ => (),
        }

        if hdr.is_reference() {
            self.prev_frame_ref_num = frame_num;
        }

        self.frame_num = frame_num;

        trace!(
            "POC type {}: frame_num {} poc {} top {} bottom {}",
            sps.pic_order_cnt_type,
            frame_num,
            self.pic_order_cnt,
            self.top_field_poc,
            self.bottom_field_poc
        );
    }

    fn decode_type0(&mut self, hdr: &SliceHeader, sps: &Sps) {
        let max_pic_order_cnt_lsb = sps.max_pic_order_cnt_lsb() as i32;
        let lsb = i32::from(hdr.pic_order_cnt_lsb);

        // 8-3
        let msb = if lsb < self.pic_order_cnt_lsb
            && (self.pic_order_cnt_lsb - lsb) >= max_pic_order_cnt_lsb / 2
        {
            self.pic_order_cnt_msb + max_pic_order_cnt_lsb
        } else if lsb > self.pic_order_cnt_lsb
            && (lsb - self.pic_order_cnt_lsb) > max_pic_order_cnt_lsb / 2
        {
            self.pic_order_cnt_msb - max_pic_order_cnt_lsb
        } else {
            self.pic_order_cnt_msb
        };

        if hdr.is_reference() {
            self.pic_order_cnt_msb = msb & !(max_pic_order_cnt_lsb - 1);
            self.pic_order_cnt_lsb = lsb;
        }

        self.pic_order_cnt = msb + lsb;
        if !hdr.field_pic_flag {
            self.top_field_poc = self.pic_order_cnt;
            self.bottom_field_poc = self.top_field_poc + hdr.delta_pic_order_cnt_bottom;
        }
    }

    fn decode_type1(&mut self, hdr: &SliceHeader, sps: &Sps, frame_num: i32, max_frame_num: i32) {
        let cycle_len = i32::from(sps.num_ref_frames_in_pic_order_cnt_cycle);
        let offsets = &sps.offset_for_ref_frame[..cycle_len as usize];

        if frame_num < self.frame_num {
            self.frame_num_offset += max_frame_num;
        }

        let mut abs_frame_num = if cycle_len != 0 {
            self.frame_num_offset + frame_num
        } else {
            0
        };

        if !hdr.is_reference() && abs_frame_num > 0 {
            abs_frame_num -= 1;
        }

        // 8-9
        let mut expected_poc = if abs_frame_num > 0 {
            let cycle_cnt = (abs_frame_num - 1) / cycle_len;
            let frame_num_in_cycle = ((abs_frame_num - 1) % cycle_len) as usize;
            let delta_per_cycle: i32 = offsets.iter().sum();

            cycle_cnt * delta_per_cycle + offsets[..=frame_num_in_cycle].iter().sum::<i32>()
        } else {
            0
        };

        if !hdr.is_reference() {
            expected_poc += sps.offset_for_non_ref_pic;
        }

        // The deltas are absent from the slice header and inferred to be 0.
        let delta = if sps.delta_pic_order_always_zero_flag {
            [0; 2]
        } else {
            hdr.delta_pic_order_cnt
        };

        self.pic_order_cnt = expected_poc + delta[0];
        if !hdr.field_pic_flag {
            self.top_field_poc = self.pic_order_cnt;
            self.bottom_field_poc =
                self.top_field_poc + sps.offset_for_top_to_bottom_field + delta[1];
        } else if hdr.bottom_field_flag {
            self.pic_order_cnt += sps.offset_for_top_to_bottom_field;
        }
    }

    /// Returns the number of frame_num values missing between the previous reference picture
    /// and `hdr`. Streams that do not allow gaps report none unless `ignore_gaps_allowed_flag`
    /// is set.
    pub fn detect_frame_num_gap(
        &self,
        hdr: &SliceHeader,
        sps: &Sps,
        ignore_gaps_allowed_flag: bool,
    ) -> u32 {
        if !ignore_gaps_allowed_flag && !sps.gaps_in_frame_num_value_allowed_flag {
            return 0;
        }

        if hdr.idr_pic_flag {
            return 0;
        }

        let max_frame_num = sps.max_frame_num() as i32;
        let frame_num = i32::from(hdr.frame_num);
        let prev = self.prev_frame_ref_num;

        if frame_num == prev || frame_num == (prev + 1) % max_frame_num {
            return 0;
        }

        let gap = if frame_num > prev - 1 {
            (frame_num - prev - 1) % max_frame_num
        } else {
            (max_frame_num - (prev + 1 - frame_num)) % max_frame_num
        };

        gap.max(0) as u32
    }

    /// Records `frame_num` for a synthesized frame and returns the POCs to give it.
    pub fn frame_gap(&mut self, field_pic: bool, frame_num: i32) -> [i32; 2] {
        self.prev_frame_ref_num = frame_num;
        self.frame_num = frame_num;

        self.field_pocs(field_pic)
    }

    /// POCs of the last decoded picture as (top, bottom). A field picture uses its single POC for
    /// both.
    pub fn field_pocs(&self, field_pic: bool) -> [i32; 2] {
        if field_pic {
            [self.pic_order_cnt, self.pic_order_cnt]
        } else {
            [self.top_field_poc, self.bottom_field_poc]
        }
    }

    /// Transfers the derived POCs into the POC pair of a frame under construction. The first field
    /// of a pair temporarily gives its POC to both fields.
    pub fn init_frame(&self, pocs: &mut [i32; 2], field_structure: bool, field_index: usize) {
        if field_structure {
            pocs[field_index] = self.pic_order_cnt;
            if field_index == 0 {
                pocs[1] = self.pic_order_cnt;
            }
        } else {
            *pocs = [self.top_field_poc, self.bottom_field_poc];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::parser::SliceHeaderBuilder;
    use crate::codec::h264::parser::SpsBuilder;

    fn ref_slice(frame_num: u16, lsb: u16) -> SliceHeader {
        SliceHeaderBuilder::new()
            .nal_ref_idc(1)
            .frame_num(frame_num)
            .pic_order_cnt_lsb(lsb)
            .build()
    }

    #[test]
    fn type0_monotonic_frames() {
        let sps = SpsBuilder::new().max_pic_order_cnt_lsb(16).build();
        let mut poc = PocDecoder::new();

        for (i, lsb) in [0u16, 2, 4, 6].into_iter().enumerate() {
            let hdr = ref_slice(i as u16, lsb);
            poc.decode(&hdr, &sps, i as i32);
            assert_eq!(poc.top_field_poc(), i32::from(lsb));
            assert_eq!(poc.bottom_field_poc(), i32::from(lsb));
        }
    }

    #[test]
    fn type0_msb_wraps_forward() {
        let sps = SpsBuilder::new().max_pic_order_cnt_lsb(16).build();
        let mut poc = PocDecoder::new();

        poc.decode(&ref_slice(0, 0), &sps, 0);
        poc.decode(&ref_slice(1, 6), &sps, 1);
        poc.decode(&ref_slice(2, 12), &sps, 2);
        assert_eq!(poc.pic_order_cnt(), 12);

        // LSB decreases by 10 >= 8: the MSB grows by 16.
        poc.decode(&ref_slice(3, 2), &sps, 3);
        assert_eq!(poc.pic_order_cnt(), 18);

        // Small steps keep the MSB.
        poc.decode(&ref_slice(4, 6), &sps, 4);
        assert_eq!(poc.pic_order_cnt(), 22);
    }

    #[test]
    fn type0_msb_wraps_backward() {
        let sps = SpsBuilder::new().max_pic_order_cnt_lsb(16).build();
        let mut poc = PocDecoder::new();

        poc.decode(&ref_slice(0, 2), &sps, 0);

        // LSB increases by 12 > 8: the MSB shrinks by 16.
        poc.decode(&ref_slice(1, 14), &sps, 1);
        assert_eq!(poc.pic_order_cnt(), -2);
    }

    #[test]
    fn type0_non_reference_keeps_baseline() {
        let sps = SpsBuilder::new().max_pic_order_cnt_lsb(16).build();
        let mut poc = PocDecoder::new();

        poc.decode(&ref_slice(0, 0), &sps, 0);
        poc.decode(&ref_slice(1, 8), &sps, 1);
        poc.decode(&ref_slice(2, 14), &sps, 2);

        let non_ref = SliceHeaderBuilder::new()
            .frame_num(3)
            .pic_order_cnt_lsb(2)
            .build();
        poc.decode(&non_ref, &sps, 3);
        assert_eq!(poc.pic_order_cnt(), 18);
        assert_eq!(poc.prev_frame_ref_num(), 2);

        // Still measured against the reference picture with LSB 14.
        poc.decode(&ref_slice(3, 4), &sps, 3);
        assert_eq!(poc.pic_order_cnt(), 20);
    }

    #[test]
    fn type0_bottom_delta() {
        let sps = SpsBuilder::new().max_pic_order_cnt_lsb(16).build();
        let mut poc = PocDecoder::new();

        let hdr = SliceHeaderBuilder::new()
            .nal_ref_idc(1)
            .pic_order_cnt_lsb(4)
            .delta_pic_order_cnt_bottom(1)
            .build();
        poc.decode(&hdr, &sps, 0);

        assert_eq!(poc.field_pocs(false), [4, 5]);
    }

    #[test]
    fn type1_cycle() {
        let sps = SpsBuilder::new()
            .pic_order_cnt_type(1)
            .offset_for_ref_frame(&[2])
            .offset_for_non_ref_pic(-1)
            .offset_for_top_to_bottom_field(1)
            .build();
        let mut poc = PocDecoder::new();

        let idr = SliceHeaderBuilder::new().idr(0).build();
        poc.decode(&idr, &sps, 0);
        assert_eq!(poc.field_pocs(false), [0, 1]);

        poc.decode(&ref_slice(1, 0), &sps, 1);
        assert_eq!(poc.field_pocs(false), [2, 3]);

        let non_ref = SliceHeaderBuilder::new().frame_num(2).build();
        poc.decode(&non_ref, &sps, 2);
        assert_eq!(poc.top_field_poc(), 1);
    }

    #[test]
    fn type1_deltas_always_zero() {
        let sps = SpsBuilder::new()
            .pic_order_cnt_type(1)
            .delta_pic_order_always_zero_flag(true)
            .offset_for_ref_frame(&[2])
            .offset_for_top_to_bottom_field(1)
            .build();
        let mut poc = PocDecoder::new();

        let hdr = SliceHeaderBuilder::new()
            .nal_ref_idc(1)
            .frame_num(1)
            .delta_pic_order_cnt([5, -3])
            .build();
        poc.decode(&hdr, &sps, 1);
        assert_eq!(poc.field_pocs(false), [2, 3]);
    }

    #[test]
    fn type1_bottom_field() {
        let sps = SpsBuilder::new()
            .pic_order_cnt_type(1)
            .frame_mbs_only_flag(false)
            .offset_for_ref_frame(&[4])
            .offset_for_top_to_bottom_field(1)
            .build();
        let mut poc = PocDecoder::new();

        let bottom = SliceHeaderBuilder::new()
            .nal_ref_idc(1)
            .frame_num(1)
            .field(true)
            .build();
        poc.decode(&bottom, &sps, 1);
        assert_eq!(poc.pic_order_cnt(), 5);
    }

    #[test]
    fn type2_with_wrap() {
        let sps = SpsBuilder::new().pic_order_cnt_type(2).build();
        let mut poc = PocDecoder::new();

        poc.decode(&SliceHeaderBuilder::new().idr(0).build(), &sps, 0);
        assert_eq!(poc.pic_order_cnt(), 0);

        poc.decode(&ref_slice(1, 0), &sps, 1);
        assert_eq!(poc.pic_order_cnt(), 2);

        let non_ref = SliceHeaderBuilder::new().frame_num(2).build();
        poc.decode(&non_ref, &sps, 2);
        assert_eq!(poc.pic_order_cnt(), 3);

        poc.decode(&ref_slice(15, 0), &sps, 15);
        assert_eq!(poc.pic_order_cnt(), 30);

        poc.decode(&ref_slice(0, 0), &sps, 0);
        assert_eq!(poc.field_pocs(false), [32, 32]);
    }

    #[test]
    fn type2_non_reference_wrap_counted_once() {
        let sps = SpsBuilder::new().pic_order_cnt_type(2).build();
        let mut poc = PocDecoder::new();

        poc.decode(&ref_slice(15, 0), &sps, 15);

        let non_ref = SliceHeaderBuilder::new().frame_num(0).build();
        poc.decode(&non_ref, &sps, 0);
        assert_eq!(poc.pic_order_cnt(), 31);

        poc.decode(&ref_slice(0, 0), &sps, 0);
        assert_eq!(poc.pic_order_cnt(), 32);
    }

    #[test]
    fn frame_num_gap() {
        let sps = SpsBuilder::new()
            .gaps_in_frame_num_value_allowed_flag(true)
            .build();
        let mut poc = PocDecoder::new();
        poc.reset(3);

        assert_eq!(poc.detect_frame_num_gap(&ref_slice(3, 0), &sps, false), 0);
        assert_eq!(poc.detect_frame_num_gap(&ref_slice(4, 0), &sps, false), 0);
        assert_eq!(poc.detect_frame_num_gap(&ref_slice(6, 0), &sps, false), 2);

        let idr = SliceHeaderBuilder::new().idr(0).frame_num(6).build();
        assert_eq!(poc.detect_frame_num_gap(&idr, &sps, false), 0);

        // frame_num wrapped: 15 and 0 are missing.
        poc.reset(14);
        assert_eq!(poc.detect_frame_num_gap(&ref_slice(1, 0), &sps, false), 2);
    }

    #[test]
    fn frame_num_gap_not_allowed() {
        let sps = SpsBuilder::new().build();
        let mut poc = PocDecoder::new();
        poc.reset(0);

        assert_eq!(poc.detect_frame_num_gap(&ref_slice(5, 0), &sps, false), 0);
        assert_eq!(poc.detect_frame_num_gap(&ref_slice(5, 0), &sps, true), 4);
    }

    #[test]
    fn gap_and_init_frame() {
        let sps = SpsBuilder::new().pic_order_cnt_type(2).build();
        let mut poc = PocDecoder::new();
        poc.decode(&ref_slice(2, 0), &sps, 2);

        assert_eq!(poc.frame_gap(false, 3), [4, 4]);
        assert_eq!(poc.prev_frame_ref_num(), 3);

        let mut pocs = [0; 2];
        poc.init_frame(&mut pocs, true, 0);
        assert_eq!(pocs, [4, 4]);

        pocs[1] = 0;
        poc.init_frame(&mut pocs, true, 1);
        assert_eq!(pocs, [4, 4]);
    }
}
