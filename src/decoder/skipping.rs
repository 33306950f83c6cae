// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Dropping of non-reference frames when the client asks for faster decoding.

use log::debug;

use crate::codec::h264::frame::Frame;

/// Highest decoding speed. Every non-reference frame is skipped.
pub const MAX_DECODING_SPEED: i32 = 7;

/// Which pictures are decoded without the deblocking filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeblockingMode {
    #[default]
    Normal,
    /// Non-reference pictures only. Nothing predicts from them, so the error does not spread.
    NonReference,
    /// Every picture.
    All,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipInfo {
    /// Whether the speed level also turns deblocking off, for some or all pictures.
    pub is_deblocking_turned_off: bool,
    pub number_of_skipped_frames: usize,
}

#[derive(Debug, Default)]
pub struct Skipping {
    decoding_speed: i32,
    /// Length of a skip cycle, in non-reference frames.
    skip_cycle: u32,
    /// One frame out of `mod_skip_cycle` is skipped within a cycle.
    mod_skip_cycle: u32,
    skip_flag: u32,
    deblocking_mode: DeblockingMode,
    number_of_skipped_frames: usize,
}

impl Skipping {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn reset(&mut self) {
        *self = Default::default();
    }

    pub fn decoding_speed(&self) -> i32 {
        self.decoding_speed
    }

    /// Moves the decoding speed by `delta`, clamped to `0..=7`, and returns the new speed.
    pub fn change_video_decoding_speed(&mut self, delta: i32) -> i32 {
        self.decoding_speed = (self.decoding_speed + delta).clamp(0, MAX_DECODING_SPEED);

        let (skip_cycle, mod_skip_cycle) = match self.decoding_speed {
            6 | 7 => (1, 1),
            4 | 5 => (3, 2),
            3 => (2, 2),
            2 => (3, 3),
            1 => (4, 4),
            _ => (self.skip_cycle, self.mod_skip_cycle),
        };

        self.skip_cycle = skip_cycle;
        self.mod_skip_cycle = mod_skip_cycle;
        self.deblocking_mode = match self.decoding_speed {
            7 => DeblockingMode::All,
            5 => DeblockingMode::NonReference,
            _ => DeblockingMode::Normal,
        };

        debug!(
            "Decoding speed {}: skip cycle {}/{}, deblocking {:?}",
            self.decoding_speed, skip_cycle, mod_skip_cycle, self.deblocking_mode
        );

        self.decoding_speed
    }

    pub fn deblocking_mode(&self) -> DeblockingMode {
        self.deblocking_mode
    }

    /// Whether field `field` of `frame` is decoded without the deblocking filter.
    pub fn is_should_skip_deblocking(&self, frame: &Frame, field: usize) -> bool {
        match self.deblocking_mode {
            DeblockingMode::Normal => false,
            DeblockingMode::NonReference => !frame.aus[field].is_reference(),
            DeblockingMode::All => true,
        }
    }

    /// Decides whether `frame` is dropped. Reference frames never are.
    pub fn is_should_skip_frame(&mut self, frame: &Frame) -> bool {
        let is_reference = frame.aus[0].is_reference() || frame.aus[1].is_reference();

        if self.decoding_speed == 0 || is_reference || self.mod_skip_cycle == 0 {
            return false;
        }

        let skip = self.skip_flag % self.mod_skip_cycle == 0;

        self.skip_flag += 1;
        if self.skip_flag >= self.skip_cycle {
            self.skip_flag = 0;
        }

        if skip {
            self.number_of_skipped_frames += 1;
        }

        skip
    }

    pub fn skip_info(&self) -> SkipInfo {
        SkipInfo {
            is_deblocking_turned_off: self.deblocking_mode != DeblockingMode::Normal,
            number_of_skipped_frames: self.number_of_skipped_frames,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::codec::h264::parser::Slice;
    use crate::codec::h264::parser::SliceHeaderBuilder;
    use crate::codec::h264::parser::SliceType;
    use crate::codec::h264::parser::SpsBuilder;

    fn frame(nal_ref_idc: u8) -> Frame {
        let hdr = SliceHeaderBuilder::new()
            .slice_type(SliceType::B)
            .nal_ref_idc(nal_ref_idc)
            .build();
        let mut frame = Frame::default();
        frame.aus[0].add_slice(Slice::new(hdr, SpsBuilder::new().build()));
        frame
    }

    fn pattern(skipping: &mut Skipping, count: usize) -> Vec<bool> {
        let non_ref = frame(0);
        (0..count)
            .map(|_| skipping.is_should_skip_frame(&non_ref))
            .collect()
    }

    #[test]
    fn speed_is_clamped() {
        let mut skipping = Skipping::new();
        assert_eq!(skipping.change_video_decoding_speed(12), 7);
        assert_eq!(skipping.change_video_decoding_speed(-20), 0);
    }

    #[test]
    fn off_by_default() {
        let mut skipping = Skipping::new();
        assert_eq!(pattern(&mut skipping, 4), vec![false; 4]);
    }

    #[test]
    fn speed_one_skips_one_in_four() {
        let mut skipping = Skipping::new();
        skipping.change_video_decoding_speed(1);
        assert_eq!(
            pattern(&mut skipping, 8),
            vec![true, false, false, false, true, false, false, false]
        );
        assert_eq!(skipping.skip_info().number_of_skipped_frames, 2);
    }

    #[test]
    fn speed_four_skips_two_in_three() {
        let mut skipping = Skipping::new();
        skipping.change_video_decoding_speed(4);
        assert_eq!(
            pattern(&mut skipping, 6),
            vec![true, false, true, true, false, true]
        );
        assert!(!skipping.skip_info().is_deblocking_turned_off);
    }

    #[test]
    fn deblocking_modes() {
        let mut skipping = Skipping::new();
        let (reference, non_ref) = (frame(1), frame(0));

        skipping.change_video_decoding_speed(5);
        assert_eq!(skipping.deblocking_mode(), DeblockingMode::NonReference);
        assert!(!skipping.is_should_skip_deblocking(&reference, 0));
        assert!(skipping.is_should_skip_deblocking(&non_ref, 0));
        assert!(skipping.skip_info().is_deblocking_turned_off);

        skipping.change_video_decoding_speed(1);
        assert_eq!(skipping.deblocking_mode(), DeblockingMode::Normal);
        assert!(!skipping.is_should_skip_deblocking(&non_ref, 0));
        assert!(!skipping.skip_info().is_deblocking_turned_off);

        skipping.change_video_decoding_speed(1);
        assert_eq!(skipping.deblocking_mode(), DeblockingMode::All);
        assert!(skipping.is_should_skip_deblocking(&reference, 0));
        assert!(skipping.is_should_skip_deblocking(&non_ref, 0));
    }

    #[test]
    fn reference_frames_are_kept() {
        let mut skipping = Skipping::new();
        skipping.change_video_decoding_speed(7);
        assert!(!skipping.is_should_skip_frame(&frame(1)));
        assert!(skipping.is_should_skip_frame(&frame(0)));
        assert!(skipping.skip_info().is_deblocking_turned_off);

        skipping.reset();
        assert_eq!(skipping.skip_info(), SkipInfo::default());
        assert!(!skipping.is_should_skip_frame(&frame(0)));
    }
}
