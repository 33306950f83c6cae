// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Early output of frames before the DPB is full.
//!
//! Two sources allow a frame to leave before bumping would output it: a `dpb_output_delay` of
//! zero in its picture timing SEI, or POC type 2, where output order equals decoding order. Both
//! are dropped for good as soon as the stream contradicts them.

use crate::codec::h264::parser::Sps;
use crate::codec::h264::sei::PicTiming;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpbOutput {
    use_payload_sei_delay: bool,
    use_pic_order_cnt_type: bool,
}

impl Default for DpbOutput {
    fn default() -> Self {
        Self {
            use_payload_sei_delay: true,
            use_pic_order_cnt_type: true,
        }
    }
}

impl DpbOutput {
    pub fn new() -> Self {
        Default::default()
    }

    /// Re-enables both sources, unless `disable` is set.
    pub fn reset(&mut self, disable: bool) {
        self.use_payload_sei_delay = !disable;
        self.use_pic_order_cnt_type = !disable;
    }

    pub fn is_use_delay_output_value(&self) -> bool {
        self.is_use_sei_delay_output_value() || self.is_use_pic_order_cnt()
    }

    pub fn is_use_sei_delay_output_value(&self) -> bool {
        self.use_payload_sei_delay
    }

    pub fn is_use_pic_order_cnt(&self) -> bool {
        self.use_pic_order_cnt_type
    }

    pub fn on_new_sps(&mut self, sps: &Sps) {
        if sps.pic_order_cnt_type != 2 {
            self.use_pic_order_cnt_type = false;
        }
    }

    /// Returns the output delay to give a new frame. `None` means the frame waits for bumping.
    pub fn get_dpb_output_delay(&mut self, pic_timing: Option<&PicTiming>) -> Option<u32> {
        if self.is_use_pic_order_cnt() {
            return Some(0);
        }

        let Some(pic_timing) = pic_timing else {
            self.use_payload_sei_delay = false;
            return None;
        };

        if !self.is_use_sei_delay_output_value() {
            return None;
        }

        match pic_timing.dpb_output_delay {
            Some(0) => Some(0),
            delay => {
                self.use_payload_sei_delay = false;
                delay
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::parser::SpsBuilder;

    fn timing(dpb_output_delay: Option<u32>) -> PicTiming {
        PicTiming {
            dpb_output_delay,
            ..Default::default()
        }
    }

    #[test]
    fn poc_type_2_outputs_immediately() {
        let mut output = DpbOutput::new();
        output.on_new_sps(&SpsBuilder::new().pic_order_cnt_type(2).build());

        assert!(output.is_use_pic_order_cnt());
        assert_eq!(output.get_dpb_output_delay(None), Some(0));
        assert_eq!(output.get_dpb_output_delay(Some(&timing(Some(3)))), Some(0));
    }

    #[test]
    fn missing_timing_disables_sei_delay() {
        let mut output = DpbOutput::new();
        output.on_new_sps(&SpsBuilder::new().build());

        assert_eq!(output.get_dpb_output_delay(Some(&timing(Some(0)))), Some(0));
        assert!(output.is_use_sei_delay_output_value());

        assert_eq!(output.get_dpb_output_delay(None), None);
        assert!(!output.is_use_delay_output_value());
        assert_eq!(output.get_dpb_output_delay(Some(&timing(Some(0)))), None);
    }

    #[test]
    fn non_zero_delay_is_returned_once() {
        let mut output = DpbOutput::new();
        output.on_new_sps(&SpsBuilder::new().build());

        assert_eq!(output.get_dpb_output_delay(Some(&timing(Some(4)))), Some(4));
        assert!(!output.is_use_sei_delay_output_value());
        assert_eq!(output.get_dpb_output_delay(Some(&timing(Some(4)))), None);
    }

    #[test]
    fn reset_can_disable() {
        let mut output = DpbOutput::new();
        output.reset(true);
        assert!(!output.is_use_delay_output_value());
        assert_eq!(output.get_dpb_output_delay(Some(&timing(Some(0)))), None);

        output.reset(false);
        assert!(output.is_use_pic_order_cnt());
    }
}
