// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Readers for the SEI payloads that affect reference management and output: decoded reference
//! picture marking repetition (D.1.8), picture timing (D.1.3) and recovery point (D.1.7).

use anyhow::anyhow;
use anyhow::Context;
use enumn::N;

use crate::codec::h264::nalu_reader::NaluReader;
use crate::codec::h264::parser::MaxLongTermFrameIdx;
use crate::codec::h264::parser::RefPicMarking;
use crate::codec::h264::parser::RefPicMarkingInner;
use crate::codec::h264::parser::Sps;

/// SEI payload types handled by this crate, see Annex D.
#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SeiPayloadType {
    BufferingPeriod = 0,
    PicTiming = 1,
    RecoveryPoint = 6,
    DecRefPicMarkingRepetition = 7,
}

/// The `dec_ref_pic_marking_repetition` payload: the marking a past picture was decoded with.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecRefPicMarkingRepetition {
    pub original_idr_flag: bool,
    pub original_frame_num: u32,
    pub original_field_pic_flag: bool,
    pub original_bottom_field_flag: bool,
    pub dec_ref_pic_marking: RefPicMarking,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PicTiming {
    pub cpb_removal_delay: u32,
    /// Output delay in clock ticks, present only when the SPS carries HRD parameters.
    pub dpb_output_delay: Option<u32>,
    /// Table D-1 picture structure, present when `pic_struct_present_flag` is set.
    pub pic_struct: Option<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryPoint {
    pub recovery_frame_cnt: u32,
    pub exact_match_flag: bool,
    pub broken_link_flag: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SeiMessage {
    PicTiming(PicTiming),
    RecoveryPoint(RecoveryPoint),
    DecRefPicMarkingRepetition(DecRefPicMarkingRepetition),
}

/// Reads `dec_ref_pic_marking()` as it appears in slice headers and repetition payloads.
pub(crate) fn parse_dec_ref_pic_marking(
    r: &mut NaluReader,
    idr_pic_flag: bool,
) -> anyhow::Result<RefPicMarking> {
    let mut rpm = RefPicMarking::default();

    if idr_pic_flag {
        rpm.no_output_of_prior_pics_flag = r.read_bit()?;
        rpm.long_term_reference_flag = r.read_bit()?;
        return Ok(rpm);
    }

    rpm.adaptive_ref_pic_marking_mode_flag = r.read_bit()?;
    if rpm.adaptive_ref_pic_marking_mode_flag {
        loop {
            let mut marking = RefPicMarkingInner::default();

            let mem_mgmt_ctrl_op = r.read_ue_max::<u8>(6)?;
            marking.memory_management_control_operation = mem_mgmt_ctrl_op;

            if mem_mgmt_ctrl_op == 0 {
                break;
            }

            if mem_mgmt_ctrl_op == 1 || mem_mgmt_ctrl_op == 3 {
                marking.difference_of_pic_nums_minus1 = r.read_ue()?;
            }

            if mem_mgmt_ctrl_op == 2 {
                marking.long_term_pic_num = r.read_ue()?;
            }

            if mem_mgmt_ctrl_op == 3 || mem_mgmt_ctrl_op == 6 {
                marking.long_term_frame_idx = r.read_ue()?;
            }

            if mem_mgmt_ctrl_op == 4 {
                marking.max_long_term_frame_idx =
                    MaxLongTermFrameIdx::from_value_plus1(r.read_ue()?);
            }

            rpm.inner.push(marking);
        }
    }

    Ok(rpm)
}

fn parse_dec_ref_pic_marking_repetition(
    r: &mut NaluReader,
    sps: &Sps,
) -> anyhow::Result<DecRefPicMarkingRepetition> {
    let mut rep = DecRefPicMarkingRepetition {
        original_idr_flag: r.read_bit()?,
        original_frame_num: r.read_ue_max(sps.max_frame_num() - 1)?,
        ..Default::default()
    };

    if !sps.frame_mbs_only_flag {
        rep.original_field_pic_flag = r.read_bit()?;
        if rep.original_field_pic_flag {
            rep.original_bottom_field_flag = r.read_bit()?;
        }
    }

    rep.dec_ref_pic_marking = parse_dec_ref_pic_marking(r, rep.original_idr_flag)?;
    Ok(rep)
}

fn parse_pic_timing(r: &mut NaluReader, sps: &Sps) -> anyhow::Result<PicTiming> {
    let mut timing = PicTiming::default();
    let vui = &sps.vui_parameters;

    if sps.vui_parameters_present_flag {
        if let Some(hrd) = vui.hrd() {
            timing.cpb_removal_delay =
                r.read_bits(usize::from(hrd.cpb_removal_delay_length_minus1) + 1)?;
            timing.dpb_output_delay =
                Some(r.read_bits(usize::from(hrd.dpb_output_delay_length_minus1) + 1)?);
        }

        if vui.pic_struct_present_flag {
            timing.pic_struct = Some(r.read_bits(4)?);
        }
    }

    Ok(timing)
}

fn parse_recovery_point(r: &mut NaluReader, sps: &Sps) -> anyhow::Result<RecoveryPoint> {
    let point = RecoveryPoint {
        recovery_frame_cnt: r.read_ue_max(sps.max_frame_num() - 1)?,
        exact_match_flag: r.read_bit()?,
        broken_link_flag: r.read_bit()?,
    };
    // changing_slice_group_idc
    r.skip_bits(2)?;

    Ok(point)
}

/// Reads a `ff_byte`-extended value, used for the payload type and size.
fn read_ff_coded(r: &mut NaluReader) -> anyhow::Result<u32> {
    let mut value = 0u32;

    loop {
        let byte = r.read_byte()?;
        value = value
            .checked_add(u32::from(byte))
            .ok_or(anyhow!("SEI payload header overflows"))?;
        if byte != 0xff {
            return Ok(value);
        }
    }
}

/// Parses a single SEI payload of `payload_type` from its unescaped bytes.
pub fn parse_sei_payload(
    payload_type: u32,
    payload: &[u8],
    sps: &Sps,
) -> anyhow::Result<SeiMessage> {
    let mut r = NaluReader::new(payload);

    match SeiPayloadType::n(payload_type) {
        Some(SeiPayloadType::PicTiming) => Ok(SeiMessage::PicTiming(
            parse_pic_timing(&mut r, sps).context("while parsing pic_timing")?,
        )),
        Some(SeiPayloadType::RecoveryPoint) => Ok(SeiMessage::RecoveryPoint(
            parse_recovery_point(&mut r, sps).context("while parsing recovery_point")?,
        )),
        Some(SeiPayloadType::DecRefPicMarkingRepetition) => {
            Ok(SeiMessage::DecRefPicMarkingRepetition(
                parse_dec_ref_pic_marking_repetition(&mut r, sps)
                    .context("while parsing dec_ref_pic_marking_repetition")?,
            ))
        }
        _ => Err(anyhow!("unsupported SEI payload type {}", payload_type)),
    }
}

/// Parses the `sei_rbsp()` of a SEI NAL unit, without its NAL header byte. Payloads of types this
/// crate does not use are skipped.
pub fn parse_sei(rbsp: &[u8], sps: &Sps) -> anyhow::Result<Vec<SeiMessage>> {
    let mut r = NaluReader::new(rbsp);
    let mut messages = Vec::new();

    while r.has_more_rsbp_data() {
        let payload_type = read_ff_coded(&mut r)?;
        let payload_size = read_ff_coded(&mut r)? as usize;

        if r.num_bits_left() < payload_size * 8 {
            return Err(anyhow!(
                "SEI payload of type {} is truncated ({} bytes announced)",
                payload_type,
                payload_size
            ));
        }

        let payload = (0..payload_size)
            .map(|_| r.read_byte())
            .collect::<Result<Vec<u8>, _>>()?;

        if SeiPayloadType::n(payload_type).is_none()
            || payload_type == SeiPayloadType::BufferingPeriod as u32
        {
            log::trace!("skipping SEI payload of type {}", payload_type);
            continue;
        }

        messages.push(parse_sei_payload(payload_type, &payload, sps)?);
    }

    Ok(messages)
}
