#![no_main]

use std::rc::Rc;

use h264_refcore::backend::dummy::Backend;
use h264_refcore::codec::h264::parser::RefPicMarkingInner;
use h264_refcore::codec::h264::parser::Slice;
use h264_refcore::codec::h264::parser::SliceHeaderBuilder;
use h264_refcore::codec::h264::parser::SliceType;
use h264_refcore::codec::h264::parser::SpsBuilder;
use h264_refcore::codec::h264::sei::parse_sei;
use h264_refcore::decoder::supplier::TaskSupplier;
use h264_refcore::decoder::DecodeError;
use libfuzzer_sys::fuzz_target;

/// Every record is turned into one slice or SEI message.
const RECORD_LEN: usize = 6;

fuzz_target!(|data: &[u8]| {
    let Some((config, records)) = data.split_first_chunk::<2>() else {
        return;
    };

    let sps = SpsBuilder::new()
        .max_num_ref_frames(config[0] % 17)
        .pic_order_cnt_type(config[0] >> 6)
        .gaps_in_frame_num_value_allowed_flag(config[1] & 1 != 0)
        .frame_mbs_only_flag(config[1] & 2 == 0)
        .bitstream_restriction(u32::from((config[1] >> 2) % 17), 0)
        .nal_hrd(8, 8)
        .build();

    let Ok(mut supplier) = TaskSupplier::new(Backend::new(), Default::default()) else {
        return;
    };

    for record in records.chunks_exact(RECORD_LEN) {
        let kind = record[0];
        if kind & 0x80 != 0 {
            if let Ok(messages) = parse_sei(&record[1..], &sps) {
                for message in messages {
                    supplier.add_sei(u16::from(kind & 1), message);
                }
            }
            continue;
        }

        let slice_type = match kind % 3 {
            0 => SliceType::P,
            1 => SliceType::B,
            _ => SliceType::I,
        };

        let mut builder = SliceHeaderBuilder::new()
            .slice_type(slice_type)
            .frame_num(u16::from(record[1] % 16))
            .pic_order_cnt_lsb(u16::from(record[2] % 16))
            .delta_pic_order_cnt([i32::from(record[3] as i8), 0])
            .nal_ref_idc(record[4] & 3)
            .view_id(u16::from(record[4] >> 7));

        if kind & 0x04 != 0 {
            builder = builder.idr(u16::from(record[5] & 1));
        }
        if kind & 0x08 != 0 {
            builder = builder.field(kind & 0x10 != 0);
        }
        if kind & 0x20 != 0 {
            builder = builder.mmco(RefPicMarkingInner {
                memory_management_control_operation: record[5] >> 4,
                difference_of_pic_nums_minus1: u32::from(record[5] & 3),
                long_term_pic_num: u32::from(record[5] & 3),
                long_term_frame_idx: u32::from(record[5] & 3),
                ..Default::default()
            });
        }
        if kind & 0x40 != 0 {
            supplier.end_of_sequence();
        }

        let mut res = supplier.add_slice(Slice::new(builder.build(), Rc::clone(&sps)));
        let mut attempts = 0;
        while matches!(res, Err(DecodeError::NotEnoughBuffer)) && attempts < 4 {
            while let Some(frame) = supplier.get_frame_to_display(false) {
                supplier.frame_displayed(frame.id);
            }
            if let Ok(Some(frame)) = supplier.recover_dpb_space() {
                supplier.frame_displayed(frame.id);
            }
            res = supplier.retry();
            attempts += 1;
        }

        while let Some(frame) = supplier.get_frame_to_display(false) {
            supplier.frame_displayed(frame.id);
        }
    }

    let _ = supplier.flush();
    while let Some(frame) = supplier.get_frame_to_display(true) {
        supplier.frame_displayed(frame.id);
    }
});
