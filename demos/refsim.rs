// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! refsim, a reference management simulator. Generates a synthetic IBP stream, runs it through a
//! decoding session backed by the dummy accelerator and prints the frames in output order.

use std::rc::Rc;

use argh::FromArgs;

use h264_refcore::backend::dummy::Backend;
use h264_refcore::codec::h264::parser::Slice;
use h264_refcore::codec::h264::parser::SliceHeaderBuilder;
use h264_refcore::codec::h264::parser::SliceType;
use h264_refcore::codec::h264::parser::Sps;
use h264_refcore::codec::h264::parser::SpsBuilder;
use h264_refcore::decoder::supplier::TaskSupplier;
use h264_refcore::decoder::DecodeError;
use h264_refcore::decoder::DecodedFrame;
use h264_refcore::decoder::SupplierParams;

const MAX_FRAME_NUM: u32 = 16;
const MAX_PIC_ORDER_CNT_LSB: u32 = 256;

/// Reference management simulator
#[derive(Debug, FromArgs)]
struct Args {
    /// number of frames to generate. Default: 24
    #[argh(option, default = "24")]
    frames: usize,

    /// distance between two IDR frames. Default: 12
    #[argh(option, default = "12")]
    gop: usize,

    /// number of B frames between two reference frames. Default: 2
    #[argh(option, default = "2")]
    b_frames: usize,

    /// max_num_ref_frames of the stream. Default: 2
    #[argh(option, default = "2")]
    num_ref_frames: u8,

    /// max_dec_frame_buffering of the stream. Default: 4
    #[argh(option, default = "4")]
    max_dec_frame_buffering: u32,

    /// frames allocated on top of what the stream requires. Default: 1
    #[argh(option, default = "1")]
    extra_dpb_size: usize,

    /// drop the reference frame with this frame_num from the first GOP, leaving a frame_num gap
    #[argh(option)]
    drop_frame_num: Option<u16>,

    /// code every picture as a pair of fields
    #[argh(switch)]
    fields: bool,

    /// decoding speed, 0 to 7. Higher speeds skip non-reference frames.
    #[argh(option, default = "0")]
    decoding_speed: i32,
}

/// A picture of the synthetic stream, in decoding order.
struct Picture {
    slice_type: SliceType,
    frame_num: u16,
    /// Position in display order within the GOP.
    display: usize,
    is_reference: bool,
}

/// Lays out one GOP in decoding order: the IDR, then each reference frame followed by the B
/// frames displayed before it.
fn gop_pictures(len: usize, b_frames: usize) -> Vec<Picture> {
    let mut pictures = vec![Picture {
        slice_type: SliceType::I,
        frame_num: 0,
        display: 0,
        is_reference: true,
    }];

    let mut frame_num = 0u16;
    let mut last_ref = 0;
    while last_ref + 1 < len {
        let next_ref = (last_ref + b_frames + 1).min(len - 1);
        frame_num = (frame_num + 1) % MAX_FRAME_NUM as u16;
        pictures.push(Picture {
            slice_type: SliceType::P,
            frame_num,
            display: next_ref,
            is_reference: true,
        });

        for display in last_ref + 1..next_ref {
            pictures.push(Picture {
                slice_type: SliceType::B,
                frame_num: (frame_num + 1) % MAX_FRAME_NUM as u16,
                display,
                is_reference: false,
            });
        }

        last_ref = next_ref;
    }

    pictures
}

fn slices_for(picture: &Picture, sps: &Rc<Sps>, fields: bool) -> Vec<Slice> {
    let poc = (picture.display * 2) as u16;
    let nal_ref_idc = if picture.is_reference { 1 } else { 0 };

    let builder = |slice_type: SliceType| {
        let builder = SliceHeaderBuilder::new()
            .slice_type(slice_type)
            .frame_num(picture.frame_num)
            .nal_ref_idc(nal_ref_idc);

        if slice_type.is_i() && picture.frame_num == 0 {
            builder.idr(0)
        } else {
            builder
        }
    };

    if !fields {
        let hdr = builder(picture.slice_type)
            .pic_order_cnt_lsb(poc)
            .build();
        return vec![Slice::new(hdr, Rc::clone(sps))];
    }

    // The second field of an intra picture predicts from the first one.
    let second_type = if picture.slice_type.is_i() {
        SliceType::P
    } else {
        picture.slice_type
    };

    let top = builder(picture.slice_type)
        .field(false)
        .pic_order_cnt_lsb(poc)
        .build();
    let bottom = SliceHeaderBuilder::new()
        .slice_type(second_type)
        .frame_num(picture.frame_num)
        .nal_ref_idc(nal_ref_idc)
        .field(true)
        .pic_order_cnt_lsb(poc + 1)
        .build();

    vec![
        Slice::new(top, Rc::clone(sps)),
        Slice::new(bottom, Rc::clone(sps)),
    ]
}

fn print_frame(frame: &DecodedFrame) {
    println!(
        "out: view {} uid {:3} frame_num {:2} poc {:3} {:?}{}{}",
        frame.view_id,
        frame.uid,
        frame.frame_num,
        frame.poc,
        frame.display_struct,
        if frame.is_skipped { " skipped" } else { "" },
        if frame.error_flags.is_empty() {
            String::new()
        } else {
            format!(" {:?}", frame.error_flags)
        }
    );
}

/// Outputs every frame the session is ready to let go of.
fn output_ready(supplier: &mut TaskSupplier<Backend>, force: bool) -> usize {
    let mut count = 0;
    while let Some(frame) = supplier.get_frame_to_display(force) {
        print_frame(&frame);
        supplier.frame_displayed(frame.id);
        count += 1;
    }
    count
}

fn feed(supplier: &mut TaskSupplier<Backend>, slice: Slice) -> anyhow::Result<()> {
    let mut res = supplier.add_slice(slice);

    loop {
        match res {
            Ok(()) => break,
            Err(DecodeError::NotEnoughBuffer) => {
                if output_ready(supplier, false) == 0 {
                    if let Some(frame) = supplier.recover_dpb_space()? {
                        print_frame(&frame);
                        supplier.frame_displayed(frame.id);
                    }
                }
                res = supplier.retry();
            }
            Err(err) => return Err(err.into()),
        }
    }

    output_ready(supplier, false);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();
    if args.gop == 0 {
        anyhow::bail!("the GOP must hold at least one frame");
    }

    let sps = SpsBuilder::new()
        .max_num_ref_frames(args.num_ref_frames)
        .max_frame_num(MAX_FRAME_NUM)
        .max_pic_order_cnt_lsb(MAX_PIC_ORDER_CNT_LSB)
        .frame_mbs_only_flag(!args.fields)
        .gaps_in_frame_num_value_allowed_flag(args.drop_frame_num.is_some())
        .bitstream_restriction(args.max_dec_frame_buffering, args.max_dec_frame_buffering)
        .build();

    let mut supplier = TaskSupplier::new(
        Backend::new(),
        SupplierParams {
            extra_dpb_size: args.extra_dpb_size,
            decoding_speed: args.decoding_speed,
            ..Default::default()
        },
    )?;

    let mut remaining = args.frames;
    let mut first_gop = true;
    while remaining > 0 {
        let len = remaining.min(args.gop);
        for picture in gop_pictures(len, args.b_frames) {
            if first_gop && picture.is_reference && Some(picture.frame_num) == args.drop_frame_num
            {
                println!("drop: frame_num {}", picture.frame_num);
                continue;
            }

            for slice in slices_for(&picture, &sps, args.fields) {
                feed(&mut supplier, slice)?;
            }
        }

        remaining -= len;
        first_gop = false;
    }

    supplier.flush()?;
    output_ready(&mut supplier, true);

    let skip_info = supplier.skip_info();
    println!(
        "decoded {} field(s), skipped {} frame(s)",
        supplier.accelerator().submitted().len(),
        skip_info.number_of_skipped_frames
    );

    Ok(())
}
