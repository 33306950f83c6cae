#![no_main]

use h264_refcore::codec::h264::parser::SpsBuilder;
use h264_refcore::codec::h264::sei::parse_sei;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&config, rbsp)) = data.split_first() else {
        return;
    };

    let sps = SpsBuilder::new()
        .nal_hrd((config & 0x1f) + 1, ((config >> 3) & 0x1f) + 1)
        .build();

    let _ = parse_sei(rbsp, &sps);
});
