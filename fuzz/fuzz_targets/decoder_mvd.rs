#![no_main]

use libfuzzer_sys::fuzz_target;
use mvd_codecs::codec::mvd::parser::CodedCameraParameters;
use mvd_codecs::codec::mvd::parser::Nalu;
use mvd_codecs::codec::mvd::parser::NaluHeader;
use mvd_codecs::codec::mvd::parser::NaluPayload;
use mvd_codecs::codec::mvd::parser::NaluType;
use mvd_codecs::codec::mvd::parser::Pps;
use mvd_codecs::codec::mvd::parser::ScaleOffset;
use mvd_codecs::codec::mvd::parser::SliceHeader;
use mvd_codecs::codec::mvd::parser::SliceType;
use mvd_codecs::codec::mvd::parser::Sps;
use mvd_codecs::decoder::stateless::mvd::Mvd;
use mvd_codecs::decoder::stateless::SessionState;
use mvd_codecs::decoder::stateless::StatelessDecoder;
use mvd_codecs::decoder::stateless::StatelessVideoDecoder;
use mvd_codecs::decoder::DecoderConfig;

const NUM_VIEWS: u8 = 3;

/// Builds a unit from 4 bytes: a 2-byte NALU header followed by 2 bytes the payload is derived
/// from.
fn make_nalu(chunk: &[u8]) -> Option<Nalu> {
    let header = NaluHeader::parse(&chunk[..2]).ok()?;
    let (a, b) = (chunk[2], chunk[3]);

    let payload = match header.type_ {
        NaluType::Sps => {
            let view_idx = a % NUM_VIEWS;
            let coded = (0..view_idx)
                .map(|_| ScaleOffset {
                    scale: i32::from(b),
                    offset: i32::from(a),
                })
                .collect::<Vec<_>>();

            NaluPayload::Sps(Sps {
                view_idx,
                view_order_idx: i32::from(view_idx),
                is_depth: b & 1 != 0,
                width: 16,
                height: 16,
                max_dec_pic_buffering: usize::from(b >> 5) + 1,
                cam_par_precision: 5,
                cam_par_in_slice_header: b & 2 != 0,
                camera_parameters: CodedCameraParameters {
                    forward: coded.clone(),
                    inverse: coded,
                },
                ..Default::default()
            })
        }
        NaluType::Pps => NaluPayload::Pps(Pps::default()),
        NaluType::Sei => NaluPayload::Sei(vec![]),
        type_ if type_.is_slice() => {
            let view_idx = (b & 3) % NUM_VIEWS;
            let poc = i32::from(a >> 2);
            let slice_type = SliceType::n((b >> 2) % 3)?;
            let ref_view = if b & 0x10 != 0 { 0 } else { view_idx };
            let ref_poc = if ref_view == view_idx { poc - 1 - i32::from(a & 3) } else { poc };

            NaluPayload::Slice(SliceHeader {
                nalu_type: type_,
                nal_ref_idc: header.nal_ref_idc,
                poc,
                view_idx,
                is_depth: b & 0x20 != 0,
                slice_type,
                first_slice_in_picture: b & 0x40 != 0,
                next_slice: b & 0x80 != 0,
                num_ref_idx: [1, 1],
                ref_poc_list: [vec![ref_poc], vec![poc + 1]],
                ref_view_list: [vec![ref_view], vec![view_idx]],
                ref_pic_list_combination: a & 1 != 0,
                ..Default::default()
            })
        }
        _ => NaluPayload::Empty,
    };

    Some(Nalu { header, payload })
}

fuzz_target!(|data: &[u8]| {
    let config = DecoderConfig {
        max_views: usize::from(NUM_VIEWS),
        ..Default::default()
    };
    let mut decoder = StatelessDecoder::<Mvd, _>::new_dummy(config).unwrap();

    for nalu in data.chunks_exact(4).filter_map(make_nalu) {
        if decoder.decode(nalu).is_err() && decoder.session_state() == SessionState::Aborted {
            decoder.teardown();
        }

        while decoder.next_event().is_some() {}
    }

    let _ = decoder.flush();
    while decoder.next_event().is_some() {}
});
