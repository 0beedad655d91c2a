//! Wire format tests: start frames, single-byte commands and telemetry decoding

mod common;

use common::*;
use trivium_lib::frame::{adjust_intensity, classify_level, encode_battery_request, encode_stop, encode_telemetry};

#[test]
fn test_golden_start_frames() {
    let cases = [
        ((5, 20), "41 30303034 30303034 30313030 30313030 3035 3035 3230 42"),
        ((12, 30), "41 30303034 30303034 30313030 30313030 3132 3132 3330 42"),
        ((19, 0), "41 30303034 30303034 30313030 30313030 3139 3139 3030 42"),
    ];

    for ((intensity, duration), expected) in cases {
        let frame = encode_start(intensity, duration).unwrap();
        assert_eq!(frame.len(), 24, "frame for ({intensity}, {duration})");
        assert_eq!(frame, hex_to_bytes(expected), "frame for ({intensity}, {duration})");
    }
}

#[test]
fn test_start_frame_parses_back() {
    let frame = encode_start(5, 20).unwrap();
    assert_eq!(
        Command::parse(&frame),
        Some((
            Command::Start {
                intensity: 5,
                duration_min: 20
            },
            24
        ))
    );

    // truncated or unterminated frames are not commands
    assert_eq!(Command::parse(&frame[..23]), None);
    let mut broken = frame.to_vec();
    broken[23] = b'X';
    assert_eq!(Command::parse(&broken), None);
}

#[test]
fn test_single_byte_commands() {
    assert_eq!(&encode_stop()[..], &[0x43]);
    assert_eq!(&encode_battery_request()[..], &[0x46]);
    assert_eq!(Command::Stop.to_bytes().unwrap(), encode_stop());
    assert!(!Command::BatteryRequest.is_paced());
    assert!(Command::Start { intensity: 1, duration_min: 1 }.is_paced());
}

#[test]
fn test_out_of_range_fields_are_rejected() {
    match encode_start(100, 10) {
        Err(TriviumError::FieldOverflow { value, digits }) => {
            assert_eq!(value, 100);
            assert_eq!(digits, 2);
        }
        other => panic!("Expected FieldOverflow, got {:?}", other),
    }
    assert!(encode_start(5, 100).is_err());
}

#[test]
fn test_decode_every_framed_reading() {
    // readings are 10-bit; only high bytes 2 and 3 can start a frame
    for value in 512u16..=1023 {
        let [hi, lo] = value.to_be_bytes();
        match decode_telemetry(&[hi, lo, 0x00, 0x00]) {
            Decoded::Sample { sample, consumed } => {
                assert_eq!(sample.value, value);
                assert_eq!(consumed, 4);
            }
            other => panic!("value {value}: expected a sample, got {other:?}"),
        }
    }
}

#[test]
fn test_decode_waits_for_full_window() {
    assert_eq!(decode_telemetry(&[0x03, 0x84]), Decoded::NeedMoreData { discard: 0 });
    assert_eq!(decode_telemetry(&[0xff, 0x10, 0x03]), Decoded::NeedMoreData { discard: 2 });
    assert_eq!(decode_telemetry(&[0xff, 0x10]), Decoded::NeedMoreData { discard: 2 });
    assert_eq!(decode_telemetry(&[]), Decoded::NeedMoreData { discard: 0 });
}

#[test]
fn test_decoder_resyncs_across_reads() {
    let mut decoder = TelemetryDecoder::new();

    decoder.push(&[0x00, 0xff, 0x03]);
    assert_eq!(decoder.next_sample(), None);
    assert_eq!(decoder.pending(), 1);

    decoder.push(&[0x52, 0x00]);
    assert_eq!(decoder.next_sample(), None);

    decoder.push(&[0x00, 0x99]);
    let sample = decoder.next_sample().unwrap();
    assert_eq!(sample.value, 0x0352);
    assert_eq!(sample.level, BatteryLevel::Medium);
    // trailing bytes go with the frame
    assert_eq!(decoder.pending(), 0);
}

#[test]
fn test_simulated_device_reply_decodes() {
    let mut decoder = TelemetryDecoder::new();
    decoder.push(&encode_telemetry(900));
    assert_eq!(decoder.next_sample().unwrap().value, 900);
}

#[test]
fn test_level_boundaries() {
    assert_eq!(classify_level(839), BatteryLevel::Low);
    assert_eq!(classify_level(840), BatteryLevel::Medium);
    assert_eq!(classify_level(889), BatteryLevel::Medium);
    assert_eq!(classify_level(890), BatteryLevel::High);
    assert_eq!(classify_level(1023), BatteryLevel::High);

    assert_eq!(BatteryLevel::High.to_string(), "HIGH");
    assert_eq!(u8::from(BatteryLevel::Low), 1);
}

#[test]
fn test_intensity_steps_are_clamped() {
    assert_eq!(adjust_intensity(5, 1), 6);
    assert_eq!(adjust_intensity(1, -1), 1);
    assert_eq!(adjust_intensity(19, 1), 19);
    assert_eq!(adjust_intensity(0, 0), 1);
}
