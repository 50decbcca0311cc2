use super::*;
use crc::{Crc, CRC_32_ISCSI};
use postcard::accumulator::{CobsAccumulator, FeedResult};
use postcard::to_slice_cobs;

#[test]
fn program_request_survives_cobs_framing() {
    let data = [0xA5u8; 200];
    let crc = Crc::<u32>::new(&CRC_32_ISCSI).checksum(&data);
    let msg = HostProtocolMessage::Bootloader(Bootloader::ProgramData {
        address: 0x0002_7000,
        crc,
        data: &data,
    });

    let mut buf = [0u8; COBS_MAX_MSG_SIZE];
    let frame = to_slice_cobs(&msg, &mut buf).unwrap();
    // COBS frames never carry a zero byte apart from the terminator.
    assert_eq!(frame.iter().filter(|b| **b == 0).count(), 1);

    let mut acc: CobsAccumulator<COBS_MAX_MSG_SIZE> = CobsAccumulator::new();
    match acc.feed_ref::<HostProtocolMessage>(frame) {
        FeedResult::Success { data: decoded, remaining } => {
            assert!(remaining.is_empty());
            assert_eq!(decoded, msg);
        }
        _ => panic!("frame not decoded"),
    }
}

#[test]
fn two_frames_in_one_read_are_split() {
    let mut buf = [0u8; 64];
    let first = to_slice_cobs(&HostProtocolMessage::GetState, &mut buf).unwrap().len();
    let second = to_slice_cobs(
        &HostProtocolMessage::Bootloader(Bootloader::EraseData { address: 0x1000 }),
        &mut buf[first..],
    )
    .unwrap()
    .len();

    let mut acc: CobsAccumulator<COBS_MAX_MSG_SIZE> = CobsAccumulator::new();
    let window = &buf[..first + second];
    let rest = match acc.feed_ref::<HostProtocolMessage>(window) {
        FeedResult::Success { data, remaining } => {
            assert_eq!(data, HostProtocolMessage::GetState);
            remaining
        }
        _ => panic!("first frame not decoded"),
    };
    match acc.feed_ref::<HostProtocolMessage>(rest) {
        FeedResult::Success { data, remaining } => {
            assert_eq!(data, HostProtocolMessage::Bootloader(Bootloader::EraseData { address: 0x1000 }));
            assert!(remaining.is_empty());
        }
        _ => panic!("second frame not decoded"),
    }
}

#[test]
fn oversized_frame_is_reported() {
    let mut acc: CobsAccumulator<16> = CobsAccumulator::new();
    let junk = [0x11u8; 40];
    assert!(matches!(
        acc.feed_ref::<HostProtocolMessage>(&junk),
        FeedResult::OverFull(_)
    ));
}
