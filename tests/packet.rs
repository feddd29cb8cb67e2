//! Wire-format round-trip fixtures, built the way the teacher's frame tests
//! assembled raw hex buffers by hand rather than only exercising the
//! in-process constructors.

use jacbus::{DeviceId, Packet};

fn hex_bytes(s: &str) -> Vec<u8> {
    hex::decode(s).unwrap()
}

#[test]
fn announce_frame_parses_service_classes() {
    // header: crc(2) size(1) flags(1) id(8) service_index(1) service_command(2)
    // flags=0x00 (report, not a command), service_index=0 (ctrl), cmd=0x0000
    let mut bytes = vec![0u8, 0u8, 8, 0x00];
    bytes.extend_from_slice(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
    bytes.push(0x00);
    bytes.extend_from_slice(&[0x00, 0x00]);
    // payload: slot0 flags/restart word, then one service class
    bytes.extend_from_slice(&0x0001u32.to_le_bytes());
    bytes.extend_from_slice(&0x1f14_0409u32.to_le_bytes());

    let pkt = Packet::from_bytes(&bytes).unwrap();
    assert_eq!(pkt.size(), 8);
    assert!(pkt.is_report());
    assert_eq!(pkt.service_index(), 0);
    assert_eq!(
        pkt.device_identifier(),
        DeviceId([0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88])
    );
}

#[test]
fn command_frame_round_trips_through_hex() {
    let mut pkt = Packet::command(0x82, vec![1, 2, 3, 4]).unwrap();
    pkt.set_device_identifier(DeviceId([0xaa; 8]));
    pkt.set_service_index(1);
    pkt.set_requires_ack(true);

    let bytes = pkt.to_bytes();
    let hex = hex::encode(&bytes);
    let round_tripped = Packet::from_bytes(&hex_bytes(&hex)).unwrap();

    assert!(round_tripped.is_command());
    assert!(round_tripped.requires_ack());
    assert_eq!(round_tripped.service_index(), 1);
    assert_eq!(round_tripped.payload(), &[1, 2, 3, 4]);
}

#[test]
fn get_reg_and_set_reg_commands_classify_correctly() {
    let get = Packet::report(Packet::make_get_reg_command(0x101), vec![]).unwrap();
    assert!(get.is_reg_get());
    assert_eq!(get.reg_code(), 0x101);

    let set = Packet::report(Packet::make_set_reg_command(0x101), vec![9, 9]).unwrap();
    assert!(set.is_reg_set());
    assert_eq!(set.payload(), &[9, 9]);
}

#[test]
fn event_frame_carries_counter_and_code() {
    let cmd = Packet::make_event_command(100, 3);
    let pkt = Packet::report(cmd, vec![0xde, 0xad]).unwrap();
    assert!(pkt.is_event());
    assert_eq!(pkt.event_counter(), Some(100));
    assert_eq!(pkt.event_code(), Some(3));
    assert_eq!(pkt.payload(), &[0xde, 0xad]);
}

#[test]
fn oversized_payload_is_rejected_before_touching_the_wire() {
    let too_big = vec![0u8; 237];
    assert!(Packet::report(0, too_big).is_err());
}
