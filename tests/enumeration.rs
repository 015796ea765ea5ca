// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Enumeration as a host would drive it: reset, descriptors, address,
//! configuration.

mod common;

use common::*;
use generic_hid_usb::control::ControlStage;
use generic_hid_usb::endpoint::Owner;
use generic_hid_usb::sim::Handshake;
use generic_hid_usb::DeviceState;
use proptest::prelude::*;

const DEVICE: [u8; 18] = [
    18, 0x01, // bLength, DEVICE
    0x00, 0x02, // USB 2.00
    0, 0, 0, // class in interface
    8, // EP0 size
    0xD8, 0x04, // VID
    0xA5, 0x01, // PID
    0x01, 0x00, // release
    1, 2, 0, // strings
    1, // configurations
];

#[test]
fn attach_waits_for_reset() {
    let bus = Bus::attached();
    assert!(bus.sie.is_attached());
    assert_eq!(bus.usb.state(), DeviceState::Powered);
    assert!(!bus.sie.is_armed(0x00));
}

#[test]
fn device_descriptor() {
    let mut bus = Bus::reset();
    assert_eq!(bus.usb.state(), DeviceState::Default);

    let data = bus.control_in(get_descriptor(0x01, 0, 64)).unwrap();
    assert_eq!(data, DEVICE);
    let sizes: Vec<usize> = bus.last_packets.iter().map(Vec::len).collect();
    assert_eq!(sizes, [8, 8, 2]);
}

#[test]
fn short_request_gets_prefix() {
    let mut bus = Bus::reset();
    // Hosts commonly read only the first packet to learn bMaxPacketSize0.
    let data = bus.control_in(get_descriptor(0x01, 0, 8)).unwrap();
    assert_eq!(data, DEVICE[..8]);
    assert_eq!(bus.last_packets.len(), 1);
}

#[test]
fn configuration_descriptor() {
    let mut bus = Bus::reset();
    let header = bus.control_in(get_descriptor(0x02, 0, 9)).unwrap();
    assert_eq!(header, [9, 0x02, 41, 0, 1, 1, 0, 0xA0, 0x32]);

    let full = bus.control_in(get_descriptor(0x02, 0, 41)).unwrap();
    assert_eq!(full.len(), 41);
    // Interface: HID class, two endpoints.
    assert_eq!(full[9..18], [9, 0x04, 0, 0, 2, 0x03, 0, 0, 0]);
    // HID descriptor: 1.11, one report descriptor of 47 bytes.
    assert_eq!(full[18..27], [9, 0x21, 0x11, 0x01, 0, 1, 0x22, 47, 0]);
    assert_eq!(full[27..34], [7, 0x05, 0x81, 0x03, 8, 0, 1]);
    assert_eq!(full[34..41], [7, 0x05, 0x01, 0x03, 8, 0, 1]);
}

#[test]
fn string_ending_on_packet_boundary_gets_zlp() {
    let mut bus = Bus::reset();
    let data = bus.control_in(get_descriptor(0x03, 1, 0xFF)).unwrap();
    assert_eq!(data.len(), 24);
    assert_eq!(data[..4], [24, 0x03, b'D', 0]);
    let sizes: Vec<usize> = bus.last_packets.iter().map(Vec::len).collect();
    assert_eq!(sizes, [8, 8, 8, 0]);
}

#[test]
fn language_table() {
    let mut bus = Bus::reset();
    let data = bus.control_in(get_descriptor(0x03, 0, 0xFF)).unwrap();
    assert_eq!(data, [4, 0x03, 0x09, 0x04]);
}

#[test]
fn report_descriptor_is_read_through_interface() {
    let mut bus = Bus::reset();
    let data = bus.control_in(request(0x81, 0x06, 0x2200, 0, 0xFF)).unwrap();
    assert_eq!(data.len(), 47);
    assert_eq!(data[..3], [0x06, 0xA0, 0xFF]);
    assert_eq!(data.last(), Some(&0xC0));

    // Same descriptor type aimed at the device is not a thing.
    assert_eq!(
        bus.control_in(get_descriptor(0x22, 0, 0xFF)),
        Err(Failure::Stall)
    );
}

#[test]
fn unknown_descriptor_stalls_then_recovers() {
    let mut bus = Bus::reset();
    // Full-speed only: no device qualifier.
    assert_eq!(
        bus.control_in(get_descriptor(0x06, 0, 10)),
        Err(Failure::Stall)
    );
    assert_eq!(bus.control_in(get_descriptor(0x03, 9, 0xFF)), Err(Failure::Stall));
    assert_eq!(bus.usb.stalls(), 2);
    // The next SETUP clears the protocol stall.
    assert_eq!(bus.control_in(get_descriptor(0x01, 0, 18)).unwrap(), DEVICE);
}

#[test]
fn address_applies_after_status_stage() {
    let mut bus = Bus::reset();
    bus.setup(set_address(7));
    // Status stage still has to happen at address 0.
    assert_eq!(bus.sie.address(), 0);
    assert_eq!(bus.usb.state(), DeviceState::Default);

    match bus.sie.host_in(0) {
        Handshake::Data(p) => assert!(p.as_slice().is_empty()),
        other => panic!("status stage: {:?}", other),
    }
    bus.step();
    assert_eq!(bus.sie.address(), 7);
    assert_eq!(bus.usb.address(), 7);
    assert_eq!(bus.usb.state(), DeviceState::Addressed);
}

#[test]
fn address_without_status_stage_is_dropped() {
    let mut bus = Bus::reset();
    bus.setup(set_address(7));
    // The host gives up and starts over.
    assert_eq!(bus.control_in(get_descriptor(0x01, 0, 18)).unwrap(), DEVICE);
    assert_eq!(bus.sie.address(), 0);
    assert_eq!(bus.usb.state(), DeviceState::Default);
}

#[test]
fn address_zero_returns_to_default() {
    let mut bus = Bus::reset();
    bus.control_out(set_address(3), &[]).unwrap();
    assert_eq!(bus.usb.state(), DeviceState::Addressed);
    bus.control_out(set_address(0), &[]).unwrap();
    assert_eq!(bus.usb.state(), DeviceState::Default);
    assert_eq!(bus.sie.address(), 0);
}

#[test]
fn out_of_range_address_stalls() {
    let mut bus = Bus::reset();
    assert_eq!(bus.control_out(set_address(128), &[]), Err(Failure::Stall));
    assert_eq!(bus.usb.state(), DeviceState::Default);
}

#[test]
fn configuration_needs_address() {
    let mut bus = Bus::reset();
    assert_eq!(bus.control_out(set_configuration(1), &[]), Err(Failure::Stall));
    assert_eq!(bus.usb.state(), DeviceState::Default);
    assert!(!bus.usb.is_ready());
}

#[test]
fn configure_and_deconfigure() {
    let mut bus = Bus::configured();
    assert_eq!(bus.usb.state(), DeviceState::Configured);
    assert!(bus.usb.is_ready());
    assert!(bus.sie.is_armed(0x01));
    assert_eq!(bus.control_in(get_configuration()).unwrap(), [1]);

    // Only configuration 1 exists.
    assert_eq!(bus.control_out(set_configuration(2), &[]), Err(Failure::Stall));
    assert_eq!(bus.usb.state(), DeviceState::Configured);

    bus.control_out(set_configuration(0), &[]).unwrap();
    assert_eq!(bus.usb.state(), DeviceState::Addressed);
    assert!(!bus.usb.is_ready());
    assert!(!bus.sie.is_armed(0x01));
    assert_eq!(bus.control_in(get_configuration()).unwrap(), [0]);
}

#[test]
fn address_is_fixed_once_configured() {
    let mut bus = Bus::configured();
    assert_eq!(bus.control_out(set_address(9), &[]), Err(Failure::Stall));
    assert_eq!(bus.usb.address(), 5);
}

#[test]
fn reset_from_configured_parks_report_endpoints() {
    let mut bus = Bus::configured();
    bus.usb.tx_report_mut()[0] = 0x80;
    bus.usb.send(&mut bus.sie, 0).unwrap();

    bus.bus_reset();
    assert_eq!(bus.usb.state(), DeviceState::Default);
    assert_eq!(bus.usb.address(), 0);
    assert_eq!(bus.sie.address(), 0);
    for address in [0x01, 0x81] {
        assert!(!bus.sie.is_armed(address));
        assert_eq!(bus.usb.endpoints().buffer(address).unwrap().owner, Owner::Sie);
    }
    assert!(bus.sie.is_armed(0x00));
    assert_eq!(bus.sie.host_in(1), Handshake::Nak);
    assert_eq!(bus.sie.host_out(1, &[0x81]), Handshake::Nak);
}

#[test]
fn setup_aborts_data_stage() {
    let mut bus = Bus::reset();
    bus.setup(get_descriptor(0x02, 0, 0xFF));
    assert!(matches!(bus.sie.host_in(0), Handshake::Data(_)));
    bus.step();

    // No status stage; a new request comes in instead.
    let data = bus.control_in(get_descriptor(0x01, 0, 18)).unwrap();
    assert_eq!(data, DEVICE);
}

#[test]
fn host_may_end_data_stage_early() {
    let mut bus = Bus::reset();
    bus.setup(get_descriptor(0x02, 0, 41));
    assert!(matches!(bus.sie.host_in(0), Handshake::Data(_)));
    bus.step();
    assert_eq!(bus.sie.host_out(0, &[]), Handshake::Ack);
    bus.step();
    assert_eq!(bus.usb.stalls(), 0);
    assert_eq!(bus.control_in(get_descriptor(0x01, 0, 18)).unwrap(), DEVICE);
}

#[test]
fn device_status() {
    let mut bus = Bus::reset();
    // Bus powered, remote wakeup off.
    assert_eq!(bus.control_in(request(0x80, 0x00, 0, 0, 2)).unwrap(), [0, 0]);
    bus.control_out(request(0x00, 0x03, 1, 0, 0), &[]).unwrap();
    assert_eq!(bus.control_in(request(0x80, 0x00, 0, 0, 2)).unwrap(), [2, 0]);
}

#[test]
fn endpoint_halt() {
    let mut bus = Bus::configured();
    bus.control_out(request(0x02, 0x03, 0, 0x81, 0), &[]).unwrap();
    assert_eq!(bus.control_in(request(0x82, 0x00, 0, 0x81, 2)).unwrap(), [1, 0]);
    assert_eq!(bus.sie.host_in(1), Handshake::Stall);

    bus.control_out(request(0x02, 0x01, 0, 0x81, 0), &[]).unwrap();
    assert_eq!(bus.control_in(request(0x82, 0x00, 0, 0x81, 2)).unwrap(), [0, 0]);
    assert_eq!(bus.sie.host_in(1), Handshake::Nak);
}

#[test]
fn unsupported_requests_stall() {
    let mut bus = Bus::configured();
    // SET_DESCRIPTOR, SYNCH_FRAME, a vendor request.
    assert_eq!(bus.control_out(request(0x00, 0x07, 0x0100, 0, 0), &[]), Err(Failure::Stall));
    assert_eq!(bus.control_in(request(0x82, 0x0C, 0, 0x81, 2)), Err(Failure::Stall));
    assert_eq!(bus.control_in(request(0xC0, 0x01, 0, 0, 4)), Err(Failure::Stall));
    assert_eq!(bus.usb.stalls(), 3);
    assert_eq!(bus.usb.state(), DeviceState::Configured);
}

#[test]
fn zero_length_read_skips_data_stage() {
    let mut bus = Bus::reset();
    assert!(bus.control_in(get_descriptor(0x01, 0, 0)).unwrap().is_empty());
    assert!(bus.last_packets.is_empty());
    assert_eq!(bus.usb.control_stage(), ControlStage::Idle);
    // EP0 is back to waiting for the next SETUP, not for an OUT status.
    assert_eq!(bus.control_in(get_descriptor(0x01, 0, 18)).unwrap(), DEVICE);
    assert_eq!(bus.usb.stalls(), 0);
}

fn descriptor_request() -> impl Strategy<Value = [u8; 8]> {
    prop_oneof![
        Just(get_descriptor(0x01, 0, 0)),
        Just(get_descriptor(0x02, 0, 0)),
        Just(get_descriptor(0x03, 1, 0)),
        Just(get_descriptor(0x03, 2, 0)),
        Just(request(0x81, 0x06, 0x2200, 0, 0)),
    ]
}

proptest! {
    #[test]
    fn data_stage_is_chunked(template in descriptor_request(), length in 0u16..=300) {
        let mut bus = Bus::reset();
        let mut whole_request = template;
        whole_request[6..].copy_from_slice(&0xFFFFu16.to_le_bytes());
        let whole = bus.control_in(whole_request).unwrap();

        let mut packet = template;
        packet[6..].copy_from_slice(&length.to_le_bytes());
        let data = bus.control_in(packet).unwrap();

        let expected = whole.len().min(usize::from(length));
        prop_assert_eq!(&data[..], &whole[..expected]);
        prop_assert_eq!(bus.usb.stalls(), 0);
        prop_assert_eq!(bus.usb.control_stage(), ControlStage::Idle);
        if length == 0 {
            prop_assert!(bus.last_packets.is_empty());
            return Ok(());
        }
        let (last, full) = bus.last_packets.split_last().unwrap();
        prop_assert!(full.iter().all(|p| p.len() == EP0_SIZE));
        prop_assert!(last.len() <= EP0_SIZE);
        // A short transfer always ends on a short packet.
        if expected < usize::from(length) {
            prop_assert!(last.len() < EP0_SIZE);
        }
        prop_assert_eq!(bus.usb.stalls(), 0);
    }
}
