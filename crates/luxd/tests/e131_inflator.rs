// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire-level E1.31 receive scenarios: packets in, universe merges out.

use luxd::clock::Clock;
use luxd::counters::CounterMap;
use luxd::dmx::DmxBuffer;
use luxd::e131::header::{build_dmx_packet, STREAM_TERMINATED_MASK};
use luxd::e131::{Cid, DmpE131Inflator};
use luxd::registry::{port_unique_id, Device, InputPort, PortDirection, PriorityCapability};
use luxd::universe::UniverseStore;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

fn cid(tag: u8) -> Cid {
    Cid::from_bytes(&[tag; 16]).unwrap()
}

#[test]
fn sequence_skew_filtering() {
    let (clock, _time) = Clock::mock();
    let counters = CounterMap::new();
    let mut inflator = DmpE131Inflator::new(true, clock, &counters);

    let seen: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    inflator.set_handler(
        7,
        Box::new(move |buffer: &DmxBuffer, _priority: u8| {
            sink.borrow_mut().push(buffer.as_slice().to_vec());
        }),
    );

    let source = cid(1);
    inflator.handle_packet(&build_dmx_packet(&source, "src", 7, 100, 100, 0, 0, &[1]));
    assert_eq!(seen.borrow().len(), 1);

    // (85 - 100) as i8 = -15, in (-20, 0]: old duplicate, dropped
    inflator.handle_packet(&build_dmx_packet(&source, "src", 7, 85, 100, 0, 0, &[2]));
    assert_eq!(seen.borrow().len(), 1);

    // one ahead: accepted
    inflator.handle_packet(&build_dmx_packet(&source, "src", 7, 101, 100, 0, 0, &[3]));
    assert_eq!(seen.borrow().len(), 2);

    // (81 - 101) as i8 = -20: outside the window, treated as a restart
    inflator.handle_packet(&build_dmx_packet(&source, "src", 7, 81, 100, 0, 0, &[4]));
    assert_eq!(seen.borrow().len(), 3);
    assert_eq!(seen.borrow()[2], vec![4]);
}

#[test]
fn network_source_drives_a_universe() {
    let (clock, _time) = Clock::mock();
    let counters = CounterMap::new();
    let mut inflator = DmpE131Inflator::new(true, clock.clone(), &counters);

    // wire an input port to universe 10 and bridge the inflator into it
    let store = Rc::new(RefCell::new(UniverseStore::new(None, clock.clone())));
    let patcher = luxd::registry::PortPatcher::new(store.clone());
    let mut device = Device::new(11, "sacn", "sACN Input");
    let uid = device.unique_id();
    let port = device.add_input_port(InputPort::new(
        &port_unique_id(&uid, PortDirection::Input, 0),
        0,
        PriorityCapability::Full,
    ));
    assert!(patcher.patch_input_port(&device, &port, 10));
    let universe = store.borrow().get_universe(10).unwrap();

    {
        let port = port.clone();
        let universe = universe.clone();
        let clock = clock.clone();
        inflator.set_handler(
            10,
            Box::new(move |buffer: &DmxBuffer, priority: u8| {
                let unique_id = {
                    let mut port = port.borrow_mut();
                    port.write_dmx(buffer, priority, clock.now());
                    port.unique_id().to_string()
                };
                universe.borrow_mut().port_data_changed(&unique_id);
            }),
        );
    }

    inflator.handle_packet(&build_dmx_packet(
        &cid(5),
        "console",
        10,
        0,
        150,
        0,
        0,
        &[20, 40, 60],
    ));

    let universe = universe.borrow();
    assert_eq!(universe.get_dmx().as_slice(), &[20, 40, 60]);
    // the network priority flows through the inherit-mode port
    assert_eq!(universe.active_priority(), 150);
}

#[test]
fn terminated_stream_releases_the_universe() {
    let (clock, _time) = Clock::mock();
    let counters = CounterMap::new();
    let mut inflator = DmpE131Inflator::new(true, clock, &counters);

    let seen: Rc<RefCell<Vec<(Vec<u8>, u8)>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    inflator.set_handler(
        2,
        Box::new(move |buffer: &DmxBuffer, priority: u8| {
            sink.borrow_mut().push((buffer.as_slice().to_vec(), priority));
        }),
    );

    inflator.handle_packet(&build_dmx_packet(&cid(1), "a", 2, 0, 120, 0, 0, &[5]));
    inflator.handle_packet(&build_dmx_packet(&cid(2), "b", 2, 0, 120, 0, 0, &[7]));
    assert_eq!(inflator.active_priority(2), Some(120));

    // source a terminates; b remains alone
    inflator.handle_packet(&build_dmx_packet(
        &cid(1),
        "a",
        2,
        1,
        120,
        STREAM_TERMINATED_MASK,
        0,
        &[5],
    ));
    let seen = seen.borrow();
    assert_eq!(seen.last().unwrap().0, vec![7]);
}

#[test]
fn expiry_is_time_driven() {
    let (clock, time) = Clock::mock();
    let counters = CounterMap::new();
    let mut inflator = DmpE131Inflator::new(true, clock, &counters);

    let seen: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    inflator.set_handler(
        1,
        Box::new(move |buffer: &DmxBuffer, _| {
            sink.borrow_mut().push(buffer.as_slice().to_vec());
        }),
    );

    inflator.handle_packet(&build_dmx_packet(&cid(1), "a", 1, 0, 100, 0, 0, &[3, 0]));
    inflator.handle_packet(&build_dmx_packet(&cid(2), "b", 1, 0, 100, 0, 0, &[0, 4]));
    assert_eq!(seen.borrow().last().unwrap(), &vec![3, 4]);

    // source a is silent past expiry; the next frame from b drops it
    time.advance(Duration::from_millis(2600));
    inflator.handle_packet(&build_dmx_packet(&cid(2), "b", 1, 1, 100, 0, 0, &[0, 4]));
    assert_eq!(seen.borrow().last().unwrap(), &vec![0, 4]);
}

#[test]
fn random_frames_track_the_latest_data() {
    let (clock, _time) = Clock::mock();
    let counters = CounterMap::new();
    let mut inflator = DmpE131Inflator::new(true, clock, &counters);

    let seen: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    inflator.set_handler(
        4,
        Box::new(move |buffer: &DmxBuffer, _| {
            sink.borrow_mut().push(buffer.as_slice().to_vec());
        }),
    );

    let source = cid(9);
    let mut last = Vec::new();
    for sequence in 0..50u8 {
        let slots: Vec<u8> = (0..64).map(|_| fastrand::u8(..)).collect();
        inflator.handle_packet(&build_dmx_packet(
            &source, "fuzz", 4, sequence, 100, 0, 0, &slots,
        ));
        last = slots;
    }

    let seen = seen.borrow();
    assert_eq!(seen.len(), 50);
    assert_eq!(seen.last().unwrap(), &last);
}

#[test]
fn rdm_frames_reach_the_rdm_handler_not_the_merge() {
    use luxd::e131::rdm::E133RdmInflator;

    let (clock, _time) = Clock::mock();
    let counters = CounterMap::new();
    let mut inflator = DmpE131Inflator::new(true, clock, &counters);

    let dmx_frames: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let dmx_sink = dmx_frames.clone();
    inflator.set_handler(
        6,
        Box::new(move |buffer: &DmxBuffer, _| {
            dmx_sink.borrow_mut().push(buffer.as_slice().to_vec());
        }),
    );

    let rdm_frames: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let rdm_sink = rdm_frames.clone();
    let rdm_inflator = Rc::new(RefCell::new(E133RdmInflator::new()));
    rdm_inflator.borrow_mut().set_handler(
        6,
        Box::new(move |_: &Cid, frame: &[u8]| {
            rdm_sink.borrow_mut().push(frame.to_vec());
        }),
    );
    inflator.set_rdm_inflator(rdm_inflator);

    // an RDM response frame and a DMX frame on the same universe
    inflator.handle_packet(&build_dmx_packet(
        &cid(3),
        "responder",
        6,
        0,
        100,
        0,
        0xcc,
        &[0x01, 0x02, 0x0a],
    ));
    inflator.handle_packet(&build_dmx_packet(&cid(3), "console", 6, 1, 100, 0, 0, &[7, 8]));

    assert_eq!(*rdm_frames.borrow(), vec![vec![0x01, 0x02, 0x0a]]);
    assert_eq!(*dmx_frames.borrow(), vec![vec![7, 8]]);
}

#[test]
fn malformed_packets_bump_the_counter() {
    let (clock, _time) = Clock::mock();
    let counters = CounterMap::new();
    let mut inflator = DmpE131Inflator::new(true, clock, &counters);
    inflator.set_handler(1, Box::new(|_: &DmxBuffer, _| {}));

    let mut packet = build_dmx_packet(&cid(1), "x", 1, 0, 100, 0, 0, &[1]);
    packet[4] = b'Z'; // corrupt the ACN packet id
    inflator.handle_packet(&packet);

    let dropped = counters.counter("e131.dropped_frames");
    assert_eq!(dropped.get(), 1);
}
