// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end universe merge scenarios: store, patcher, ports and clients
//! working together.

use luxd::clock::Clock;
use luxd::dmx::DmxBuffer;
use luxd::prefs::{FilePreferences, MemoryPreferences, Preferences};
use luxd::registry::{
    port_unique_id, Device, InputPort, PortDirection, PortPatcher, PriorityCapability,
};
use luxd::universe::{MergeMode, UniverseStore};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

fn store_with_clock(clock: Clock) -> Rc<RefCell<UniverseStore>> {
    let prefs = Rc::new(RefCell::new(MemoryPreferences::new("server")));
    Rc::new(RefCell::new(UniverseStore::new(Some(prefs), clock)))
}

fn multi_input_device(count: u32) -> Device {
    let mut device = Device::new(1, "merge-rig", "Merge Test Rig");
    device.set_allow_multi_port_patching(true);
    let uid = device.unique_id();
    for index in 0..count {
        device.add_input_port(InputPort::new(
            &port_unique_id(&uid, PortDirection::Input, index),
            index,
            PriorityCapability::Full,
        ));
    }
    device
}

#[test]
fn htp_merge_of_two_ports() {
    let (clock, _time) = Clock::mock();
    let store = store_with_clock(clock.clone());
    let patcher = PortPatcher::new(store.clone());
    let device = multi_input_device(2);
    let port_a = device.input_ports()[0].clone();
    let port_b = device.input_ports()[1].clone();

    assert!(patcher.patch_input_port(&device, &port_a, 1));
    assert!(patcher.patch_input_port(&device, &port_b, 1));

    let universe = store.borrow().get_universe(1).unwrap();
    universe.borrow_mut().set_merge_mode(MergeMode::Htp);

    port_a
        .borrow_mut()
        .write_dmx(&DmxBuffer::from_slice(&[10, 0, 0]), 100, clock.now());
    universe
        .borrow_mut()
        .port_data_changed(port_a.borrow().unique_id());
    port_b
        .borrow_mut()
        .write_dmx(&DmxBuffer::from_slice(&[0, 20, 30]), 100, clock.now());
    universe
        .borrow_mut()
        .port_data_changed(port_b.borrow().unique_id());

    let universe = universe.borrow();
    assert_eq!(universe.get_dmx().as_slice(), &[10, 20, 30]);
    assert_eq!(universe.active_priority(), 100);
}

#[test]
fn ltp_latest_wins() {
    let (clock, time) = Clock::mock();
    let store = store_with_clock(clock.clone());
    let patcher = PortPatcher::new(store.clone());
    let device = multi_input_device(2);
    let port_a = device.input_ports()[0].clone();
    let port_b = device.input_ports()[1].clone();

    patcher.patch_input_port(&device, &port_a, 2);
    patcher.patch_input_port(&device, &port_b, 2);
    let universe = store.borrow().get_universe(2).unwrap();
    assert_eq!(universe.borrow().merge_mode(), MergeMode::Ltp);

    port_a
        .borrow_mut()
        .write_dmx(&DmxBuffer::from_slice(&[1, 2, 3]), 100, clock.now());
    universe
        .borrow_mut()
        .port_data_changed(port_a.borrow().unique_id());

    time.advance(Duration::from_millis(5));
    port_b
        .borrow_mut()
        .write_dmx(&DmxBuffer::from_slice(&[4, 5, 6]), 100, clock.now());
    universe
        .borrow_mut()
        .port_data_changed(port_b.borrow().unique_id());
    assert_eq!(universe.borrow().get_dmx().as_slice(), &[4, 5, 6]);

    time.advance(Duration::from_millis(5));
    port_a
        .borrow_mut()
        .write_dmx(&DmxBuffer::from_slice(&[7, 7, 7]), 100, clock.now());
    universe
        .borrow_mut()
        .port_data_changed(port_a.borrow().unique_id());
    assert_eq!(universe.borrow().get_dmx().as_slice(), &[7, 7, 7]);
}

#[test]
fn priority_preemption_and_expiry() {
    let (clock, time) = Clock::mock();
    let store = store_with_clock(clock.clone());
    let patcher = PortPatcher::new(store.clone());
    let device = multi_input_device(1);
    let port = device.input_ports()[0].clone();

    patcher.patch_input_port(&device, &port, 3);
    let universe = store.borrow().get_universe(3).unwrap();

    // steady source X at the default priority
    port.borrow_mut()
        .write_dmx(&DmxBuffer::from_slice(&[1, 1, 1]), 100, clock.now());
    universe
        .borrow_mut()
        .port_data_changed(port.borrow().unique_id());
    assert_eq!(universe.borrow().active_priority(), 100);

    // source Y preempts at 150
    universe
        .borrow_mut()
        .source_client_data_changed(42, &DmxBuffer::from_slice(&[9, 9, 9]), 150, 0);
    {
        let universe = universe.borrow();
        assert_eq!(universe.get_dmx().as_slice(), &[9, 9, 9]);
        assert_eq!(universe.active_priority(), 150);
    }

    // Y stops sending for 3 seconds and expires
    time.advance(Duration::from_millis(3000));
    store.borrow_mut().clean_stale_sources();
    let universe = universe.borrow();
    assert_eq!(universe.get_dmx().as_slice(), &[1, 1, 1]);
    assert_eq!(universe.active_priority(), 100);
}

#[test]
fn universe_name_round_trips_through_files() {
    let dir = tempfile::tempdir().unwrap();

    {
        let mut prefs = FilePreferences::new(dir.path(), "server");
        prefs.load().unwrap();
        let prefs = Rc::new(RefCell::new(prefs));
        let mut store = UniverseStore::new(Some(prefs.clone()), Clock::system());
        store
            .get_universe_or_create(9)
            .borrow_mut()
            .set_name("Back Wall");
        store
            .get_universe_or_create(9)
            .borrow_mut()
            .set_merge_mode(MergeMode::Htp);
        store.delete_all();
        prefs.borrow().save().unwrap();
    }

    let mut prefs = FilePreferences::new(dir.path(), "server");
    prefs.load().unwrap();
    let mut store = UniverseStore::new(Some(Rc::new(RefCell::new(prefs))), Clock::system());
    let universe = store.get_universe_or_create(9);
    assert_eq!(universe.borrow().name(), "Back Wall");
    assert_eq!(universe.borrow().merge_mode(), MergeMode::Htp);
}

#[test]
fn output_port_sees_merged_frames_and_priority() {
    let (clock, _time) = Clock::mock();
    let store = store_with_clock(clock.clone());
    let patcher = PortPatcher::new(store.clone());

    let mut device = Device::new(2, "out-rig", "Output Rig");
    device.set_allow_looping(true);
    let uid = device.unique_id();
    let input = device.add_input_port(InputPort::new(
        &port_unique_id(&uid, PortDirection::Input, 0),
        0,
        PriorityCapability::Full,
    ));
    let written: Rc<RefCell<Vec<(Vec<u8>, u8)>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = written.clone();
    let output = device.add_output_port(luxd::registry::OutputPort::new(
        &port_unique_id(&uid, PortDirection::Output, 0),
        0,
        PriorityCapability::Full,
        Box::new(move |buffer: &DmxBuffer, priority: u8| {
            sink.borrow_mut().push((buffer.as_slice().to_vec(), priority));
            true
        }),
    ));

    assert!(patcher.patch_input_port(&device, &input, 5));
    assert!(patcher.patch_output_port(&device, &output, 5));

    let universe = store.borrow().get_universe(5).unwrap();
    input
        .borrow_mut()
        .write_dmx(&DmxBuffer::from_slice(&[40, 50]), 120, clock.now());
    universe
        .borrow_mut()
        .port_data_changed(input.borrow().unique_id());

    let written = written.borrow();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].0, vec![40, 50]);
    // the universe exposes its active priority with the frame
    assert_eq!(written[0].1, 120);
}
