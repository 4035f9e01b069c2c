// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery pipeline handoff: a fake Goddard DMXter answers the Usb Pro
//! probe over a socket pair and must reach the observer exactly once, on
//! the main loop, classified as a Dmxter.

use luxd::runtime::SelectServer;
use luxd::widget::frame::{self, FrameDecoder};
use luxd::widget::{
    NewWidgetHandler, Widget, WidgetDetectorOptions, WidgetDetectorThread, WidgetInformation,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

struct RecordingObserver {
    seen: Arc<Mutex<Vec<(Widget, WidgetInformation)>>>,
}

impl NewWidgetHandler for RecordingObserver {
    fn new_widget(&self, widget: Widget, information: WidgetInformation) {
        self.seen.lock().push((widget, information));
    }
}

/// Pretends to be a Goddard DMXter on the far end of the socket pair.
/// Returns the number of queries answered.
fn run_fake_dmxter(mut stream: UnixStream) -> usize {
    let mut decoder = FrameDecoder::new();
    let mut queries = 0usize;
    let mut buffer = [0u8; 256];
    loop {
        let n = match stream.read(&mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let mut replies: Vec<Vec<u8>> = Vec::new();
        decoder.feed(&buffer[..n], |label, _body| {
            let reply = match label {
                frame::MANUFACTURER_LABEL => {
                    let mut body = 0x4744u16.to_le_bytes().to_vec();
                    body.extend_from_slice(b"Goddard Design");
                    Some(frame::encode_message(frame::MANUFACTURER_LABEL, &body))
                }
                frame::DEVICE_LABEL => {
                    let mut body = 0x444du16.to_le_bytes().to_vec();
                    body.extend_from_slice(b"DMXter4");
                    Some(frame::encode_message(frame::DEVICE_LABEL, &body))
                }
                frame::SERIAL_LABEL => Some(frame::encode_message(
                    frame::SERIAL_LABEL,
                    &0x12345678u32.to_le_bytes(),
                )),
                _ => None,
            };
            if let Some(reply) = reply {
                queries += 1;
                replies.push(reply);
            }
        });
        for reply in replies {
            if stream.write_all(&reply).is_err() {
                return queries;
            }
        }
    }
    queries
}

#[test]
fn dmxter_handoff_happens_exactly_once() {
    let device_dir = tempfile::tempdir().unwrap();
    let lock_dir = tempfile::tempdir().unwrap();

    let mut server = SelectServer::new().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observer = Arc::new(RecordingObserver { seen: seen.clone() });

    let options = WidgetDetectorOptions {
        directory: device_dir.path().to_path_buf(),
        prefixes: vec!["ttyUSB".to_string()],
        ignored_paths: HashSet::new(),
        lock_dir: lock_dir.path().to_path_buf(),
        probe_timeout: Duration::from_millis(100),
        scan_interval: Duration::from_millis(20),
    };
    let thread =
        WidgetDetectorThread::start(observer, server.remote_handle(), options).unwrap();
    thread.wait_until_running();

    // hand the thread one end of a socket pair; a fake DMXter answers on
    // the other
    let (local, remote) = UnixStream::pair().unwrap();
    local.set_nonblocking(true).unwrap();
    let responder = std::thread::spawn(move || run_fake_dmxter(remote));
    thread.probe_descriptor(PathBuf::from("/mock_widget"), local.into());

    // run the main loop until the observer reports, or give up
    let handle = server.handle();
    let watcher = seen.clone();
    let stop = handle.clone();
    handle.add_repeating_timeout(Duration::from_millis(10), move || {
        if watcher.lock().is_empty() {
            true
        } else {
            stop.terminate();
            false
        }
    });
    let safety = handle.clone();
    handle.add_timeout(Duration::from_secs(5), move || safety.terminate());
    server.run().unwrap();

    // exactly one widget, classified as a Dmxter, with the probed identity
    let (widget, information) = {
        let mut seen = seen.lock();
        assert_eq!(seen.len(), 1, "observer must see exactly one widget");
        seen.pop().unwrap()
    };
    assert_eq!(widget.variant_name(), "Dmxter");
    assert_eq!(widget.path(), std::path::Path::new("/mock_widget"));
    let WidgetInformation::UsbPro(info) = &information else {
        panic!("expected a Usb Pro information record");
    };
    assert_eq!(info.esta_id, 0x4744);
    assert_eq!(info.device_id, 0x444d);
    assert_eq!(info.serial, 0x12345678);

    // release the widget; the responder sees the close and exits
    thread.free_widget(widget);
    thread.join();
    let queries = responder.join().unwrap();
    // manufacturer, device, serial; no Robe probe was attempted
    assert_eq!(queries, 3);
}

#[test]
fn silent_device_is_freed_without_handoff() {
    let device_dir = tempfile::tempdir().unwrap();
    let lock_dir = tempfile::tempdir().unwrap();

    let server = SelectServer::new().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observer = Arc::new(RecordingObserver { seen: seen.clone() });

    let options = WidgetDetectorOptions {
        directory: device_dir.path().to_path_buf(),
        prefixes: vec!["ttyUSB".to_string()],
        ignored_paths: HashSet::new(),
        lock_dir: lock_dir.path().to_path_buf(),
        probe_timeout: Duration::from_millis(20),
        scan_interval: Duration::from_millis(20),
    };
    let thread =
        WidgetDetectorThread::start(observer, server.remote_handle(), options).unwrap();
    thread.wait_until_running();

    let (local, remote) = UnixStream::pair().unwrap();
    local.set_nonblocking(true).unwrap();
    thread.probe_descriptor(PathBuf::from("/mock_silent"), local.into());

    // both detectors time out; the descriptor is closed, which the far end
    // observes as EOF
    let mut remote_reader = remote;
    let mut sink = Vec::new();
    remote_reader
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let result = remote_reader.read_to_end(&mut sink);
    assert!(result.is_ok(), "expected EOF after the probes gave up");
    assert!(seen.lock().is_empty());

    thread.join();
}
