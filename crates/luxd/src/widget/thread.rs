// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The widget detector thread.
//!
//! A dedicated thread owns the discovery loop `D` and every descriptor
//! currently being probed. It scans the device directory on a timer,
//! locks and opens new candidates, walks each one through the detector
//! list, and hands classified widgets to the observer on the caller's
//! loop `M` - each widget exactly once.
//!
//! # Invariants
//!
//! - a path appears at most once in the active set
//! - a descriptor's detector index only moves forward; no detector is
//!   retried on the same descriptor
//! - a widget reaches the observer only after its probe succeeded and the
//!   descriptor is no longer watched by `D`

use super::detector::{ProbeVerdict, UsbProWidgetDetector, WidgetDetector};
use super::robe::RobeWidgetDetector;
use super::serial::{self, SerialDescriptor};
use super::widgets::{classify_usb_pro, RobeWidget, Widget};
use super::{NewWidgetHandler, WidgetInformation};
use crate::runtime::{LoopHandle, RemoteHandle, SelectServer};
use crossbeam::channel::bounded;
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::fs;
use std::os::fd::OwnedFd;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// How a detector thread is configured.
#[derive(Debug, Clone)]
pub struct WidgetDetectorOptions {
    /// Directory to scan for serial devices.
    pub directory: PathBuf,
    /// Filename prefixes worth probing, e.g. `ttyUSB`.
    pub prefixes: Vec<String>,
    /// Full paths never to touch.
    pub ignored_paths: HashSet<PathBuf>,
    /// Where UUCP lock files live.
    pub lock_dir: PathBuf,
    /// Per-detector-stage timeout.
    pub probe_timeout: Duration,
    /// Directory scan interval.
    pub scan_interval: Duration,
}

impl Default for WidgetDetectorOptions {
    fn default() -> Self {
        WidgetDetectorOptions {
            directory: PathBuf::from("/dev"),
            prefixes: vec!["ttyUSB".to_string()],
            ignored_paths: HashSet::new(),
            lock_dir: PathBuf::from("/var/lock"),
            probe_timeout: Duration::from_millis(200),
            scan_interval: Duration::from_secs(20),
        }
    }
}

struct Probe {
    path: PathBuf,
    descriptor: SerialDescriptor,
    /// -1 before the first detector runs; strictly monotonic afterwards.
    detector_index: isize,
    timeout_generation: u64,
    /// Whether we hold the UUCP lock for this path.
    locked: bool,
}

type InjectedQueue = Arc<Mutex<Vec<(PathBuf, OwnedFd)>>>;
type ActivePaths = Arc<Mutex<HashSet<PathBuf>>>;

struct ThreadCore {
    handle: LoopHandle,
    main: RemoteHandle,
    observer: Arc<dyn NewWidgetHandler>,
    options: WidgetDetectorOptions,
    detectors: Vec<Box<dyn WidgetDetector>>,
    probes: HashMap<RawFd, Probe>,
    active_paths: ActivePaths,
    injected: InjectedQueue,
    next_generation: u64,
}

impl ThreadCore {
    fn new(
        handle: LoopHandle,
        main: RemoteHandle,
        observer: Arc<dyn NewWidgetHandler>,
        options: WidgetDetectorOptions,
        active_paths: ActivePaths,
        injected: InjectedQueue,
    ) -> Self {
        ThreadCore {
            handle,
            main,
            observer,
            options,
            detectors: vec![
                Box::new(UsbProWidgetDetector::new()),
                Box::new(RobeWidgetDetector::new()),
            ],
            probes: HashMap::new(),
            active_paths,
            injected,
            next_generation: 0,
        }
    }

    /// One scan pass: pick up injected descriptors, then walk the device
    /// directory for new candidates.
    fn scan(core: &Rc<RefCell<Self>>) {
        let mut started: Vec<RawFd> = Vec::new();
        {
            let mut guard = core.borrow_mut();
            let c = &mut *guard;

            let injected: Vec<(PathBuf, OwnedFd)> = c.injected.lock().drain(..).collect();
            for (path, fd) in injected {
                if !c.active_paths.lock().insert(path.clone()) {
                    continue;
                }
                let descriptor = SerialDescriptor::from_fd(fd, &path);
                let fd = descriptor.raw_fd();
                c.probes.insert(
                    fd,
                    Probe {
                        path,
                        descriptor,
                        detector_index: -1,
                        timeout_generation: 0,
                        locked: false,
                    },
                );
                started.push(fd);
            }

            let entries = match fs::read_dir(&c.options.directory) {
                Ok(entries) => Some(entries),
                Err(e) => {
                    // retry on the next pass
                    log::info!(
                        "[DETECT] can't scan {}: {}",
                        c.options.directory.display(),
                        e
                    );
                    None
                }
            };
            for entry in entries.into_iter().flatten().flatten() {
                let path = entry.path();
                let Some(name) = path.file_name().and_then(OsStr::to_str) else {
                    continue;
                };
                if !c.options.prefixes.iter().any(|prefix| name.starts_with(prefix)) {
                    continue;
                }
                // FreeBSD leaves .init and .lock entries next to devices
                if name.ends_with(".init") || name.ends_with(".lock") {
                    continue;
                }
                if c.options.ignored_paths.contains(&path)
                    || c.active_paths.lock().contains(&path)
                {
                    continue;
                }

                if serial::acquire_uucp_lock(&c.options.lock_dir, &path).is_err() {
                    continue;
                }
                let descriptor = match SerialDescriptor::open(&path) {
                    Ok(descriptor) => descriptor,
                    Err(_) => {
                        serial::release_uucp_lock(&c.options.lock_dir, &path);
                        continue;
                    }
                };
                log::info!("[DETECT] found potential usb serial device at {}", path.display());

                c.active_paths.lock().insert(path.clone());
                let fd = descriptor.raw_fd();
                c.probes.insert(
                    fd,
                    Probe {
                        path,
                        descriptor,
                        detector_index: -1,
                        timeout_generation: 0,
                        locked: true,
                    },
                );
                started.push(fd);
            }
        }

        for fd in started {
            Self::advance(core, fd);
        }
    }

    /// Move a descriptor to the next detector, or free it when the list is
    /// exhausted.
    fn advance(core: &Rc<RefCell<Self>>, fd: RawFd) {
        enum Outcome {
            Missing,
            Exhausted,
            BeginFailed,
            Started,
        }
        let outcome = {
            let mut guard = core.borrow_mut();
            let c = &mut *guard;
            match c.probes.get_mut(&fd) {
                None => Outcome::Missing,
                Some(probe) => {
                    probe.detector_index += 1;
                    let index = probe.detector_index as usize;
                    if index >= c.detectors.len() {
                        log::info!(
                            "[DETECT] no more detectors to try for {}",
                            probe.path.display()
                        );
                        Outcome::Exhausted
                    } else {
                        if index == 0 {
                            let read_core = core.clone();
                            c.handle.add_read_descriptor(fd, move || {
                                Self::descriptor_ready(&read_core, fd);
                            });
                        }
                        log::info!(
                            "[DETECT] trying stage {} ({}) for {}",
                            index,
                            c.detectors[index].protocol(),
                            probe.path.display()
                        );
                        if c.detectors[index].begin(fd, &mut probe.descriptor) {
                            Outcome::Started
                        } else {
                            Outcome::BeginFailed
                        }
                    }
                }
            }
        };
        match outcome {
            Outcome::Missing => {}
            Outcome::Exhausted | Outcome::BeginFailed => Self::free(core, fd),
            Outcome::Started => Self::arm_timeout(core, fd),
        }
    }

    /// (Re)arm the stage timeout; earlier timeouts for this probe become
    /// stale through the generation counter.
    fn arm_timeout(core: &Rc<RefCell<Self>>, fd: RawFd) {
        let armed = {
            let mut guard = core.borrow_mut();
            let c = &mut *guard;
            match c.probes.get_mut(&fd) {
                Some(probe) => {
                    c.next_generation += 1;
                    probe.timeout_generation = c.next_generation;
                    Some((c.next_generation, c.options.probe_timeout, c.handle.clone()))
                }
                None => None,
            }
        };
        if let Some((generation, timeout, handle)) = armed {
            let timeout_core = core.clone();
            handle.add_timeout(timeout, move || {
                Self::probe_timeout(&timeout_core, fd, generation);
            });
        }
    }

    fn descriptor_ready(core: &Rc<RefCell<Self>>, fd: RawFd) {
        let mut data = Vec::new();
        let mut closed = false;
        {
            let mut guard = core.borrow_mut();
            let c = &mut *guard;
            let Some(probe) = c.probes.get_mut(&fd) else { return };
            let mut buffer = [0u8; 512];
            loop {
                match probe.descriptor.read(&mut buffer) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(n) => data.extend_from_slice(&buffer[..n]),
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::info!(
                            "[DETECT] read error on {}: {}",
                            probe.path.display(),
                            e
                        );
                        closed = true;
                        break;
                    }
                }
            }
        }

        if closed {
            log::info!("[DETECT] descriptor {} closed during probe", fd);
            Self::free(core, fd);
            return;
        }
        if data.is_empty() {
            return;
        }

        let verdict = {
            let mut guard = core.borrow_mut();
            let c = &mut *guard;
            let Some(probe) = c.probes.get_mut(&fd) else { return };
            if probe.detector_index < 0 {
                return;
            }
            let index = probe.detector_index as usize;
            c.detectors[index].feed(fd, &mut probe.descriptor, &data)
        };
        Self::apply_verdict(core, fd, verdict);
    }

    fn probe_timeout(core: &Rc<RefCell<Self>>, fd: RawFd, generation: u64) {
        let verdict = {
            let mut guard = core.borrow_mut();
            let c = &mut *guard;
            let Some(probe) = c.probes.get_mut(&fd) else { return };
            if probe.timeout_generation != generation {
                return; // superseded by later activity
            }
            let index = probe.detector_index as usize;
            c.detectors[index].on_timeout(fd, &mut probe.descriptor)
        };
        Self::apply_verdict(core, fd, verdict);
    }

    fn apply_verdict(core: &Rc<RefCell<Self>>, fd: RawFd, verdict: ProbeVerdict) {
        match verdict {
            ProbeVerdict::Pending => Self::arm_timeout(core, fd),
            ProbeVerdict::Rejected => {
                {
                    let mut guard = core.borrow_mut();
                    let c = &mut *guard;
                    if let Some(probe) = c.probes.get_mut(&fd) {
                        if probe.detector_index >= 0 {
                            let index = probe.detector_index as usize;
                            c.detectors[index].abandon(fd);
                        }
                    }
                }
                Self::advance(core, fd);
            }
            ProbeVerdict::Recognized(information) => Self::dispatch(core, fd, information),
        }
    }

    /// Build the concrete widget and hand it to the observer on loop `M`.
    fn dispatch(core: &Rc<RefCell<Self>>, fd: RawFd, information: WidgetInformation) {
        let (probe, observer, main, handle) = {
            let mut guard = core.borrow_mut();
            let c = &mut *guard;
            let Some(probe) = c.probes.remove(&fd) else { return };
            let index = probe.detector_index as usize;
            c.detectors[index].abandon(fd);
            (probe, c.observer.clone(), c.main.clone(), c.handle.clone())
        };
        // Stop watching before the descriptor crosses to M. A late
        // readiness event for this fd finds no probe and is a no-op.
        handle.remove_read_descriptor(fd);

        let widget = match &information {
            WidgetInformation::UsbPro(info) => classify_usb_pro(probe.descriptor, info),
            WidgetInformation::Robe(info) => {
                Widget::Robe(RobeWidget::new(probe.descriptor, info.uid))
            }
        };
        log::info!(
            "[DETECT] classified {} as {}",
            widget.path().display(),
            widget.variant_name()
        );
        // the path stays in the active set until the observer frees the
        // widget
        main.execute(move |_main_handle| observer.new_widget(widget, information));
    }

    /// Close a descriptor and release its path and lock.
    fn free(core: &Rc<RefCell<Self>>, fd: RawFd) {
        let (probe, handle, lock_dir, active_paths) = {
            let mut guard = core.borrow_mut();
            let c = &mut *guard;
            let Some(probe) = c.probes.remove(&fd) else { return };
            if probe.detector_index >= 0 {
                let index = (probe.detector_index as usize).min(c.detectors.len() - 1);
                c.detectors[index].abandon(fd);
            }
            (
                probe,
                c.handle.clone(),
                c.options.lock_dir.clone(),
                c.active_paths.clone(),
            )
        };
        handle.remove_read_descriptor(fd);
        if probe.locked {
            serial::release_uucp_lock(&lock_dir, &probe.path);
        }
        active_paths.lock().remove(&probe.path);
        log::debug!("[DETECT] freed descriptor for {}", probe.path.display());
        // descriptor closes on drop
    }

    /// Final cleanup once the loop has stopped.
    fn shutdown(&mut self) {
        if !self.probes.is_empty() {
            log::warn!(
                "[DETECT] {} descriptors still active at shutdown",
                self.probes.len()
            );
        }
        for (_, probe) in self.probes.drain() {
            if probe.locked {
                serial::release_uucp_lock(&self.options.lock_dir, &probe.path);
            }
            self.active_paths.lock().remove(&probe.path);
        }
    }
}

type RunningFlag = Arc<(Mutex<bool>, Condvar)>;

/// Handle to the running detector thread.
pub struct WidgetDetectorThread {
    handle: Option<JoinHandle<()>>,
    remote: RemoteHandle,
    active_paths: ActivePaths,
    injected: InjectedQueue,
    lock_dir: PathBuf,
    running: RunningFlag,
}

impl WidgetDetectorThread {
    /// Spawn the thread. `main` is the loop the observer runs on.
    pub fn start(
        observer: Arc<dyn NewWidgetHandler>,
        main: RemoteHandle,
        options: WidgetDetectorOptions,
    ) -> crate::Result<Self> {
        let active_paths: ActivePaths = Arc::new(Mutex::new(HashSet::new()));
        let injected: InjectedQueue = Arc::new(Mutex::new(Vec::new()));
        let running: RunningFlag = Arc::new((Mutex::new(false), Condvar::new()));
        let lock_dir = options.lock_dir.clone();
        let (tx, rx) = bounded(1);

        let thread_active = active_paths.clone();
        let thread_injected = injected.clone();
        let thread_running = running.clone();
        let handle = std::thread::Builder::new()
            .name("widget-detector".to_string())
            .spawn(move || {
                run_thread(
                    observer,
                    main,
                    options,
                    thread_active,
                    thread_injected,
                    thread_running,
                    tx,
                );
            })
            .map_err(crate::Error::from)?;

        let remote = rx.recv().map_err(|_| {
            crate::Error::InvalidState("discovery loop failed to start".to_string())
        })?;
        Ok(WidgetDetectorThread {
            handle: Some(handle),
            remote,
            active_paths,
            injected,
            lock_dir,
            running,
        })
    }

    /// Block until the discovery loop is processing events.
    pub fn wait_until_running(&self) {
        let (lock, condvar) = &*self.running;
        let mut running = lock.lock();
        while !*running {
            condvar.wait(&mut running);
        }
    }

    /// Probe a device that lives outside the scan directory (explicitly
    /// configured devices, tests). Picked up on the next scan pass.
    pub fn probe_descriptor(&self, path: PathBuf, fd: OwnedFd) {
        self.injected.lock().push((path, fd));
    }

    /// The observer is done with a widget: close it on `D`, release the
    /// UUCP lock and allow the path to be probed again.
    ///
    /// The caller must have removed the widget's descriptor from its own
    /// loop first.
    pub fn free_widget(&self, widget: Widget) {
        let active_paths = self.active_paths.clone();
        let lock_dir = self.lock_dir.clone();
        self.remote.execute(move |_handle| {
            let path = widget.path().to_path_buf();
            log::debug!("[DETECT] freeing widget on {}", path.display());
            drop(widget); // closes the descriptor on D
            serial::release_uucp_lock(&lock_dir, &path);
            active_paths.lock().remove(&path);
        });
    }

    /// Stop the thread and wait for the loop to drain.
    pub fn join(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.remote.execute(|loop_handle| loop_handle.terminate());
            if handle.join().is_err() {
                log::error!("[DETECT] discovery thread panicked");
            }
        }
    }
}

impl Drop for WidgetDetectorThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_arguments)] // spawn plumbing, not an API
fn run_thread(
    observer: Arc<dyn NewWidgetHandler>,
    main: RemoteHandle,
    options: WidgetDetectorOptions,
    active_paths: ActivePaths,
    injected: InjectedQueue,
    running: RunningFlag,
    tx: crossbeam::channel::Sender<RemoteHandle>,
) {
    let mut server = match SelectServer::new() {
        Ok(server) => server,
        Err(e) => {
            log::error!("[DETECT] failed to create the discovery loop: {}", e);
            return;
        }
    };
    if tx.send(server.remote_handle()).is_err() {
        return;
    }

    let handle = server.handle();
    let scan_interval = options.scan_interval;
    let core = Rc::new(RefCell::new(ThreadCore::new(
        handle.clone(),
        main,
        observer,
        options,
        active_paths,
        injected,
    )));

    let first_scan = core.clone();
    handle.execute(move || ThreadCore::scan(&first_scan));
    let periodic = core.clone();
    handle.add_repeating_timeout(scan_interval, move || {
        ThreadCore::scan(&periodic);
        true
    });
    let run_flag = running;
    handle.execute(move || {
        let (lock, condvar) = &*run_flag;
        *lock.lock() = true;
        condvar.notify_all();
    });

    if let Err(e) = server.run() {
        log::error!("[DETECT] discovery loop failed: {}", e);
    }
    core.borrow_mut().shutdown();
}
