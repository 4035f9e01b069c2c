// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cooperative single-threaded event loops ("select servers").
//!
//! The daemon core runs on exactly two of these: the main loop `M` (universe
//! store, registry, RDM controllers, E1.31 receiver) and the discovery loop
//! `D` (descriptors being probed). A loop supports read-readiness callbacks,
//! one-shot and repeating timeouts, and closure injection from its own
//! thread ([`LoopHandle::execute`]) or from other threads
//! ([`RemoteHandle::execute`]).
//!
//! # Architecture
//!
//! ```text
//! LoopHandle (same thread)  --> command queue --+
//! RemoteHandle (any thread) --> channel + Waker +--> run(): poll / timers
//!                                               |        |
//! fd readable --------------------------------- +        v
//!                                                  callbacks (to completion)
//! ```
//!
//! Code between suspension points runs to completion without preemption;
//! mutations requested from inside callbacks (register/remove/cancel) take
//! effect before the next poll. Within a loop, callbacks run in readiness
//! or deadline order; ties fall back to registration order.
//!
//! Readiness is edge-style: a read callback must drain its descriptor until
//! `WouldBlock` or it will stall.

mod timeout;

pub use timeout::TimeoutId;

use crossbeam::channel::{unbounded, Receiver, Sender};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAKE_TOKEN: Token = Token(0);
const FIRST_READ_TOKEN: usize = 1;

type ReadCallback = Rc<RefCell<dyn FnMut()>>;
type RemoteTask = Box<dyn FnOnce(&LoopHandle) + Send>;

enum Command {
    AddRead(RawFd, ReadCallback),
    RemoveRead(RawFd),
    Execute(Box<dyn FnOnce()>),
    AddSingle(TimeoutId, Duration, Box<dyn FnOnce()>),
    AddRepeating(TimeoutId, Duration, Rc<RefCell<dyn FnMut() -> bool>>),
    Cancel(TimeoutId),
    Terminate,
}

struct Shared {
    commands: VecDeque<Command>,
    next_timeout_id: u64,
}

/// Same-thread handle to a [`SelectServer`].
///
/// Cheap to clone, not `Send`. All mutations are queued and applied by the
/// loop before its next poll.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Rc<RefCell<Shared>>,
}

impl LoopHandle {
    /// Invoke `callback` whenever `fd` becomes readable.
    ///
    /// The callback must drain the descriptor. Registering an fd twice is a
    /// programming error, logged when the command is applied.
    pub fn add_read_descriptor<F: FnMut() + 'static>(&self, fd: RawFd, callback: F) {
        self.push(Command::AddRead(fd, Rc::new(RefCell::new(callback))));
    }

    /// Stop watching `fd`. Must happen before the descriptor is closed.
    pub fn remove_read_descriptor(&self, fd: RawFd) {
        self.push(Command::RemoveRead(fd));
    }

    /// Run `f` on the loop after the current callback completes.
    pub fn execute<F: FnOnce() + 'static>(&self, f: F) {
        self.push(Command::Execute(Box::new(f)));
    }

    /// Run `f` once after `delay`.
    pub fn add_timeout<F: FnOnce() + 'static>(&self, delay: Duration, f: F) -> TimeoutId {
        let id = self.allocate_id();
        self.push(Command::AddSingle(id, delay, Box::new(f)));
        id
    }

    /// Run `f` every `interval` until it returns false or the timeout is
    /// cancelled.
    pub fn add_repeating_timeout<F: FnMut() -> bool + 'static>(
        &self,
        interval: Duration,
        f: F,
    ) -> TimeoutId {
        let id = self.allocate_id();
        self.push(Command::AddRepeating(id, interval, Rc::new(RefCell::new(f))));
        id
    }

    /// Cancel a pending timeout by id. Cancelling an already-fired one-shot
    /// is a no-op.
    pub fn remove_timeout(&self, id: TimeoutId) {
        self.push(Command::Cancel(id));
    }

    /// Stop the loop after the current callback batch.
    pub fn terminate(&self) {
        self.push(Command::Terminate);
    }

    fn allocate_id(&self) -> TimeoutId {
        let mut shared = self.shared.borrow_mut();
        let id = TimeoutId(shared.next_timeout_id);
        shared.next_timeout_id += 1;
        id
    }

    fn push(&self, command: Command) {
        self.shared.borrow_mut().commands.push_back(command);
    }
}

/// Cross-thread handle: inject a closure onto another loop.
///
/// Submission order is preserved per target loop. The closure receives the
/// target loop's [`LoopHandle`] so it can register descriptors and timers
/// over there.
#[derive(Clone)]
pub struct RemoteHandle {
    tx: Sender<RemoteTask>,
    waker: Arc<Waker>,
}

impl RemoteHandle {
    pub fn execute<F: FnOnce(&LoopHandle) + Send + 'static>(&self, f: F) {
        if self.tx.send(Box::new(f)).is_err() {
            log::warn!("[LOOP] remote execute on a loop that has shut down");
            return;
        }
        if let Err(e) = self.waker.wake() {
            log::warn!("[LOOP] failed to wake remote loop: {}", e);
        }
    }
}

/// A cooperative, single-threaded reactor.
pub struct SelectServer {
    poll: Poll,
    waker: Arc<Waker>,
    remote_tx: Sender<RemoteTask>,
    remote_rx: Receiver<RemoteTask>,
    shared: Rc<RefCell<Shared>>,
    reads: HashMap<Token, ReadCallback>,
    fd_tokens: HashMap<RawFd, Token>,
    next_token: usize,
    timers: timeout::TimerQueue,
    terminated: bool,
}

impl SelectServer {
    pub fn new() -> crate::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (remote_tx, remote_rx) = unbounded();
        Ok(SelectServer {
            poll,
            waker,
            remote_tx,
            remote_rx,
            shared: Rc::new(RefCell::new(Shared {
                commands: VecDeque::new(),
                next_timeout_id: 0,
            })),
            reads: HashMap::new(),
            fd_tokens: HashMap::new(),
            next_token: FIRST_READ_TOKEN,
            timers: timeout::TimerQueue::new(),
            terminated: false,
        })
    }

    /// Same-thread handle for registrations.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Cross-thread handle for closure injection.
    pub fn remote_handle(&self) -> RemoteHandle {
        RemoteHandle {
            tx: self.remote_tx.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Run until [`LoopHandle::terminate`] is called.
    pub fn run(&mut self) -> crate::Result<()> {
        let handle = self.handle();
        let mut events = Events::with_capacity(128);

        loop {
            self.drain_remote(&handle);
            self.apply_commands();
            self.fire_due_timers();
            self.apply_commands();
            if self.terminated {
                log::debug!("[LOOP] terminated");
                return Ok(());
            }

            let timeout = self
                .timers
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    continue; // remote queue drained at the top of the loop
                }
                // Clone the callback out so the entry map stays borrowable
                // from inside the callback.
                let callback = match self.reads.get(&token) {
                    Some(callback) => callback.clone(),
                    None => continue, // removed earlier in this batch
                };
                (callback.borrow_mut())();
                self.apply_commands();
            }
        }
    }

    fn drain_remote(&mut self, handle: &LoopHandle) {
        while let Ok(task) = self.remote_rx.try_recv() {
            task(handle);
            self.apply_commands();
        }
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        while let Some((id, fired_at)) = self.timers.pop_due(now) {
            match self.timers.take_action(id, fired_at) {
                Some(timeout::TimerAction::Single(callback)) => callback(),
                Some(timeout::TimerAction::Repeating(callback)) => {
                    let keep = (callback.borrow_mut())();
                    if !keep {
                        self.timers.cancel(id);
                    }
                }
                None => {}
            }
            // apply between firings so a callback can cancel a timer that is
            // due in the same batch
            self.apply_commands();
        }
    }

    fn apply_commands(&mut self) {
        loop {
            let command = self.shared.borrow_mut().commands.pop_front();
            let Some(command) = command else { return };
            match command {
                Command::AddRead(fd, callback) => self.apply_add_read(fd, callback),
                Command::RemoveRead(fd) => self.apply_remove_read(fd),
                Command::Execute(f) => f(),
                Command::AddSingle(id, delay, f) => {
                    self.timers.insert(
                        id,
                        Instant::now() + delay,
                        timeout::TimerKind::Single(Some(f)),
                    );
                }
                Command::AddRepeating(id, interval, f) => {
                    self.timers.insert(
                        id,
                        Instant::now() + interval,
                        timeout::TimerKind::Repeating(f, interval),
                    );
                }
                Command::Cancel(id) => {
                    self.timers.cancel(id);
                }
                Command::Terminate => self.terminated = true,
            }
        }
    }

    fn apply_add_read(&mut self, fd: RawFd, callback: ReadCallback) {
        if self.fd_tokens.contains_key(&fd) {
            log::error!("[LOOP] fd {} is already registered", fd);
            return;
        }
        let token = Token(self.next_token);
        self.next_token += 1;
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
        {
            log::error!("[LOOP] failed to register fd {}: {}", fd, e);
            return;
        }
        self.fd_tokens.insert(fd, token);
        self.reads.insert(token, callback);
    }

    fn apply_remove_read(&mut self, fd: RawFd) {
        let Some(token) = self.fd_tokens.remove(&fd) else {
            log::debug!("[LOOP] remove for unregistered fd {}", fd);
            return;
        };
        self.reads.remove(&token);
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            // The fd may already be closed; epoll drops it on close.
            log::debug!("[LOOP] deregister fd {}: {}", fd, e);
        }
    }

    /// True if a timeout is still pending (test hook).
    #[cfg(test)]
    fn timeout_pending(&self, id: TimeoutId) -> bool {
        self.timers.is_registered(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_execute_runs_in_order() {
        let mut server = SelectServer::new().unwrap();
        let handle = server.handle();
        let order = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            handle.execute(move || order.borrow_mut().push(i));
        }
        let stop = handle.clone();
        handle.execute(move || stop.terminate());
        server.run().unwrap();

        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_single_timeout_fires() {
        let mut server = SelectServer::new().unwrap();
        let handle = server.handle();
        let fired = Rc::new(Cell::new(false));

        let flag = fired.clone();
        let stop = handle.clone();
        handle.add_timeout(Duration::from_millis(5), move || {
            flag.set(true);
            stop.terminate();
        });
        server.run().unwrap();
        assert!(fired.get());
    }

    #[test]
    fn test_repeating_timeout_stops_on_false() {
        let mut server = SelectServer::new().unwrap();
        let handle = server.handle();
        let count = Rc::new(Cell::new(0u32));

        let counter = count.clone();
        let stop = handle.clone();
        handle.add_repeating_timeout(Duration::from_millis(1), move || {
            counter.set(counter.get() + 1);
            if counter.get() == 3 {
                stop.terminate();
                false
            } else {
                true
            }
        });
        server.run().unwrap();
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn test_cancel_timeout() {
        let mut server = SelectServer::new().unwrap();
        let handle = server.handle();
        let fired = Rc::new(Cell::new(false));

        let flag = fired.clone();
        let id = handle.add_timeout(Duration::from_millis(1), move || flag.set(true));
        handle.remove_timeout(id);
        let stop = handle.clone();
        handle.add_timeout(Duration::from_millis(10), move || stop.terminate());
        server.run().unwrap();

        assert!(!fired.get());
        assert!(!server.timeout_pending(id));
    }

    #[test]
    fn test_remote_execute_from_other_thread() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let mut server = SelectServer::new().unwrap();
        let remote = server.remote_handle();
        let seen = Arc::new(AtomicBool::new(false));
        let flag = seen.clone();

        let thread = std::thread::spawn(move || {
            remote.execute(move |handle| {
                flag.store(true, Ordering::SeqCst);
                handle.terminate();
            });
        });
        server.run().unwrap();
        thread.join().unwrap();
        assert!(seen.load(Ordering::SeqCst));
    }

    #[test]
    fn test_read_descriptor_dispatch() {
        use std::io::{Read, Write};
        use std::os::unix::io::AsRawFd;
        use std::os::unix::net::UnixStream;

        let (mut a, mut b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();

        let mut server = SelectServer::new().unwrap();
        let handle = server.handle();
        let got = Rc::new(RefCell::new(Vec::new()));

        let fd = b.as_raw_fd();
        let sink = got.clone();
        let stop = handle.clone();
        handle.add_read_descriptor(fd, move || {
            let mut buf = [0u8; 64];
            loop {
                match b.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => sink.borrow_mut().extend_from_slice(&buf[..n]),
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }
            stop.terminate();
        });

        a.write_all(b"ping").unwrap();
        server.run().unwrap();
        assert_eq!(&*got.borrow(), b"ping");
    }
}
