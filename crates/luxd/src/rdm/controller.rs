// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Queueing RDM controllers.
//!
//! RDM transports (USB widgets, network bridges) take one request at a
//! time. The controllers here present a queued interface over such a
//! transport: callers enqueue as many requests as they like, each completes
//! exactly once, ACK_OVERFLOW chains are reassembled transparently, and
//! discovery runs interleaved with (and ahead of) queued requests.
//!
//! # Transport contract
//!
//! A transport must invoke its completion callback from a later event-loop
//! turn, never from inside `send_rdm_request` itself. The controllers are
//! single-loop objects (`M`); they are not `Send`.

use super::command::{RdmRequest, RdmResponse};
use super::uid::UidSet;
use super::{ResponseStatus, ResponseType};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Completion callback for a queued RDM request.
///
/// Invoked exactly once with the final status, the (possibly reassembled)
/// response, and every raw frame seen during the exchange.
pub type RdmCallback = Box<dyn FnOnce(ResponseStatus, Option<RdmResponse>, Vec<Vec<u8>>)>;

/// Completion callback for a discovery pass.
pub type DiscoveryCallback = Box<dyn FnOnce(&UidSet)>;

/// A single-request-at-a-time RDM transport.
pub trait RdmTransport {
    /// Send one request. The completion callback must fire exactly once,
    /// from a later event-loop turn.
    fn send_rdm_request(&mut self, request: RdmRequest, on_complete: RdmCallback);
}

/// A transport that can also run RDM discovery.
pub trait DiscoverableRdmTransport: RdmTransport {
    fn run_full_discovery(&mut self, on_complete: DiscoveryCallback);
    fn run_incremental_discovery(&mut self, on_complete: DiscoveryCallback);
}

struct Outstanding {
    request: RdmRequest,
    on_complete: Option<RdmCallback>,
}

/// Queue, gate and accumulation state shared by both controllers.
struct Pipeline {
    max_queue_size: usize,
    queue: VecDeque<Outstanding>,
    request_pending: bool,
    active: bool,
    /// Partial response being assembled across an ACK_OVERFLOW chain.
    response: Option<RdmResponse>,
    /// Raw frames collected during the current logical transaction.
    packets: Vec<Vec<u8>>,
}

enum Completion {
    /// Re-send the same front request to collect an ACK_OVERFLOW
    /// continuation; no user-visible callback.
    Resend(RdmRequest),
    /// The transaction is over; run the user callback and move on.
    Finish {
        callback: Option<RdmCallback>,
        status: ResponseStatus,
        response: Option<RdmResponse>,
        packets: Vec<Vec<u8>>,
    },
    /// Spurious completion; state untouched.
    Ignore,
}

impl Pipeline {
    fn new(max_queue_size: usize) -> Self {
        Pipeline {
            max_queue_size,
            queue: VecDeque::new(),
            request_pending: false,
            active: true,
            response: None,
            packets: Vec::new(),
        }
    }

    /// The single gate between the scheduler and the transport.
    fn blocked(&self) -> bool {
        !self.active || self.request_pending
    }

    /// Enqueue, or hand the callback back if the queue is full.
    fn enqueue(
        &mut self,
        request: RdmRequest,
        on_complete: Option<RdmCallback>,
    ) -> Option<RdmCallback> {
        if self.queue.len() >= self.max_queue_size {
            log::warn!("[RDM] queue is full, dropping request");
            return on_complete;
        }
        self.queue.push_back(Outstanding {
            request,
            on_complete,
        });
        None
    }

    /// Mark the front request in flight and hand out a copy for the wire.
    /// The original stays queued for ACK_OVERFLOW continuations.
    fn next_request(&mut self) -> Option<RdmRequest> {
        let front = self.queue.front()?;
        self.request_pending = true;
        Some(front.request.duplicate())
    }

    /// Fold a transport completion into the pipeline.
    fn absorb(
        &mut self,
        status: ResponseStatus,
        response: Option<RdmResponse>,
        packets: Vec<Vec<u8>>,
    ) -> Completion {
        self.request_pending = false;

        if self.queue.is_empty() {
            log::error!("[RDM] received a response but the queue was empty");
            return Completion::Ignore;
        }

        self.packets.extend(packets);

        let mut status = status;
        if status == ResponseStatus::CompletedOk {
            match response {
                None => {
                    // invariant violation by the transport
                    log::error!("[RDM] status was ok but the response was missing");
                    status = ResponseStatus::InvalidResponse;
                    self.response = None;
                }
                Some(latest) => {
                    let latest_type = latest.response_type();
                    match self.response.as_mut() {
                        Some(accumulated) => accumulated.combine(&latest),
                        None => self.response = Some(latest),
                    }
                    if latest_type == ResponseType::AckOverflow {
                        self.request_pending = true;
                        if let Some(front) = self.queue.front() {
                            return Completion::Resend(front.request.duplicate());
                        }
                    }
                }
            }
        } else {
            // an error mid-transaction aborts the whole chain
            self.response = None;
        }

        let Some(outstanding) = self.queue.pop_front() else {
            return Completion::Ignore;
        };
        Completion::Finish {
            callback: outstanding.on_complete,
            status,
            response: self.response.take(),
            packets: std::mem::take(&mut self.packets),
        }
    }

    /// Fail everything still queued; used at shutdown.
    fn drain_failed(&mut self) {
        while let Some(outstanding) = self.queue.pop_front() {
            if let Some(callback) = outstanding.on_complete {
                callback(ResponseStatus::FailedToSend, None, Vec::new());
            }
        }
    }
}

struct Core {
    transport: Box<dyn RdmTransport>,
    pipeline: Pipeline,
}

/// Serializes RDM requests against a single-request transport.
///
/// Requests are queued FIFO; the queue is bounded and overflow fails the
/// request immediately with [`ResponseStatus::FailedToSend`]. ACK_OVERFLOW
/// responses are collected by re-sending the same request and the caller
/// sees one callback with the concatenated parameter data.
pub struct QueueingRdmController {
    core: Rc<RefCell<Core>>,
}

impl QueueingRdmController {
    pub fn new(transport: Box<dyn RdmTransport>, max_queue_size: usize) -> Self {
        QueueingRdmController {
            core: Rc::new(RefCell::new(Core {
                transport,
                pipeline: Pipeline::new(max_queue_size),
            })),
        }
    }

    /// Stop sending new requests. Anything already in flight completes
    /// normally.
    pub fn pause(&self) {
        self.core.borrow_mut().pipeline.active = false;
    }

    /// Resume sending.
    pub fn resume(&self) {
        self.core.borrow_mut().pipeline.active = true;
        Self::take_next_action(&self.core);
    }

    /// Queue a request. If the queue is full the callback fires immediately
    /// with [`ResponseStatus::FailedToSend`] and no packets.
    pub fn send_rdm_request(&self, request: RdmRequest, on_complete: RdmCallback) {
        let rejected = self
            .core
            .borrow_mut()
            .pipeline
            .enqueue(request, Some(on_complete));
        if let Some(callback) = rejected {
            callback(ResponseStatus::FailedToSend, None, Vec::new());
            return;
        }
        Self::take_next_action(&self.core);
    }

    fn take_next_action(core: &Rc<RefCell<Core>>) {
        let request = {
            let mut core_ref = core.borrow_mut();
            if core_ref.pipeline.blocked() {
                return;
            }
            match core_ref.pipeline.next_request() {
                Some(request) => request,
                None => return,
            }
        };
        Self::dispatch(core, request);
    }

    fn dispatch(core: &Rc<RefCell<Core>>, request: RdmRequest) {
        let weak = Rc::downgrade(core);
        let completion: RdmCallback = Box::new(move |status, response, packets| {
            if let Some(core) = weak.upgrade() {
                Self::handle_response(&core, status, response, packets);
            }
        });
        core.borrow_mut()
            .transport
            .send_rdm_request(request, completion);
    }

    fn handle_response(
        core: &Rc<RefCell<Core>>,
        status: ResponseStatus,
        response: Option<RdmResponse>,
        packets: Vec<Vec<u8>>,
    ) {
        let completion = core.borrow_mut().pipeline.absorb(status, response, packets);
        match completion {
            Completion::Resend(request) => Self::dispatch(core, request),
            Completion::Finish {
                callback,
                status,
                response,
                packets,
            } => {
                if let Some(callback) = callback {
                    callback(status, response, packets);
                }
                Self::take_next_action(core);
            }
            Completion::Ignore => {}
        }
    }
}

impl Drop for QueueingRdmController {
    fn drop(&mut self) {
        self.core.borrow_mut().pipeline.drain_failed();
    }
}

struct DiscoveryCore {
    transport: Box<dyn DiscoverableRdmTransport>,
    pipeline: Pipeline,
    /// Discovery requests waiting for the current exchange to finish.
    pending_discovery: Vec<(bool, DiscoveryCallback)>,
    /// Callbacks for the discovery pass currently running.
    in_flight_discovery: Vec<DiscoveryCallback>,
}

impl DiscoveryCore {
    /// Blocked if the base pipeline is, or a discovery pass is running.
    fn blocked(&self) -> bool {
        self.pipeline.blocked() || !self.in_flight_discovery.is_empty()
    }
}

/// A [`QueueingRdmController`] that can also run discovery.
///
/// Discovery has strictly higher precedence than queued requests: once the
/// in-flight exchange finishes, all pending discovery callbacks collapse
/// into a single pass (full if any caller wanted full) before the next
/// queued request goes out.
pub struct DiscoverableQueueingRdmController {
    core: Rc<RefCell<DiscoveryCore>>,
}

impl DiscoverableQueueingRdmController {
    pub fn new(transport: Box<dyn DiscoverableRdmTransport>, max_queue_size: usize) -> Self {
        DiscoverableQueueingRdmController {
            core: Rc::new(RefCell::new(DiscoveryCore {
                transport,
                pipeline: Pipeline::new(max_queue_size),
                pending_discovery: Vec::new(),
                in_flight_discovery: Vec::new(),
            })),
        }
    }

    pub fn pause(&self) {
        self.core.borrow_mut().pipeline.active = false;
    }

    pub fn resume(&self) {
        self.core.borrow_mut().pipeline.active = true;
        Self::take_next_action(&self.core);
    }

    pub fn send_rdm_request(&self, request: RdmRequest, on_complete: RdmCallback) {
        let rejected = self
            .core
            .borrow_mut()
            .pipeline
            .enqueue(request, Some(on_complete));
        if let Some(callback) = rejected {
            callback(ResponseStatus::FailedToSend, None, Vec::new());
            return;
        }
        Self::take_next_action(&self.core);
    }

    /// Run the full discovery routine, now or after the current exchange.
    pub fn run_full_discovery(&self, on_complete: DiscoveryCallback) {
        self.generic_discovery(on_complete, true);
    }

    /// Run the incremental discovery routine, now or after the current
    /// exchange.
    pub fn run_incremental_discovery(&self, on_complete: DiscoveryCallback) {
        self.generic_discovery(on_complete, false);
    }

    fn generic_discovery(&self, on_complete: DiscoveryCallback, full: bool) {
        self.core
            .borrow_mut()
            .pending_discovery
            .push((full, on_complete));
        Self::take_next_action(&self.core);
    }

    fn take_next_action(core: &Rc<RefCell<DiscoveryCore>>) {
        enum Action {
            None,
            Discover,
            Send(RdmRequest),
        }
        let action = {
            let mut core_ref = core.borrow_mut();
            if core_ref.blocked() {
                Action::None
            } else if !core_ref.pending_discovery.is_empty() {
                Action::Discover
            } else {
                match core_ref.pipeline.next_request() {
                    Some(request) => Action::Send(request),
                    None => Action::None,
                }
            }
        };
        match action {
            Action::None => {}
            Action::Discover => Self::start_discovery(core),
            Action::Send(request) => Self::dispatch(core, request),
        }
    }

    /// Collapse all pending discovery callbacks into one transport pass.
    fn start_discovery(core: &Rc<RefCell<DiscoveryCore>>) {
        let mut core_ref = core.borrow_mut();
        let mut full = false;
        let pending = std::mem::take(&mut core_ref.pending_discovery);
        for (wants_full, callback) in pending {
            full |= wants_full;
            core_ref.in_flight_discovery.push(callback);
        }

        let weak = Rc::downgrade(core);
        let completion: DiscoveryCallback = Box::new(move |uids| {
            if let Some(core) = weak.upgrade() {
                Self::discovery_complete(&core, uids);
            }
        });
        if full {
            core_ref.transport.run_full_discovery(completion);
        } else {
            core_ref.transport.run_incremental_discovery(completion);
        }
    }

    fn discovery_complete(core: &Rc<RefCell<DiscoveryCore>>, uids: &UidSet) {
        let callbacks: Vec<DiscoveryCallback> =
            core.borrow_mut().in_flight_discovery.drain(..).collect();
        for callback in callbacks {
            callback(uids);
        }
        Self::take_next_action(core);
    }

    fn dispatch(core: &Rc<RefCell<DiscoveryCore>>, request: RdmRequest) {
        let weak = Rc::downgrade(core);
        let completion: RdmCallback = Box::new(move |status, response, packets| {
            if let Some(core) = weak.upgrade() {
                Self::handle_response(&core, status, response, packets);
            }
        });
        core.borrow_mut()
            .transport
            .send_rdm_request(request, completion);
    }

    fn handle_response(
        core: &Rc<RefCell<DiscoveryCore>>,
        status: ResponseStatus,
        response: Option<RdmResponse>,
        packets: Vec<Vec<u8>>,
    ) {
        let completion = core.borrow_mut().pipeline.absorb(status, response, packets);
        match completion {
            Completion::Resend(request) => Self::dispatch(core, request),
            Completion::Finish {
                callback,
                status,
                response,
                packets,
            } => {
                if let Some(callback) = callback {
                    callback(status, response, packets);
                }
                Self::take_next_action(core);
            }
            Completion::Ignore => {}
        }
    }
}

impl Drop for DiscoverableQueueingRdmController {
    fn drop(&mut self) {
        self.core.borrow_mut().pipeline.drain_failed();
    }
}
