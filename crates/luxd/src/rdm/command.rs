// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RDM request and response messages.
//!
//! These are the logical messages the controllers queue and hand to
//! transports; checksums and wire layout are the transport's business.

use super::uid::Uid;
use super::{CommandClass, ResponseType};

/// Root device sub-device id.
pub const ROOT_DEVICE: u16 = 0x0000;

/// An RDM request, owned by the controller from enqueue until its callback
/// has fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdmRequest {
    source: Uid,
    destination: Uid,
    transaction_number: u8,
    port_id: u8,
    sub_device: u16,
    command_class: CommandClass,
    param_id: u16,
    param_data: Vec<u8>,
}

impl RdmRequest {
    #[allow(clippy::too_many_arguments)] // mirrors the E1.20 message fields
    pub fn new(
        source: Uid,
        destination: Uid,
        transaction_number: u8,
        port_id: u8,
        sub_device: u16,
        command_class: CommandClass,
        param_id: u16,
        param_data: Vec<u8>,
    ) -> Self {
        RdmRequest {
            source,
            destination,
            transaction_number,
            port_id,
            sub_device,
            command_class,
            param_id,
            param_data,
        }
    }

    pub fn source(&self) -> Uid {
        self.source
    }

    pub fn destination(&self) -> Uid {
        self.destination
    }

    pub fn transaction_number(&self) -> u8 {
        self.transaction_number
    }

    pub fn port_id(&self) -> u8 {
        self.port_id
    }

    pub fn sub_device(&self) -> u16 {
        self.sub_device
    }

    pub fn command_class(&self) -> CommandClass {
        self.command_class
    }

    pub fn param_id(&self) -> u16 {
        self.param_id
    }

    pub fn param_data(&self) -> &[u8] {
        &self.param_data
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination.is_broadcast()
    }

    /// A deep copy, used when a controller hands the request to a transport
    /// but keeps the original for ACK_OVERFLOW continuations.
    pub fn duplicate(&self) -> RdmRequest {
        self.clone()
    }

    /// A copy with the controller-side fields rewritten; used by proxies
    /// that re-originate requests under their own identity.
    pub fn duplicate_with_controller_params(
        &self,
        source: Uid,
        transaction_number: u8,
        port_id: u8,
    ) -> RdmRequest {
        let mut copy = self.clone();
        copy.source = source;
        copy.transaction_number = transaction_number;
        copy.port_id = port_id;
        copy
    }
}

/// An RDM response as assembled by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdmResponse {
    source: Uid,
    destination: Uid,
    transaction_number: u8,
    response_type: ResponseType,
    message_count: u8,
    sub_device: u16,
    command_class: CommandClass,
    param_id: u16,
    param_data: Vec<u8>,
}

impl RdmResponse {
    #[allow(clippy::too_many_arguments)] // mirrors the E1.20 message fields
    pub fn new(
        source: Uid,
        destination: Uid,
        transaction_number: u8,
        response_type: ResponseType,
        message_count: u8,
        sub_device: u16,
        command_class: CommandClass,
        param_id: u16,
        param_data: Vec<u8>,
    ) -> Self {
        RdmResponse {
            source,
            destination,
            transaction_number,
            response_type,
            message_count,
            sub_device,
            command_class,
            param_id,
            param_data,
        }
    }

    /// Build the response matching a request, echoing its addressing.
    pub fn from_request(
        request: &RdmRequest,
        response_type: ResponseType,
        param_data: Vec<u8>,
    ) -> Self {
        RdmResponse {
            source: request.destination(),
            destination: request.source(),
            transaction_number: request.transaction_number(),
            response_type,
            message_count: 0,
            sub_device: request.sub_device(),
            command_class: request
                .command_class()
                .response_class()
                .unwrap_or(request.command_class()),
            param_id: request.param_id(),
            param_data,
        }
    }

    pub fn source(&self) -> Uid {
        self.source
    }

    pub fn destination(&self) -> Uid {
        self.destination
    }

    pub fn transaction_number(&self) -> u8 {
        self.transaction_number
    }

    pub fn response_type(&self) -> ResponseType {
        self.response_type
    }

    pub fn message_count(&self) -> u8 {
        self.message_count
    }

    pub fn sub_device(&self) -> u16 {
        self.sub_device
    }

    pub fn command_class(&self) -> CommandClass {
        self.command_class
    }

    pub fn param_id(&self) -> u16 {
        self.param_id
    }

    pub fn param_data(&self) -> &[u8] {
        &self.param_data
    }

    /// Fold an ACK_OVERFLOW continuation into this response.
    ///
    /// Parameter data is appended; the response type comes from the
    /// continuation so the final combined response reflects the last frame
    /// of the chain.
    pub fn combine(&mut self, continuation: &RdmResponse) {
        self.param_data.extend_from_slice(&continuation.param_data);
        self.response_type = continuation.response_type;
        self.message_count = continuation.message_count;
    }
}
