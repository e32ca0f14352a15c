//! The round-based task protocol between the IKE engine and a negotiation
//!
//! A task is driven by alternating `build` and `process` calls; there is no
//! suspended coroutine, all state lives in the task between rounds.

pub mod child_create;

use ikewire::definitions::params::ExchangeType;
use ikewire::definitions::params::NotifyError;
use ikewire::definitions::params::NotifyStatus;
use ikewire::definitions::KeyExchangePayload;
use ikewire::definitions::Notification;
use ikewire::definitions::NotifyType;
use ikewire::definitions::Payload;
use ikewire::definitions::SecurityAssociation;
use ikewire::definitions::TsPayload;

use crate::ikesa::IkeSa;

/// Outcome of one build or process round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// The task needs at least one more exchange round
    NeedMore,
    /// The task concluded; this does not imply a CHILD_SA was established
    Success,
    /// The task failed; the IKE_SA stays alive
    Failed,
    /// The task failed and left no usable state behind
    NotFound,
    /// The task failed in a way that requires tearing down the IKE_SA
    DestroyMe,
}

/// The payload-level view of one message being composed or processed
///
/// Framing, encryption and retransmission are owned by the IKE engine; a
/// task only sees the exchange type and the decrypted payload list. A task
/// suppresses its outgoing message by clearing the exchange type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Exchange the message belongs to, `None` to suppress sending
    pub exchange: Option<ExchangeType>,
    /// Whether the message is a request (true) or a response
    pub request: bool,
    /// The payloads in emission order
    pub payloads: Vec<Payload>,
}

impl Message {
    /// An empty message of the given exchange
    pub fn new(exchange: ExchangeType, request: bool) -> Self {
        Self {
            exchange: Some(exchange),
            request,
            payloads: vec![],
        }
    }

    /// Append a payload
    pub fn add(&mut self, payload: Payload) {
        self.payloads.push(payload);
    }

    /// The first SA payload, if any
    pub fn sa(&self) -> Option<&SecurityAssociation> {
        self.payloads.iter().find_map(|p| match p {
            Payload::SecurityAssociation(sa) => Some(sa),
            _ => None,
        })
    }

    /// The first nonce payload, if any
    pub fn nonce(&self) -> Option<&Vec<u8>> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Nonce(n) => Some(n),
            _ => None,
        })
    }

    /// The first key exchange payload, if any
    pub fn ke(&self) -> Option<&KeyExchangePayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::KeyExchange(ke) => Some(ke),
            _ => None,
        })
    }

    /// The TSi payload, if any
    pub fn tsi(&self) -> Option<&TsPayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::TrafficSelectorInitiator(ts) => Some(ts),
            _ => None,
        })
    }

    /// The TSr payload, if any
    pub fn tsr(&self) -> Option<&TsPayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::TrafficSelectorResponder(ts) => Some(ts),
            _ => None,
        })
    }

    /// All notify payloads
    pub fn notifies(&self) -> impl Iterator<Item = &Notification> {
        self.payloads.iter().filter_map(|p| match p {
            Payload::Notify(n) => Some(n),
            _ => None,
        })
    }

    /// The first notify of the given error type, if any
    pub fn find_error(&self, error: NotifyError) -> Option<&Notification> {
        self.notifies()
            .find(|n| n.variant == NotifyType::Error(error))
    }

    /// The first notify of the given status type, if any
    pub fn find_status(&self, status: NotifyStatus) -> Option<&Notification> {
        self.notifies()
            .find(|n| n.variant == NotifyType::Status(status))
    }
}

/// One negotiation driven by the IKE engine in rounds
///
/// The engine calls `build` when composing an outgoing message and
/// `process` when a message arrived. The task borrows the IKE_SA only for
/// the duration of the round.
pub trait Task {
    /// Add this task's payloads to an outgoing message
    fn build(&mut self, ike: &mut IkeSa, msg: &mut Message) -> TaskStatus;
    /// Consume an incoming message
    fn process(&mut self, ike: &mut IkeSa, msg: &Message) -> TaskStatus;
}
