//! Fire-and-forget event notifications emitted during negotiation

use std::sync::Mutex;

use ikewire::definitions::TrafficSelector;

/// Where in the negotiation a narrow hook fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NarrowPhase {
    /// Initiator composing its offer before authentication
    InitiatorPreAuth,
    /// Responder narrowing the received offer
    Responder,
    /// Initiator checking the peer's narrowed answer
    InitiatorPostAuth,
    /// Responder after the exchange concluded
    ResponderPost,
}

/// Something went wrong enough that an operator may care
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alert {
    /// The peer's SA payload did not match any configured proposal
    ProposalMismatchChild,
    /// The negotiated traffic selectors were unacceptable
    TsMismatchChild,
    /// The peer rejected the CHILD_SA with the contained error notify value
    PeerChildError(u16),
    /// Installing an SA into the kernel failed
    InstallChildSaFailed,
    /// Installing the flow policies into the kernel failed
    InstallChildPolicyFailed,
}

/// The daemon-wide event bus; all notifications are fire-and-forget
pub trait EventBus: Send + Sync {
    /// Traffic selectors were narrowed
    fn narrow(&self, phase: NarrowPhase, my_ts: &[TrafficSelector], other_ts: &[TrafficSelector]);
    /// An alert condition occurred
    fn alert(&self, alert: Alert);
    /// Key material for a CHILD_SA was derived
    fn child_derived_keys(&self, child_id: u32);
    /// Keys of a CHILD_SA were handed to the kernel
    fn child_keys(&self, child_id: u32, initiator: bool);
    /// A CHILD_SA went up or down
    fn child_updown(&self, child_id: u32, up: bool);
}

/// Bus that swallows every event
pub struct NullBus;

impl EventBus for NullBus {
    fn narrow(&self, _: NarrowPhase, _: &[TrafficSelector], _: &[TrafficSelector]) {}
    fn alert(&self, _: Alert) {}
    fn child_derived_keys(&self, _: u32) {}
    fn child_keys(&self, _: u32, _: bool) {}
    fn child_updown(&self, _: u32, _: bool) {}
}

/// One recorded bus event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// A narrow hook fired with that many selectors on each side
    Narrow(NarrowPhase, usize, usize),
    /// An alert was raised
    Alert(Alert),
    /// Keys were derived for the CHILD_SA
    DerivedKeys(u32),
    /// Keys were installed for the CHILD_SA
    Keys(u32, bool),
    /// The CHILD_SA went up or down
    Updown(u32, bool),
}

/// Bus keeping every event around for inspection in tests
#[derive(Default)]
pub struct RecordingBus {
    /// The recorded events in emission order
    pub events: Mutex<Vec<BusEvent>>,
}

impl RecordingBus {
    fn push(&self, event: BusEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    /// Clone out the recorded events
    pub fn snapshot(&self) -> Vec<BusEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EventBus for RecordingBus {
    fn narrow(&self, phase: NarrowPhase, my_ts: &[TrafficSelector], other_ts: &[TrafficSelector]) {
        self.push(BusEvent::Narrow(phase, my_ts.len(), other_ts.len()));
    }

    fn alert(&self, alert: Alert) {
        self.push(BusEvent::Alert(alert));
    }

    fn child_derived_keys(&self, child_id: u32) {
        self.push(BusEvent::DerivedKeys(child_id));
    }

    fn child_keys(&self, child_id: u32, initiator: bool) {
        self.push(BusEvent::Keys(child_id, initiator));
    }

    fn child_updown(&self, child_id: u32, up: bool) {
        self.push(BusEvent::Updown(child_id, up));
    }
}
