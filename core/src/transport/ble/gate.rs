/// Radio gate: holds advertise/scan intents until the adapter is usable
///
/// The adapter reports its state asynchronously. Operations that need a
/// powered radio are parked here as a [`PendingIntent`] and settled exactly
/// once: performed when the adapter reaches `PoweredOn`, failed when it reaches
/// a terminal state, left waiting through `Unknown`/`Resetting`.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::MessagingError;

/// Adapter power/authorization state as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AdapterState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    /// States that settle a pending intent one way or the other
    pub fn is_decisive(&self) -> bool {
        !matches!(self, AdapterState::Unknown | AdapterState::Resetting)
    }

    /// Error a pending intent fails with in this state, if any
    pub fn failure(&self) -> Option<MessagingError> {
        match self {
            AdapterState::PoweredOff => Some(MessagingError::RadioUnavailable),
            AdapterState::Unsupported => Some(MessagingError::RadioUnsupported),
            AdapterState::Unauthorized => Some(MessagingError::RadioUnauthorized),
            _ => None,
        }
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdapterState::Unknown => "unknown",
            AdapterState::Resetting => "resetting",
            AdapterState::Unsupported => "unsupported",
            AdapterState::Unauthorized => "unauthorized",
            AdapterState::PoweredOff => "poweredOff",
            AdapterState::PoweredOn => "poweredOn",
        };
        f.write_str(name)
    }
}

/// Operations that wait on the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentKind {
    StartAdvertising,
    StartScan,
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntentKind::StartAdvertising => write!(f, "startAdvertising"),
            IntentKind::StartScan => write!(f, "startScan"),
        }
    }
}

/// Caller-side completion for an intent
pub type Responder = oneshot::Sender<Result<(), MessagingError>>;

/// A caller's held request, settled at most once.
///
/// Settling consumes the intent, so a second resolve/fail cannot be expressed.
#[derive(Debug)]
pub struct PendingIntent<P> {
    kind: IntentKind,
    params: P,
    responder: Option<Responder>,
}

impl<P> PendingIntent<P> {
    pub fn new(kind: IntentKind, params: P, responder: Responder) -> Self {
        Self {
            kind,
            params,
            responder: Some(responder),
        }
    }

    /// Intent with nobody waiting on the outcome
    pub fn detached(kind: IntentKind, params: P) -> Self {
        Self {
            kind,
            params,
            responder: None,
        }
    }

    pub fn kind(&self) -> IntentKind {
        self.kind
    }

    pub fn params(&self) -> &P {
        &self.params
    }

    pub fn resolve(self) {
        debug!("Intent {} resolved", self.kind);
        if let Some(responder) = self.responder {
            // Caller may have gone away; nothing to report to
            let _ = responder.send(Ok(()));
        }
    }

    pub fn fail(self, error: MessagingError) {
        debug!("Intent {} failed: {}", self.kind, error);
        if let Some(responder) = self.responder {
            let _ = responder.send(Err(error));
        }
    }
}

/// What the owning controller must do after the gate evaluated its intent
#[derive(Debug)]
pub enum GateDecision<P> {
    /// Adapter is on: perform the operation, then settle the intent
    Proceed(PendingIntent<P>),
    /// No decision yet
    Wait,
}

/// Adapter state tracker plus the single pending intent of one role
#[derive(Debug)]
pub struct RadioGate<P> {
    state: AdapterState,
    pending: Option<PendingIntent<P>>,
}

impl<P> Default for RadioGate<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> RadioGate<P> {
    pub fn new() -> Self {
        Self {
            state: AdapterState::Unknown,
            pending: None,
        }
    }

    /// Last reported adapter state
    pub fn state(&self) -> AdapterState {
        self.state
    }

    pub fn is_powered_on(&self) -> bool {
        self.state == AdapterState::PoweredOn
    }

    /// Whether an intent is waiting for the adapter
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Register a new intent and evaluate it against the current state.
    ///
    /// An intent already waiting is failed with `Superseded` first.
    pub fn register(&mut self, intent: PendingIntent<P>) -> GateDecision<P> {
        if let Some(previous) = self.pending.take() {
            warn!("Intent {} superseded by a newer request", previous.kind());
            previous.fail(MessagingError::Superseded);
        }
        self.pending = Some(intent);
        self.evaluate()
    }

    /// Record an adapter state change and evaluate the pending intent
    pub fn on_state_changed(&mut self, state: AdapterState) -> GateDecision<P> {
        if state != self.state {
            info!("Adapter state {} -> {}", self.state, state);
        }
        self.state = state;
        self.evaluate()
    }

    /// Fail and drop any pending intent
    pub fn cancel(&mut self, error: MessagingError) {
        if let Some(intent) = self.pending.take() {
            intent.fail(error);
        }
    }

    fn evaluate(&mut self) -> GateDecision<P> {
        if self.pending.is_none() {
            return GateDecision::Wait;
        }

        match self.state {
            AdapterState::PoweredOn => match self.pending.take() {
                Some(intent) => GateDecision::Proceed(intent),
                None => GateDecision::Wait,
            },
            state => {
                if let Some(error) = state.failure() {
                    if let Some(intent) = self.pending.take() {
                        warn!("Intent {} failed, adapter is {}", intent.kind(), state);
                        intent.fail(error);
                    }
                }
                GateDecision::Wait
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_intent() -> (PendingIntent<()>, oneshot::Receiver<Result<(), MessagingError>>) {
        let (tx, rx) = oneshot::channel();
        (PendingIntent::new(IntentKind::StartScan, (), tx), rx)
    }

    #[test]
    fn test_transient_states_wait() {
        let mut gate = RadioGate::new();
        let (intent, mut rx) = scan_intent();

        assert!(matches!(gate.register(intent), GateDecision::Wait));
        assert!(matches!(
            gate.on_state_changed(AdapterState::Resetting),
            GateDecision::Wait
        ));
        assert!(matches!(
            gate.on_state_changed(AdapterState::Unknown),
            GateDecision::Wait
        ));
        assert!(gate.has_pending());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_powered_on_proceeds_once() {
        let mut gate = RadioGate::new();
        let (intent, mut rx) = scan_intent();
        gate.register(intent);
        gate.on_state_changed(AdapterState::Resetting);

        match gate.on_state_changed(AdapterState::PoweredOn) {
            GateDecision::Proceed(intent) => intent.resolve(),
            GateDecision::Wait => panic!("expected proceed"),
        }
        assert_eq!(rx.try_recv().expect("settled"), Ok(()));
        assert!(!gate.has_pending());

        // Later terminal state has nothing left to settle
        assert!(matches!(
            gate.on_state_changed(AdapterState::PoweredOff),
            GateDecision::Wait
        ));
    }

    #[test]
    fn test_terminal_states_fail_with_reason() {
        let cases = [
            (AdapterState::PoweredOff, MessagingError::RadioUnavailable),
            (AdapterState::Unsupported, MessagingError::RadioUnsupported),
            (AdapterState::Unauthorized, MessagingError::RadioUnauthorized),
        ];

        for (state, expected) in cases {
            let mut gate = RadioGate::new();
            let (intent, mut rx) = scan_intent();
            gate.register(intent);
            assert!(matches!(gate.on_state_changed(state), GateDecision::Wait));
            assert_eq!(rx.try_recv().expect("settled"), Err(expected));
            assert!(!gate.has_pending());
        }
    }

    #[test]
    fn test_register_when_already_on_proceeds_immediately() {
        let mut gate = RadioGate::new();
        gate.on_state_changed(AdapterState::PoweredOn);
        let (intent, _rx) = scan_intent();
        assert!(matches!(gate.register(intent), GateDecision::Proceed(_)));
    }

    #[test]
    fn test_newer_intent_supersedes_older() {
        let mut gate = RadioGate::new();
        let (first, mut first_rx) = scan_intent();
        let (second, mut second_rx) = scan_intent();

        gate.register(first);
        gate.register(second);
        assert_eq!(
            first_rx.try_recv().expect("settled"),
            Err(MessagingError::Superseded)
        );
        assert!(second_rx.try_recv().is_err());
        assert!(gate.has_pending());
    }

    #[test]
    fn test_cancel_fails_pending() {
        let mut gate = RadioGate::new();
        let (intent, mut rx) = scan_intent();
        gate.register(intent);
        gate.cancel(MessagingError::RuntimeStopped);
        assert_eq!(
            rx.try_recv().expect("settled"),
            Err(MessagingError::RuntimeStopped)
        );
    }

    #[test]
    fn test_detached_intent_settles_silently() {
        let mut gate = RadioGate::new();
        gate.register(PendingIntent::detached(IntentKind::StartAdvertising, 7u8));
        match gate.on_state_changed(AdapterState::PoweredOn) {
            GateDecision::Proceed(intent) => {
                assert_eq!(*intent.params(), 7);
                assert_eq!(intent.kind(), IntentKind::StartAdvertising);
                intent.resolve();
            }
            GateDecision::Wait => panic!("expected proceed"),
        }
    }
}
