//! Connection lifecycle as a pure transition function.
//!
//! [`step`] maps the current state and one transport event to the next state
//! and the side effects the supervisor has to carry out. It never touches the
//! transport itself, which keeps every transition unit testable.

use crate::transport::TransportEvent;

/// How many peripherals are managed at once. The first device discovered wins
/// for the lifetime of the process.
pub const MAX_MANAGED_DEVICES: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Scanning,
    AwaitingFirstDevice,
    Connecting,
    Connected,
    ResolvingServices,
    Subscribed,
    Reconnecting,
    ShuttingDown,
}

impl State {
    fn is_linked(self) -> bool {
        matches!(
            self,
            State::Connected | State::ResolvingServices | State::Subscribed
        )
    }
}

#[derive(Debug)]
pub enum Action<D> {
    StopScan,
    /// Take ownership of the device
    Adopt(D),
    /// Reject a device because one is already managed
    Dispose(D),
    ConnectWithRetry,
    MarkConnected,
    /// Look up the required service and characteristic, then subscribe
    ResolveAndSubscribe,
    Dispatch(Vec<u8>),
    Ignore(&'static str),
}

#[derive(Debug)]
pub struct Transition<D> {
    pub next: State,
    pub actions: Vec<Action<D>>,
}

impl<D> Transition<D> {
    fn to(next: State, actions: Vec<Action<D>>) -> Self {
        Self { next, actions }
    }

    fn stay(state: State, reason: &'static str) -> Self {
        Self::to(state, vec![Action::Ignore(reason)])
    }
}

/// Advance the lifecycle by one event.
///
/// `managed` is the number of devices currently adopted.
pub fn step<D>(state: State, managed: usize, event: TransportEvent<D>) -> Transition<D> {
    if state == State::ShuttingDown {
        return Transition::stay(state, "shutting down");
    }

    match event {
        TransportEvent::Discovered(device) if managed >= MAX_MANAGED_DEVICES => {
            Transition::to(state, vec![Action::StopScan, Action::Dispose(device)])
        }
        TransportEvent::Discovered(device) => Transition::to(
            State::Connecting,
            vec![
                Action::StopScan,
                Action::Adopt(device),
                Action::ConnectWithRetry,
            ],
        ),

        TransportEvent::Connected if managed == 0 => Transition::stay(state, "no managed device"),
        TransportEvent::Connected => match state {
            State::Connecting | State::Reconnecting => {
                Transition::to(State::Connected, vec![Action::MarkConnected])
            }
            _ => Transition::stay(state, "already connected"),
        },

        TransportEvent::ServicesResolved => match state {
            State::Connected => {
                Transition::to(State::ResolvingServices, vec![Action::ResolveAndSubscribe])
            }
            State::ResolvingServices | State::Subscribed => {
                Transition::stay(state, "services already resolved")
            }
            _ => Transition::stay(state, "services resolved while not connected"),
        },

        TransportEvent::Disconnected if state.is_linked() || state == State::Connecting => {
            Transition::to(State::Reconnecting, vec![Action::ConnectWithRetry])
        }
        TransportEvent::Disconnected => Transition::stay(state, "not connected"),

        TransportEvent::Notification(data) if state == State::Subscribed => {
            Transition::to(state, vec![Action::Dispatch(data)])
        }
        TransportEvent::Notification(_) => Transition::stay(state, "not subscribed"),
    }
}

#[cfg(test)]
fn kinds(transition: &Transition<u32>) -> Vec<String> {
    transition
        .actions
        .iter()
        .map(|action| format!("{action:?}"))
        .collect()
}

#[test]
fn test_first_device_is_adopted() {
    let transition = step(State::AwaitingFirstDevice, 0, TransportEvent::Discovered(7));
    assert_eq!(transition.next, State::Connecting);
    assert_eq!(kinds(&transition), ["StopScan", "Adopt(7)", "ConnectWithRetry"]);
}

#[test]
fn test_second_device_is_rejected() {
    let transition = step(State::Subscribed, 1, TransportEvent::Discovered(8));
    assert_eq!(transition.next, State::Subscribed);
    assert_eq!(kinds(&transition), ["StopScan", "Dispose(8)"]);
}

#[test]
fn test_happy_path() {
    let transition = step::<u32>(State::Connecting, 1, TransportEvent::Connected);
    assert_eq!(transition.next, State::Connected);

    let transition = step::<u32>(State::Connected, 1, TransportEvent::ServicesResolved);
    assert_eq!(transition.next, State::ResolvingServices);
    assert_eq!(kinds(&transition), ["ResolveAndSubscribe"]);
}

#[test]
fn test_disconnect_reconnects() {
    for state in [State::Connected, State::ResolvingServices, State::Subscribed] {
        let transition = step::<u32>(state, 1, TransportEvent::Disconnected);
        assert_eq!(transition.next, State::Reconnecting);
        assert_eq!(kinds(&transition), ["ConnectWithRetry"]);
    }
}

#[test]
fn test_shutting_down_ignores_everything() {
    let events = [
        TransportEvent::Discovered(1),
        TransportEvent::Connected,
        TransportEvent::ServicesResolved,
        TransportEvent::Disconnected,
        TransportEvent::Notification(vec![0xaa]),
    ];
    for event in events {
        let transition = step(State::ShuttingDown, 1, event);
        assert_eq!(transition.next, State::ShuttingDown);
        assert_eq!(kinds(&transition), ["Ignore(\"shutting down\")"]);
    }
}

#[test]
fn test_notifications_only_when_subscribed() {
    let transition = step::<u32>(State::Subscribed, 1, TransportEvent::Notification(vec![1, 2]));
    assert_eq!(kinds(&transition), ["Dispatch([1, 2])"]);

    let transition = step::<u32>(State::Connected, 1, TransportEvent::Notification(vec![1, 2]));
    assert_eq!(transition.next, State::Connected);
    assert!(matches!(transition.actions[..], [Action::Ignore(_)]));
}

#[test]
fn test_repeated_link_up_events_are_ignored() {
    for state in [State::ResolvingServices, State::Subscribed] {
        let transition = step::<u32>(state, 1, TransportEvent::Connected);
        assert_eq!(transition.next, state);
        assert_eq!(kinds(&transition), ["Ignore(\"already connected\")"]);

        let transition = step::<u32>(state, 1, TransportEvent::ServicesResolved);
        assert_eq!(transition.next, state);
        assert_eq!(kinds(&transition), ["Ignore(\"services already resolved\")"]);
    }
}
