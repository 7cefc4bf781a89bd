//! State machine for a voice preview session
//!
//! All state transitions go through [`reduce()`], which returns the next
//! state and a list of effects to execute. The reducer never touches devices
//! or sockets; the effect runner does, and reports back with events.
//!
//! ```text
//! Idle ─start─▶ RequestingToken ─token─▶ Connecting ─device+channel─▶ Active
//!                     │                      │                          │
//!                     └──────fail──▶ Errored ◀──fail┘      stop/close/error/timeout
//!                                                                       ▼
//!                                              Closed ◀─teardown done─ Stopping
//! ```

use std::time::Instant;
use uuid::Uuid;

use crate::error::{PreviewError, SessionOutcome};
use crate::streaming::PreviewToken;

/// Who is being previewed, fixed for the lifetime of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: Uuid,
    pub agent_ref: String,
    pub tenant_ref: String,
}

/// Internal state of the preview workflow.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone, Default)]
pub enum State {
    #[default]
    Idle,
    RequestingToken {
        session: SessionInfo,
    },
    Connecting {
        session: SessionInfo,
        token: PreviewToken,
        /// Input and output are open; the channel is being opened
        device_ready: bool,
    },
    Active {
        session: SessionInfo,
        started_at: Instant,
    },
    Stopping {
        session: SessionInfo,
        outcome: SessionOutcome,
    },
    Closed {
        session_id: Uuid,
        outcome: SessionOutcome,
    },
    Errored {
        session_id: Uuid,
        error: PreviewError,
        /// Teardown of the failed start has finished
        released: bool,
    },
}

impl State {
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            State::Idle => None,
            State::RequestingToken { session }
            | State::Connecting { session, .. }
            | State::Active { session, .. }
            | State::Stopping { session, .. } => Some(session.id),
            State::Closed { session_id, .. } | State::Errored { session_id, .. } => {
                Some(*session_id)
            }
        }
    }

    /// A session is pending, active or still tearing down
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            State::RequestingToken { .. }
                | State::Connecting { .. }
                | State::Active { .. }
                | State::Stopping { .. }
        )
    }
}

/// Events that can trigger state transitions.
/// Sent by the public handle, the effect runner, the timeout timer and the
/// inbound channel pump.
#[derive(Debug, Clone)]
pub enum Event {
    /// Caller asked for a preview; `id` names the session if accepted
    Start {
        id: Uuid,
        agent_ref: String,
        tenant_ref: String,
    },
    /// Caller asked to stop whatever is running
    Stop,
    /// Engine shutdown requested
    Exit,

    TokenOk {
        id: Uuid,
        token: PreviewToken,
    },
    TokenFail {
        id: Uuid,
        err: PreviewError,
    },

    DeviceOpenOk {
        id: Uuid,
    },
    DeviceOpenFail {
        id: Uuid,
        err: PreviewError,
    },

    ChannelOpenOk {
        id: Uuid,
    },
    ChannelOpenFail {
        id: Uuid,
        err: PreviewError,
    },
    /// Backend closed the channel
    ChannelClosed {
        id: Uuid,
        reason: Option<String>,
    },
    /// Transport error on an open channel
    ChannelFailed {
        id: Uuid,
        err: PreviewError,
    },

    /// Hard session timeout elapsed
    SessionTimeout {
        id: Uuid,
    },
    /// Every resource of the session has been released
    TeardownComplete {
        id: Uuid,
    },
}

impl Event {
    /// Session this event reports on; `None` for caller-originated events
    fn session_id(&self) -> Option<Uuid> {
        match self {
            Event::Start { .. } | Event::Stop | Event::Exit => None,
            Event::TokenOk { id, .. }
            | Event::TokenFail { id, .. }
            | Event::DeviceOpenOk { id }
            | Event::DeviceOpenFail { id, .. }
            | Event::ChannelOpenOk { id }
            | Event::ChannelOpenFail { id, .. }
            | Event::ChannelClosed { id, .. }
            | Event::ChannelFailed { id, .. }
            | Event::SessionTimeout { id }
            | Event::TeardownComplete { id } => Some(*id),
        }
    }
}

/// Effects to be executed after a state transition.
/// The effect runner handles these asynchronously.
#[derive(Debug, Clone)]
pub enum Effect {
    RequestToken { session: SessionInfo },
    /// Arm the hard timeout, counted from start
    StartSessionTimeout { id: Uuid },
    /// Open input then output; never touches the network
    OpenDevices { id: Uuid },
    OpenChannel {
        session: SessionInfo,
        token: PreviewToken,
    },
    /// Release everything the session holds, in order
    Teardown { id: Uuid },
    /// Publish the current status
    EmitStatus,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events carrying another session's id
/// - At most one live session: `Start` is only accepted from Idle, Closed or Errored
/// - Every path out of a live session emits exactly one `Teardown`
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    if let Some(eid) = event.session_id() {
        if state.session_id() != Some(eid) {
            log::debug!("Dropping stale event for session {}: {:?}", eid, event);
            return (state.clone(), vec![]);
        }
    }

    match (state, event) {
        // -----------------
        // Idle / terminal: only Start does anything
        // -----------------
        (
            Idle | Closed { .. } | Errored { .. },
            Start {
                id,
                agent_ref,
                tenant_ref,
            },
        ) => {
            let session = SessionInfo {
                id,
                agent_ref,
                tenant_ref,
            };
            (
                RequestingToken {
                    session: session.clone(),
                },
                vec![RequestToken { session }, StartSessionTimeout { id }, EmitStatus],
            )
        }
        (_, Start { id, .. }) => {
            log::info!(
                "Ignoring start {}: a session is already in progress",
                id
            );
            (state.clone(), vec![])
        }

        // -----------------
        // RequestingToken
        // -----------------
        (RequestingToken { session }, TokenOk { token, .. }) => (
            Connecting {
                session: session.clone(),
                token,
                device_ready: false,
            },
            vec![OpenDevices { id: session.id }, EmitStatus],
        ),
        (RequestingToken { session }, TokenFail { err, .. }) => fail(session, err),

        // -----------------
        // Connecting: device first, then channel
        // -----------------
        (
            Connecting {
                session,
                token,
                device_ready: false,
            },
            DeviceOpenOk { .. },
        ) => (
            Connecting {
                session: session.clone(),
                token: token.clone(),
                device_ready: true,
            },
            vec![
                OpenChannel {
                    session: session.clone(),
                    token: token.clone(),
                },
                EmitStatus,
            ],
        ),
        (
            Connecting {
                session,
                device_ready: false,
                ..
            },
            DeviceOpenFail { err, .. },
        ) => fail(session, err),
        (
            Connecting {
                session,
                device_ready: true,
                ..
            },
            ChannelOpenOk { .. },
        ) => (
            Active {
                session: session.clone(),
                started_at: Instant::now(),
            },
            vec![EmitStatus],
        ),
        (Connecting { session, .. }, ChannelOpenFail { err, .. })
        | (Connecting { session, .. }, ChannelFailed { err, .. }) => fail(session, err),
        (Connecting { session, .. }, ChannelClosed { reason, .. }) => fail(
            session,
            PreviewError::ChannelError(format!(
                "closed during setup: {}",
                reason.as_deref().unwrap_or("no reason")
            )),
        ),

        // -----------------
        // Cancel before Active
        // -----------------
        (RequestingToken { session } | Connecting { session, .. }, Stop) => {
            stop(session, SessionOutcome::EndedNormally)
        }
        (RequestingToken { session } | Connecting { session, .. }, SessionTimeout { .. }) => {
            log::warn!("Session {} timed out before becoming active", session.id);
            stop(
                session,
                SessionOutcome::EndedWithError(PreviewError::ChannelError(
                    "timed out before the session became active".to_string(),
                )),
            )
        }

        // -----------------
        // Active
        // -----------------
        (Active { session, .. }, Stop) => stop(session, SessionOutcome::EndedNormally),
        (Active { session, .. }, ChannelClosed { reason, .. }) => {
            log::info!(
                "Session {} closed by backend ({})",
                session.id,
                reason.as_deref().unwrap_or("no reason")
            );
            stop(session, SessionOutcome::EndedNormally)
        }
        (Active { session, .. }, ChannelFailed { err, .. }) => {
            log::error!("Session {} channel failed: {}", session.id, err);
            stop(session, SessionOutcome::EndedWithError(err))
        }
        (
            Active {
                session,
                started_at,
            },
            SessionTimeout { .. },
        ) => {
            log::info!(
                "Session {} reached its time limit after {:?}",
                session.id,
                started_at.elapsed()
            );
            stop(session, SessionOutcome::EndedNormally)
        }

        // -----------------
        // Stopping
        // -----------------
        (Stopping { session, outcome }, TeardownComplete { .. }) => (
            Closed {
                session_id: session.id,
                outcome: outcome.clone(),
            },
            vec![EmitStatus],
        ),

        // -----------------
        // Errored: teardown still in flight
        // -----------------
        (
            Errored {
                session_id,
                error,
                released: false,
            },
            TeardownComplete { .. },
        ) => (
            Errored {
                session_id: *session_id,
                error: error.clone(),
                released: true,
            },
            vec![EmitStatus],
        ),

        // -----------------
        // Unhandled: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}

/// Fatal start failure: report it now, release whatever was acquired
fn fail(session: &SessionInfo, err: PreviewError) -> (State, Vec<Effect>) {
    log::error!("Session {} failed to start: {}", session.id, err);
    (
        State::Errored {
            session_id: session.id,
            error: err,
            released: false,
        },
        vec![Effect::Teardown { id: session.id }, Effect::EmitStatus],
    )
}

fn stop(session: &SessionInfo, outcome: SessionOutcome) -> (State, Vec<Effect>) {
    (
        State::Stopping {
            session: session.clone(),
            outcome,
        },
        vec![Effect::Teardown { id: session.id }, Effect::EmitStatus],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_event(id: Uuid) -> Event {
        Event::Start {
            id,
            agent_ref: "agent-1".to_string(),
            tenant_ref: "tenant-1".to_string(),
        }
    }

    fn session(id: Uuid) -> SessionInfo {
        SessionInfo {
            id,
            agent_ref: "agent-1".to_string(),
            tenant_ref: "tenant-1".to_string(),
        }
    }

    fn connecting(id: Uuid, device_ready: bool) -> State {
        State::Connecting {
            session: session(id),
            token: PreviewToken::new("tok"),
            device_ready,
        }
    }

    fn active(id: Uuid) -> State {
        State::Active {
            session: session(id),
            started_at: Instant::now(),
        }
    }

    fn teardowns(effects: &[Effect]) -> usize {
        effects
            .iter()
            .filter(|e| matches!(e, Effect::Teardown { .. }))
            .count()
    }

    #[test]
    fn idle_start_requests_token_and_arms_timeout() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&State::Idle, start_event(id));

        assert!(matches!(next, State::RequestingToken { ref session } if session.id == id));
        assert!(matches!(effects[0], Effect::RequestToken { ref session } if session.id == id));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StartSessionTimeout { id: t } if *t == id)));
        assert!(effects.iter().any(|e| matches!(e, Effect::EmitStatus)));
    }

    #[test]
    fn second_start_while_live_is_ignored() {
        let id = Uuid::new_v4();
        for state in [
            State::RequestingToken { session: session(id) },
            connecting(id, false),
            active(id),
            State::Stopping {
                session: session(id),
                outcome: SessionOutcome::EndedNormally,
            },
        ] {
            let (next, effects) = reduce(&state, start_event(Uuid::new_v4()));
            assert_eq!(next.session_id(), Some(id));
            assert!(effects.is_empty());
        }
    }

    #[test]
    fn start_from_terminal_states_begins_new_session() {
        let old = Uuid::new_v4();
        for state in [
            State::Closed {
                session_id: old,
                outcome: SessionOutcome::EndedNormally,
            },
            State::Errored {
                session_id: old,
                error: PreviewError::AuthFailed("x".to_string()),
                released: true,
            },
        ] {
            let new = Uuid::new_v4();
            let (next, _) = reduce(&state, start_event(new));
            assert!(matches!(next, State::RequestingToken { ref session } if session.id == new));
        }
    }

    #[test]
    fn token_ok_opens_devices_before_channel() {
        let id = Uuid::new_v4();
        let state = State::RequestingToken { session: session(id) };
        let (next, effects) = reduce(
            &state,
            Event::TokenOk {
                id,
                token: PreviewToken::new("tok"),
            },
        );

        assert!(matches!(next, State::Connecting { device_ready: false, .. }));
        assert!(effects.iter().any(|e| matches!(e, Effect::OpenDevices { .. })));
        assert!(!effects.iter().any(|e| matches!(e, Effect::OpenChannel { .. })));
    }

    #[test]
    fn token_failure_errors_and_tears_down() {
        let id = Uuid::new_v4();
        let state = State::RequestingToken { session: session(id) };
        let (next, effects) = reduce(
            &state,
            Event::TokenFail {
                id,
                err: PreviewError::AuthFailed("HTTP 401".to_string()),
            },
        );

        assert!(matches!(
            next,
            State::Errored { error: PreviewError::AuthFailed(_), .. }
        ));
        assert_eq!(teardowns(&effects), 1);
        assert!(!effects.iter().any(|e| matches!(e, Effect::OpenDevices { .. })));
    }

    #[test]
    fn device_ok_then_channel_ok_goes_active() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&connecting(id, false), Event::DeviceOpenOk { id });
        assert!(matches!(next, State::Connecting { device_ready: true, .. }));
        assert!(effects.iter().any(|e| matches!(e, Effect::OpenChannel { .. })));

        let (next, effects) = reduce(&next, Event::ChannelOpenOk { id });
        assert!(matches!(next, State::Active { .. }));
        assert_eq!(teardowns(&effects), 0);
    }

    #[test]
    fn device_failure_never_opens_channel() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &connecting(id, false),
            Event::DeviceOpenFail {
                id,
                err: PreviewError::DeviceUnavailable("denied".to_string()),
            },
        );

        assert!(matches!(
            next,
            State::Errored { error: PreviewError::DeviceUnavailable(_), .. }
        ));
        assert!(!effects.iter().any(|e| matches!(e, Effect::OpenChannel { .. })));
        assert_eq!(teardowns(&effects), 1);
    }

    #[test]
    fn channel_ok_before_devices_is_ignored() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&connecting(id, false), Event::ChannelOpenOk { id });
        assert!(matches!(next, State::Connecting { device_ready: false, .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn channel_open_failure_errors_and_tears_down() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &connecting(id, true),
            Event::ChannelOpenFail {
                id,
                err: PreviewError::ChannelError("refused".to_string()),
            },
        );
        assert!(matches!(next, State::Errored { .. }));
        assert_eq!(teardowns(&effects), 1);
    }

    #[test]
    fn stop_while_requesting_token_ignores_late_token() {
        let id = Uuid::new_v4();
        let state = State::RequestingToken { session: session(id) };
        let (stopping, effects) = reduce(&state, Event::Stop);
        assert!(matches!(stopping, State::Stopping { .. }));
        assert_eq!(teardowns(&effects), 1);

        // The in-flight token request completes after stop
        let (next, effects) = reduce(
            &stopping,
            Event::TokenOk {
                id,
                token: PreviewToken::new("late"),
            },
        );
        assert!(matches!(next, State::Stopping { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn stop_while_connecting_never_reaches_active() {
        let id = Uuid::new_v4();
        let (stopping, _) = reduce(&connecting(id, true), Event::Stop);
        let (next, effects) = reduce(&stopping, Event::ChannelOpenOk { id });
        assert!(matches!(next, State::Stopping { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn every_active_exit_path_tears_down_once() {
        let id = Uuid::new_v4();
        let exits = [
            Event::Stop,
            Event::ChannelClosed {
                id,
                reason: Some("bye".to_string()),
            },
            Event::ChannelFailed {
                id,
                err: PreviewError::ChannelError("reset".to_string()),
            },
            Event::SessionTimeout { id },
        ];
        for event in exits {
            let (next, effects) = reduce(&active(id), event);
            assert!(matches!(next, State::Stopping { .. }));
            assert_eq!(teardowns(&effects), 1);

            // Anything else while stopping is a no-op
            let (again, effects) = reduce(&next, Event::Stop);
            assert!(matches!(again, State::Stopping { .. }));
            assert_eq!(teardowns(&effects), 0);
        }
    }

    #[test]
    fn channel_failure_ends_with_error() {
        let id = Uuid::new_v4();
        let err = PreviewError::ChannelError("reset".to_string());
        let (stopping, _) = reduce(
            &active(id),
            Event::ChannelFailed {
                id,
                err: err.clone(),
            },
        );
        let (closed, effects) = reduce(&stopping, Event::TeardownComplete { id });

        assert!(matches!(
            closed,
            State::Closed { outcome: SessionOutcome::EndedWithError(ref e), .. } if *e == err
        ));
        assert!(effects.iter().any(|e| matches!(e, Effect::EmitStatus)));
    }

    #[test]
    fn teardown_complete_closes_normally_after_stop() {
        let id = Uuid::new_v4();
        let (stopping, _) = reduce(&active(id), Event::Stop);
        let (closed, _) = reduce(&stopping, Event::TeardownComplete { id });
        assert!(matches!(
            closed,
            State::Closed { outcome: SessionOutcome::EndedNormally, .. }
        ));
    }

    #[test]
    fn stop_when_idle_or_closed_is_noop() {
        let closed = State::Closed {
            session_id: Uuid::new_v4(),
            outcome: SessionOutcome::EndedNormally,
        };
        for state in [State::Idle, closed] {
            let (next, effects) = reduce(&state, Event::Stop);
            assert_eq!(next.session_id(), state.session_id());
            assert!(effects.is_empty());
        }
    }

    #[test]
    fn stale_event_is_ignored() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &active(id),
            Event::ChannelClosed {
                id: Uuid::new_v4(),
                reason: None,
            },
        );
        assert!(matches!(next, State::Active { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn timeout_before_active_ends_with_error() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&connecting(id, false), Event::SessionTimeout { id });
        assert!(matches!(
            next,
            State::Stopping { outcome: SessionOutcome::EndedWithError(_), .. }
        ));
        assert_eq!(teardowns(&effects), 1);
    }

    #[test]
    fn teardown_complete_after_error_marks_release_once() {
        let id = Uuid::new_v4();
        let state = State::Errored {
            session_id: id,
            error: PreviewError::AuthFailed("x".to_string()),
            released: false,
        };
        let (next, effects) = reduce(&state, Event::TeardownComplete { id });
        assert!(matches!(next, State::Errored { released: true, .. }));
        assert!(effects.iter().any(|e| matches!(e, Effect::EmitStatus)));

        let (again, effects) = reduce(&next, Event::TeardownComplete { id });
        assert!(matches!(again, State::Errored { released: true, .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn failed_start_waits_for_release() {
        let id = Uuid::new_v4();
        let (next, _) = reduce(
            &connecting(id, true),
            Event::ChannelOpenFail {
                id,
                err: PreviewError::ChannelError("refused".to_string()),
            },
        );
        assert!(matches!(next, State::Errored { released: false, .. }));
    }
}
