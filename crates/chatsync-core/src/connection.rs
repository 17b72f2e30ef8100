use crate::{error::SyncError, types::ConnectionState};

/// Push-channel lifecycle state machine.
///
/// `Disconnected -> Connecting -> Connected`, with `Connected ->
/// Reconnecting -> Connecting` on transport errors. Explicit disconnect and
/// the terminal `Unavailable` transition are accepted from any state; a
/// second connect while a session is live is a no-op.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
        }
    }
}

impl ConnectionStateMachine {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Begin a connect attempt.
    ///
    /// Returns `Some(Connecting)` when a new attempt starts, `None` when a
    /// session is already live or being opened (idempotent connect).
    /// Connecting out of `Unavailable` is allowed: the caller refreshed its
    /// credentials and asked again.
    pub fn connect(&mut self) -> Option<ConnectionState> {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Unavailable => {
                Some(self.transition(ConnectionState::Connecting))
            }
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Reconnecting => None,
        }
    }

    /// The handshake completed and events flow.
    pub fn established(&mut self) -> Result<ConnectionState, SyncError> {
        if self.state != ConnectionState::Connecting {
            return Err(SyncError::invalid_connection(self.state, "established"));
        }
        Ok(self.transition(ConnectionState::Connected))
    }

    /// A transient transport failure occurred; a backoff delay follows.
    pub fn transport_error(&mut self) -> Result<ConnectionState, SyncError> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                Ok(self.transition(ConnectionState::Reconnecting))
            }
            other => Err(SyncError::invalid_connection(other, "transport_error")),
        }
    }

    /// The backoff delay elapsed; the next attempt starts.
    pub fn retry(&mut self) -> Result<ConnectionState, SyncError> {
        if self.state != ConnectionState::Reconnecting {
            return Err(SyncError::invalid_connection(self.state, "retry"));
        }
        Ok(self.transition(ConnectionState::Connecting))
    }

    /// Credentials were rejected or the retry budget ran out.
    ///
    /// Terminal until the caller connects again with fresh credentials.
    pub fn unavailable(&mut self) -> ConnectionState {
        self.transition(ConnectionState::Unavailable)
    }

    /// Explicit teardown; accepted from every state.
    pub fn disconnect(&mut self) -> ConnectionState {
        self.transition(ConnectionState::Disconnected)
    }

    fn transition(&mut self, next: ConnectionState) -> ConnectionState {
        self.state = next;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_happy_path_transitions() {
        let mut sm = ConnectionStateMachine::default();
        assert_eq!(sm.connect(), Some(ConnectionState::Connecting));
        assert_eq!(
            sm.established().expect("handshake should complete"),
            ConnectionState::Connected
        );
        assert_eq!(sm.disconnect(), ConnectionState::Disconnected);
    }

    #[test]
    fn second_connect_is_a_no_op() {
        let mut sm = ConnectionStateMachine::default();
        assert!(sm.connect().is_some());
        assert_eq!(sm.connect(), None);
        assert_eq!(sm.state(), ConnectionState::Connecting);

        sm.established().expect("handshake should complete");
        assert_eq!(sm.connect(), None);
        assert_eq!(sm.state(), ConnectionState::Connected);
    }

    #[test]
    fn transport_error_enters_reconnect_cycle() {
        let mut sm = ConnectionStateMachine::default();
        sm.connect();
        sm.established().expect("handshake should complete");

        assert_eq!(
            sm.transport_error().expect("drop from connected"),
            ConnectionState::Reconnecting
        );
        assert_eq!(
            sm.retry().expect("retry after backoff"),
            ConnectionState::Connecting
        );
        assert_eq!(
            sm.established().expect("reconnect should complete"),
            ConnectionState::Connected
        );
    }

    #[test]
    fn unavailable_is_left_only_through_connect() {
        let mut sm = ConnectionStateMachine::default();
        sm.connect();
        sm.unavailable();
        assert_eq!(sm.state(), ConnectionState::Unavailable);

        let err = sm.retry().expect_err("retry out of unavailable must fail");
        assert_eq!(err.code, "invalid_connection_transition");

        assert_eq!(sm.connect(), Some(ConnectionState::Connecting));
    }

    #[test]
    fn rejects_established_without_connect() {
        let mut sm = ConnectionStateMachine::default();
        let err = sm.established().expect_err("must fail while disconnected");
        assert_eq!(err.code, "invalid_connection_transition");
    }

    #[test]
    fn disconnect_is_accepted_from_every_state() {
        let mut sm = ConnectionStateMachine::default();
        assert_eq!(sm.disconnect(), ConnectionState::Disconnected);

        sm.connect();
        assert_eq!(sm.disconnect(), ConnectionState::Disconnected);

        sm.connect();
        sm.established().expect("handshake should complete");
        sm.transport_error().expect("drop from connected");
        assert_eq!(sm.disconnect(), ConnectionState::Disconnected);
    }
}
