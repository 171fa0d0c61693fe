//! Session state machine.
//!
//! Both peers drive the same machine. Transitions are pure; the caller maps
//! a received or sent message onto a [`SessionEvent`] and asks the current
//! state to advance. Anything the table does not allow is a protocol
//! violation and closes the session without side effects.

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::Message;

/// Session lifecycle states.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SessionState {
    /// Awaiting the `HELLO`/`HELLO_ACK` exchange.
    #[default]
    Negotiating,
    /// Negotiated; between files.
    Ready,
    /// A file transfer is in flight.
    InFile,
    /// `BYE` received; flushing final stats.
    Draining,
    /// Terminal.
    Closed,
}

/// Events that advance the session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionEvent {
    /// `HELLO`/`HELLO_ACK` matched with at least one common feature set
    /// (raw copy always qualifies).
    Negotiated,
    /// `FILE_SEND` opened a transfer.
    FileStarted,
    /// `FILE_ACK` closed the transfer, successfully or not.
    FileAcked,
    /// `BYE` requested a graceful shutdown.
    ByeRequested,
    /// The final `STATS` flush completed.
    StatsFlushed,
    /// `ERR` or a transport failure.
    Fatal,
}

impl SessionState {
    /// Short name for diagnostics.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Negotiating => "NEGOTIATING",
            Self::Ready => "READY",
            Self::InFile => "IN_FILE",
            Self::Draining => "DRAINING",
            Self::Closed => "CLOSED",
        }
    }

    /// Returns `true` once the session is terminal.
    #[must_use]
    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }

    /// Advances by one event. Disallowed combinations return
    /// [`ProtocolError::BadTransition`] and the caller must close.
    pub fn advance(self, event: SessionEvent) -> ProtocolResult<SessionState> {
        use SessionEvent as E;
        use SessionState as S;

        if event == E::Fatal {
            return Ok(S::Closed);
        }
        let next = match (self, event) {
            (S::Negotiating, E::Negotiated) => S::Ready,
            (S::Ready, E::FileStarted) => S::InFile,
            (S::InFile, E::FileAcked) => S::Ready,
            (S::Ready, E::ByeRequested) => S::Draining,
            (S::Draining, E::StatsFlushed) => S::Closed,
            (state, event) => {
                return Err(ProtocolError::BadTransition {
                    state: state.name(),
                    message: event_name(event),
                });
            }
        };
        Ok(next)
    }

    /// Maps an incoming message to the event it represents for the peer
    /// receiving it, or `None` for messages that do not change state
    /// (bulk frames and mid-file chatter).
    #[must_use]
    pub fn classify_incoming(message: &Message) -> Option<SessionEvent> {
        match message {
            Message::Hello { .. } | Message::HelloAck { .. } => Some(SessionEvent::Negotiated),
            Message::FileSend { .. } => Some(SessionEvent::FileStarted),
            Message::FileAck { .. } => Some(SessionEvent::FileAcked),
            Message::Bye { .. } => Some(SessionEvent::ByeRequested),
            Message::Stats { .. } => Some(SessionEvent::StatsFlushed),
            Message::Err { .. } => Some(SessionEvent::Fatal),
            Message::Env { .. }
            | Message::FileRecv { .. }
            | Message::Bytes { .. }
            | Message::EndBytes { .. }
            | Message::Prime { .. } => None,
        }
    }
}

fn event_name(event: SessionEvent) -> &'static str {
    match event {
        SessionEvent::Negotiated => "HELLO",
        SessionEvent::FileStarted => "FILE_SEND",
        SessionEvent::FileAcked => "FILE_ACK",
        SessionEvent::ByeRequested => "BYE",
        SessionEvent::StatsFlushed => "STATS",
        SessionEvent::Fatal => "ERR",
    }
}
