//! Connection state machine for one streaming session.
//!
//! Transport callbacks arrive as [`SessionEvent`]s. Each step returns a
//! [`Transition`]: the snapshot to publish (if the event changed anything
//! visible) and the [`SessionCommand`]s the driver must carry out. The
//! machine never touches a socket or a timer itself.

use crate::feed::codec::{decode_frame, encode_subscribe};
use crate::feed::reconnect::{ReconnectScheduler, RetryContext};
use crate::models::{
    ClientSnapshot, ConnectionState, QuoteObservation, STATUS_CONNECTING, STATUS_EXHAUSTED,
};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Close code sent when the client tears the connection down itself.
pub const DELIBERATE_CLOSE_CODE: u16 = 1000;

/// Something that happened on the transport or the retry timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Opened,
    Message(String),
    Error(String),
    Closed { code: Option<u16> },
    RetryElapsed,
}

/// Side effect requested from the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Open a new connection, closing any previous one first.
    Connect,
    /// Write a text frame on the open connection.
    Send(String),
    ScheduleRetry(Duration),
    /// Cancel any pending retry and close the connection with this code.
    Close(u16),
}

/// Outcome of one state-machine step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transition {
    pub snapshot: Option<ClientSnapshot>,
    pub commands: Vec<SessionCommand>,
}

impl Transition {
    fn publish(snapshot: ClientSnapshot, commands: Vec<SessionCommand>) -> Self {
        Self {
            snapshot: Some(snapshot),
            commands,
        }
    }
}

#[derive(Debug)]
pub struct QuoteSession {
    symbol: String,
    scheduler: ReconnectScheduler,
    state: ConnectionState,
    last_observation: Option<QuoteObservation>,
    status_message: Option<String>,
    inert: bool,
}

impl QuoteSession {
    pub fn new(symbol: impl Into<String>, scheduler: ReconnectScheduler) -> Self {
        Self {
            symbol: symbol.into(),
            scheduler,
            state: ConnectionState::Idle,
            last_observation: None,
            status_message: None,
            inert: false,
        }
    }

    /// Idle -> Connecting. Has no effect on a session that already started.
    pub fn start(&mut self) -> Transition {
        if self.inert || self.state != ConnectionState::Idle {
            return Transition::default();
        }
        info!(symbol = %self.symbol, "[FEED] session starting");
        self.enter_connecting()
    }

    /// Apply one transport or timer event.
    pub fn handle(&mut self, event: SessionEvent) -> Transition {
        if self.inert {
            trace!(?event, "[FEED] event after shutdown ignored");
            return Transition::default();
        }
        match event {
            SessionEvent::Opened => self.on_open(),
            SessionEvent::Message(text) => self.on_message(&text),
            SessionEvent::Error(reason) => {
                warn!(%reason, state = self.state.as_str(), "[FEED] transport error");
                self.on_connection_lost(None)
            }
            SessionEvent::Closed { code } => self.on_connection_lost(code),
            SessionEvent::RetryElapsed => self.on_retry_elapsed(),
        }
    }

    /// Deliberate teardown. The session goes inert: every later event is a no-op
    /// and nothing more is published.
    pub fn shutdown(&mut self) -> Transition {
        if self.inert {
            return Transition::default();
        }
        self.inert = true;
        debug!(state = self.state.as_str(), "[FEED] session shut down");
        Transition {
            snapshot: None,
            commands: vec![SessionCommand::Close(DELIBERATE_CLOSE_CODE)],
        }
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            last_observation: self.last_observation,
            connection_state: self.state,
            status_message: self.status_message.clone(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_context(&self) -> RetryContext {
        self.scheduler.context()
    }

    pub fn is_inert(&self) -> bool {
        self.inert
    }

    /// True once no further event can change the session.
    pub fn is_finished(&self) -> bool {
        self.inert || self.state == ConnectionState::Failed
    }

    fn enter_connecting(&mut self) -> Transition {
        self.state = ConnectionState::Connecting;
        self.status_message = Some(STATUS_CONNECTING.to_string());
        Transition::publish(self.snapshot(), vec![SessionCommand::Connect])
    }

    fn on_open(&mut self) -> Transition {
        if self.state != ConnectionState::Connecting {
            return Transition::default();
        }
        self.scheduler.reset();
        self.state = ConnectionState::Open;
        self.status_message = None;
        info!(symbol = %self.symbol, "[FEED] connected, subscribing");

        let commands = match encode_subscribe(&self.symbol) {
            Ok(frame) => vec![SessionCommand::Send(frame)],
            Err(e) => {
                error!(error = %e, "[FEED] subscribe frame encoding failed");
                Vec::new()
            }
        };
        Transition::publish(self.snapshot(), commands)
    }

    fn on_message(&mut self, text: &str) -> Transition {
        if self.state != ConnectionState::Open {
            return Transition::default();
        }
        match decode_frame(text) {
            Ok(observation) => {
                trace!(price = observation.price(), "[FEED] tick");
                self.last_observation = Some(observation);
                Transition::publish(self.snapshot(), Vec::new())
            }
            Err(e) => {
                trace!(error = %e, "[FEED] frame dropped");
                Transition::default()
            }
        }
    }

    fn on_connection_lost(&mut self, code: Option<u16>) -> Transition {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            return Transition::default();
        }
        match self.scheduler.on_unexpected_close() {
            Some(delay) => {
                self.state = ConnectionState::Closed;
                self.status_message = Some(STATUS_CONNECTING.to_string());
                warn!(
                    ?code,
                    attempt = self.scheduler.attempt_count(),
                    max_attempts = self.scheduler.config().max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "[FEED] connection lost, retry scheduled"
                );
                Transition::publish(self.snapshot(), vec![SessionCommand::ScheduleRetry(delay)])
            }
            None => {
                self.state = ConnectionState::Failed;
                self.status_message = Some(STATUS_EXHAUSTED.to_string());
                error!(
                    ?code,
                    attempts = self.scheduler.attempt_count(),
                    max_attempts = self.scheduler.config().max_attempts,
                    "[FEED] retry budget exhausted, giving up"
                );
                Transition::publish(self.snapshot(), Vec::new())
            }
        }
    }

    fn on_retry_elapsed(&mut self) -> Transition {
        if self.state != ConnectionState::Closed {
            return Transition::default();
        }
        debug!(attempt = self.scheduler.attempt_count(), "[FEED] retrying");
        self.enter_connecting()
    }
}
