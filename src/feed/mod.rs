//! Quote feed client.
//!
//! Responsibilities:
//! • Maintain one WebSocket connection to the quote stream and subscribe to a symbol.
//! • Keep the latest decoded price tick.
//! • Handle reconnection and backoff, giving up after a bounded number of retries.

pub mod client;
pub mod codec;
pub mod reconnect;
pub mod session;

pub use client::{SessionHandle, StreamingQuoteClient};
pub use codec::{DecodeError, decode_frame, encode_subscribe};
pub use reconnect::{ReconnectConfig, ReconnectScheduler, RetryContext};
pub use session::{DELIBERATE_CLOSE_CODE, QuoteSession, SessionCommand, SessionEvent, Transition};
