//! Resilient streaming client for a single live quote.
//!
//! [`StreamingQuoteClient`] keeps one WebSocket subscription alive, decodes
//! price ticks and hands a full [`ClientSnapshot`] to the consumer after every
//! change. Connection loss is retried with bounded backoff.

pub mod config;
pub mod errors;
pub mod feed;
pub mod models;
pub mod utils;

pub use config::ClientConfig;
pub use errors::{AppError, Result};
pub use feed::{SessionHandle, StreamingQuoteClient};
pub use models::{ClientSnapshot, ConnectionState, QuoteObservation};
