//! Client side of the event stream
//!
//! [`StreamConsumer`] reads a turn through an [`EventTransport`], folds the
//! events into a [`ClientState`] and reconnects with backoff until a
//! terminal event arrives.

mod consumer;
mod transport;

pub use consumer::{Applied, ClientState, ReconnectPolicy, StreamConsumer};
pub use transport::{new_query_id, AskParams, EventStream, EventTransport, HttpTransport};
