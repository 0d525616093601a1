//! Handler providers bundled with the server
//!
//! Each provider owns one feature: [`echo`] answers diagnostics, [`auth`]
//! runs the login handshake and the per-session heartbeat, and [`player`]
//! keeps player records in the write-back cache.

pub mod auth;
pub mod echo;
pub mod player;

pub use auth::AuthProvider;
pub use echo::EchoProvider;
pub use player::{PlayerInfo, PlayerProvider};

use serde_json::Value;
use shared::Args;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall clock in milliseconds since the unix epoch
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Unwraps a `json!` object literal into handler arguments
pub(crate) fn args(value: Value) -> Args {
    match value {
        Value::Object(map) => map,
        _ => Args::new(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::delivery::{DeliveryQueue, OutboundFrame, Payload};
    use crate::dispatch::{DispatchTable, DispatchTableBuilder};
    use crate::runtime::Runtime;
    use crate::scheduler::Scheduler;
    use shared::{Code, Envelope};
    use std::sync::Arc;
    use tokio::runtime::Handle;

    /// Builds and starts a runtime from a partially assembled table
    pub(crate) fn start(builder: DispatchTableBuilder) -> Runtime {
        let runtime = Runtime::new(
            builder.build(),
            Arc::new(DeliveryQueue::new()),
            Scheduler::new(Handle::current()),
            64,
        );
        runtime.start().unwrap();
        runtime
    }

    pub(crate) fn table() -> DispatchTableBuilder {
        DispatchTable::builder()
    }

    /// Pops every queued frame
    pub(crate) fn drain(runtime: &Runtime) -> Vec<OutboundFrame> {
        std::iter::from_fn(|| runtime.queue().pop()).collect()
    }

    /// Parses a queued text frame back into an envelope
    pub(crate) fn envelope(frame: &OutboundFrame) -> Envelope {
        match &frame.payload {
            Payload::Text(text) => Envelope::parse(text).unwrap(),
            Payload::Close => panic!("expected a text frame, got a close"),
        }
    }

    /// Codes of the queued text frames; closes show up as `None`
    pub(crate) fn codes(frames: &[OutboundFrame]) -> Vec<Option<Code>> {
        frames
            .iter()
            .map(|frame| match &frame.payload {
                Payload::Text(text) => Envelope::parse(text).ok().map(|e| e.value),
                Payload::Close => None,
            })
            .collect()
    }
}
