//! Diagnostic echo

use crate::dispatch::{AllowedStates, Provider, Route};
use log::error;
use shared::codes;
use std::sync::Arc;

/// Sends the request's arguments back to the caller as a raw text frame.
/// Reachable in any state; a request without arguments gets no answer.
pub struct EchoProvider;

impl Provider for EchoProvider {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn routes(self: Arc<Self>) -> Vec<Route> {
        vec![Route::new(codes::ECHO, AllowedStates::Any, |rt, req| {
            if req.args.is_empty() {
                return;
            }
            match serde_json::to_string(&req.args) {
                Ok(text) => rt.push_text(req.connection, text),
                Err(e) => error!("failed to encode echo for {}: {}", req.connection, e),
            }
        })]
    }
}
