//! Wire protocol shared by the session server and its clients.
//!
//! Every frame on the wire is a text frame holding one JSON object:
//!
//! ```text
//! { "value": <int>, "args": { ... } }
//! ```
//!
//! `value` is the dispatch code selecting a handler, `args` an opaque object
//! handed to that handler. Codes follow the even/odd convention: even codes
//! are requests sent by clients, odd codes are responses and pushes sent by
//! the server.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Integer identifying a logical operation
pub type Code = i32;

/// Opaque per-session logic state
pub type State = i32;

/// Identity bound to a session after login
pub type Identity = i64;

/// Structured arguments carried by an envelope
pub type Args = Map<String, Value>;

/// Protocol codes understood by the bundled handlers
pub mod codes {
    use super::Code;

    /// Echo the request arguments back to the sender
    pub const ECHO: Code = 10;
    /// A request carried missing or malformed parameters
    pub const PARAM_ERROR: Code = 11;

    /// Login with `{ "uid": <int>, "secret": <string> }`
    pub const LOGIN: Code = 100;
    /// Login secret did not match
    pub const SECRET_ERROR: Code = 101;
    /// Periodic keep-alive pushed by the server
    pub const HEARTBEAT: Code = 103;
    /// The identity logged in from another connection
    pub const OTHER_LOGIN: Code = 105;
    /// Login accepted
    pub const LOGIN_SUCCESS: Code = 107;
    /// Instructs the client to switch scene
    pub const CHANGE_SCENE: Code = 121;

    /// Internal only: load or create the player for a freshly bound identity
    pub const PLAYER_CHECK: Code = 300;
    /// Grant gold to the current player
    pub const PLAYER_ADD_GOLD: Code = 302;
    /// Current gold balance
    pub const PLAYER_GOLD: Code = 303;
    /// Request the current player record
    pub const PLAYER_INFO: Code = 304;
    /// Player record response
    pub const PLAYER_INFO_RESULT: Code = 305;

    /// Returns true for codes a client is expected to send
    pub fn is_request(code: Code) -> bool {
        code % 2 == 0
    }
}

/// Logic states assigned to sessions by handlers
pub mod states {
    use super::State;

    /// Freshly opened, not logged in. The only state the runtime assigns itself.
    pub const NONE: State = 0;
    /// Login completed
    pub const AUTHORIZED: State = 1;
    /// Marker for server-internal calls; never assigned to a session
    pub const PROGRAM: State = 2;
    /// Inside a game scene
    pub const GAMING: State = 3;
}

/// Reasons an inbound frame could not be read as an envelope
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("empty frame")]
    Empty,
    #[error("frame is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a json object")]
    NotObject,
    #[error("frame has no integer `value` field")]
    MissingCode,
}

/// The `{value, args}` message shape used in both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub value: Code,
    #[serde(default)]
    pub args: Args,
}

impl Envelope {
    pub fn new(value: Code, args: Args) -> Self {
        Self { value, args }
    }

    /// An envelope with an empty argument object
    pub fn empty(value: Code) -> Self {
        Self::new(value, Args::new())
    }

    /// Parses an inbound text frame
    ///
    /// The payload must be a JSON object whose `value` is an integer in the
    /// 32-bit range. `args` is kept when it is an object and replaced by an
    /// empty object otherwise, so handlers always receive an object.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        if text.is_empty() {
            return Err(EnvelopeError::Empty);
        }

        let json: Value = serde_json::from_str(text)?;
        let Value::Object(mut object) = json else {
            return Err(EnvelopeError::NotObject);
        };

        let value = object
            .get("value")
            .and_then(Value::as_i64)
            .and_then(|v| Code::try_from(v).ok())
            .ok_or(EnvelopeError::MissingCode)?;

        let args = match object.remove("args") {
            Some(Value::Object(args)) => args,
            _ => Args::new(),
        };

        Ok(Self { value, args })
    }

    /// Serializes the envelope into an outbound text frame
    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
