//! Login handshake and session heartbeat
//!
//! A client logs in with `{"uid": <int>, "secret": <string>}` while its
//! session is still in the default state. The secret is shared by every
//! client; it comes from configuration or is generated when the provider
//! starts.
//!
//! A successful login:
//! 1. evicts any other connection holding the same uid (notice, then close)
//! 2. binds the uid to the new connection and marks it authorized
//! 3. answers with the login result
//! 4. starts the heartbeat for the connection
//! 5. hands the uid to the player provider through an internal call
//!
//! Bad parameters and wrong secrets get an error frame followed by a close.

use super::{args, timestamp_millis};
use crate::dispatch::{AllowedStates, Provider, Request, Route};
use crate::error::DispatchError;
use crate::runtime::Runtime;
use crate::scheduler::Tick;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use shared::{codes, states};
use std::sync::Arc;
use std::time::Duration;

pub struct AuthProvider {
    secret: RwLock<Option<String>>,
    heartbeat: Duration,
    /// Held from the holder lookup until the new binding is in place
    handover: Mutex<()>,
}

impl AuthProvider {
    /// `secret` of `None` makes [`init`](Provider::init) generate one
    pub fn new(secret: Option<String>, heartbeat: Duration) -> Self {
        Self {
            secret: RwLock::new(secret),
            heartbeat,
            handover: Mutex::new(()),
        }
    }

    /// The secret clients must present, once known
    pub fn secret(&self) -> Option<String> {
        self.secret.read().clone()
    }

    fn login(&self, rt: &Runtime, req: Request) {
        let connection = req.connection;

        let (Some(uid), Some(secret)) = (req.arg_i64("uid"), req.arg_str("secret")) else {
            debug!("{} sent a login without uid/secret", connection);
            rt.push_empty(connection, codes::PARAM_ERROR);
            rt.quit(connection);
            return;
        };

        if self.secret.read().as_deref() != Some(secret) {
            warn!("{} presented a wrong secret for uid {}", connection, uid);
            rt.push_empty(connection, codes::SECRET_ERROR);
            rt.quit(connection);
            return;
        }

        {
            let _handover = self.handover.lock();

            if let Some(previous) = rt.lookup_connection(uid).filter(|&c| c != connection) {
                info!("uid {} logged in again, evicting {}", uid, previous);
                rt.push_empty(previous, codes::OTHER_LOGIN);
                rt.quit(previous);
            }

            if !rt.bind_identity(connection, uid) {
                debug!("{} closed during login", connection);
                return;
            }
            rt.set_state(connection, states::AUTHORIZED);
            rt.push(
                connection,
                codes::LOGIN_SUCCESS,
                args(json!({ "uid": uid, "timestamp": timestamp_millis() })),
            );
        }
        info!("uid {} logged in on {}", uid, connection);

        rt.schedule_session(connection, self.heartbeat, |rt, connection| {
            rt.push(
                connection,
                codes::HEARTBEAT,
                args(json!({ "heartbeat": timestamp_millis() })),
            );
            Tick::Continue
        });

        rt.invoke(
            codes::PLAYER_CHECK,
            states::PROGRAM,
            connection,
            args(json!({ "uid": uid })),
        );
    }
}

impl Provider for AuthProvider {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn routes(self: Arc<Self>) -> Vec<Route> {
        vec![Route::new(
            codes::LOGIN,
            AllowedStates::only([states::NONE]),
            move |rt, req| self.login(rt, req),
        )]
    }

    fn init(&self, _runtime: &Runtime) -> Result<(), DispatchError> {
        let mut secret = self.secret.write();
        if secret.as_deref() == Some("") {
            return Err(DispatchError::Init {
                provider: self.name(),
                reason: "login secret must not be empty".to_string(),
            });
        }
        if secret.is_none() {
            let bytes: [u8; 16] = rand::random();
            let generated: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
            warn!("no login secret configured, generated: {}", generated);
            *secret = Some(generated);
        }
        Ok(())
    }
}
