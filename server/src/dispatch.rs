//! Static routing from protocol codes to state-gated handlers
//!
//! Handler providers register their routes explicitly while the table is
//! being built. Each route names its protocol code, the session states
//! allowed to reach it and the handler to run. Once built the table is
//! immutable and shared by every dispatch.

use crate::error::DispatchError;
use crate::registry::ConnectionId;
use crate::runtime::Runtime;
use log::debug;
use serde_json::Value;
use shared::{Args, Code, State};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Session states permitted to invoke a route
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedStates {
    /// Reachable regardless of state
    Any,
    Only(BTreeSet<State>),
}

impl AllowedStates {
    /// Builds a restricted set; an empty set means [`AllowedStates::Any`]
    pub fn only(states: impl IntoIterator<Item = State>) -> Self {
        let states: BTreeSet<State> = states.into_iter().collect();
        if states.is_empty() {
            Self::Any
        } else {
            Self::Only(states)
        }
    }

    pub fn permits(&self, state: State) -> bool {
        match self {
            Self::Any => true,
            Self::Only(states) => states.contains(&state),
        }
    }
}

/// Inputs handed to a handler
#[derive(Debug, Clone)]
pub struct Request {
    pub connection: ConnectionId,
    /// State the call was gated against
    pub state: State,
    pub args: Args,
}

impl Request {
    /// Integer argument, if present and numeric
    pub fn arg_i64(&self, key: &str) -> Option<i64> {
        self.args.get(key).and_then(Value::as_i64)
    }

    /// String argument, if present and textual
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }
}

pub type Handler = Arc<dyn Fn(&Runtime, Request) + Send + Sync>;

/// One registration returned by a provider
pub struct Route {
    pub code: Code,
    pub allowed: AllowedStates,
    handler: Handler,
}

impl Route {
    pub fn new<F>(code: Code, allowed: AllowedStates, handler: F) -> Self
    where
        F: Fn(&Runtime, Request) + Send + Sync + 'static,
    {
        Self {
            code,
            allowed,
            handler: Arc::new(handler),
        }
    }
}

/// A resolved table entry
pub struct DispatchEntry {
    pub code: Code,
    pub allowed: AllowedStates,
    /// Name of the provider that registered the route
    pub provider: &'static str,
    handler: Handler,
}

impl DispatchEntry {
    pub fn call(&self, runtime: &Runtime, request: Request) {
        (self.handler)(runtime, request)
    }
}

impl fmt::Debug for DispatchEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchEntry")
            .field("code", &self.code)
            .field("allowed", &self.allowed)
            .field("provider", &self.provider)
            .finish()
    }
}

/// A group of related handlers with optional lifecycle hooks
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Every route this provider exposes
    fn routes(self: Arc<Self>) -> Vec<Route>;

    /// Called once before the server accepts connections
    fn init(&self, _runtime: &Runtime) -> Result<(), DispatchError> {
        Ok(())
    }

    /// Called once during shutdown
    fn destroy(&self, _runtime: &Runtime) {}
}

/// Immutable code -> entry lookup assembled at startup
pub struct DispatchTable {
    entries: HashMap<Code, DispatchEntry>,
    providers: Vec<Arc<dyn Provider>>,
}

impl DispatchTable {
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder::default()
    }

    pub fn get(&self, code: Code) -> Option<&DispatchEntry> {
        self.entries.get(&code)
    }

    /// Registered codes in ascending order
    pub fn codes(&self) -> Vec<Code> {
        let mut codes: Vec<Code> = self.entries.keys().copied().collect();
        codes.sort_unstable();
        codes
    }

    /// Providers in registration order
    pub fn providers(&self) -> &[Arc<dyn Provider>] {
        &self.providers
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Default)]
pub struct DispatchTableBuilder {
    entries: HashMap<Code, DispatchEntry>,
    providers: Vec<Arc<dyn Provider>>,
}

impl DispatchTableBuilder {
    /// Registers every route of a provider
    ///
    /// Fails if any of its codes is already taken.
    pub fn provider<P: Provider + 'static>(mut self, provider: Arc<P>) -> Result<Self, DispatchError> {
        let name = provider.name();
        for route in Arc::clone(&provider).routes() {
            self = self.route(name, route)?;
        }
        self.providers.push(provider);
        Ok(self)
    }

    /// Registers a single route on behalf of `provider`
    pub fn route(mut self, provider: &'static str, route: Route) -> Result<Self, DispatchError> {
        if let Some(existing) = self.entries.get(&route.code) {
            return Err(DispatchError::DuplicateCode {
                code: route.code,
                existing: existing.provider,
                provider,
            });
        }

        debug!(
            "route {} -> {} ({:?})",
            route.code, provider, route.allowed
        );
        self.entries.insert(
            route.code,
            DispatchEntry {
                code: route.code,
                allowed: route.allowed,
                provider,
                handler: route.handler,
            },
        );
        Ok(self)
    }

    pub fn build(self) -> DispatchTable {
        DispatchTable {
            entries: self.entries,
            providers: self.providers,
        }
    }
}
