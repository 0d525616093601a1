//! Session runtime: connection lifecycle, inbound dispatch and the handler API
//!
//! The [`Runtime`] is the single object handed to every handler. It owns the
//! connection registry, the dispatch table and the scheduler, and feeds the
//! shared delivery queue. Handlers reach all shared state through it rather
//! than through globals.
//!
//! ## Inbound pipeline
//!
//! For every text frame:
//! 1. empty payloads are dropped
//! 2. the payload must parse as an envelope with an integer `value`
//! 3. the code must resolve to a dispatch entry
//! 4. the session's current state must be allowed by the entry
//! 5. the handler runs with the connection, the gated state and the args
//!
//! Any failure in steps 1-4 drops the frame without answering the client.
//! Answering would let a client discover which codes exist and which states
//! they require. Outcomes are logged at debug level only.
//!
//! The runtime does not serialize frames per connection: two frames of the
//! same connection may be dispatched concurrently on different workers.

use crate::delivery::DeliveryQueue;
use crate::dispatch::{DispatchTable, Request};
use crate::error::DispatchError;
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::scheduler::{Scheduler, TaskHandle, Tick};
use log::{debug, error, info};
use shared::{Args, Code, Envelope, EnvelopeError, Identity, State};
use std::sync::Arc;
use std::time::Duration;

/// What happened to an inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The handler for the code ran
    Handled(Code),
    Empty,
    Malformed,
    UnknownCode(Code),
    /// The session state is not allowed for the code
    Rejected { code: Code, state: State },
    /// The connection closed before the frame was dispatched
    UnknownConnection,
}

struct Inner {
    registry: ConnectionRegistry,
    queue: Arc<DeliveryQueue>,
    table: DispatchTable,
    scheduler: Scheduler,
}

/// Shared handle to the session runtime; cheap to clone
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Runtime {
    pub fn new(
        table: DispatchTable,
        queue: Arc<DeliveryQueue>,
        scheduler: Scheduler,
        max_connections: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: ConnectionRegistry::new(max_connections),
                queue,
                table,
                scheduler,
            }),
        }
    }

    /// Runs every provider's `init` hook in registration order
    pub fn start(&self) -> Result<(), DispatchError> {
        for provider in self.inner.table.providers() {
            provider.init(self)?;
            info!("provider `{}` ready", provider.name());
        }
        info!("runtime started with {} route(s)", self.inner.table.len());
        Ok(())
    }

    /// Runs every provider's `destroy` hook, then stops the scheduler
    pub fn stop(&self) {
        for provider in self.inner.table.providers() {
            provider.destroy(self);
            debug!("provider `{}` destroyed", provider.name());
        }
        self.inner.scheduler.shutdown();
        info!("runtime stopped");
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.inner.queue
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn table(&self) -> &DispatchTable {
        &self.inner.table
    }

    /// Creates the session for a newly opened connection
    ///
    /// Returns `None` when the server is at capacity.
    pub fn on_open(&self) -> Option<ConnectionId> {
        let connection = self.inner.registry.open();
        match connection {
            Some(id) => debug!("established {}", id),
            None => info!("rejecting connection: server full"),
        }
        connection
    }

    /// Destroys the session of a closed connection
    ///
    /// Removes its state and identity in one step and cancels the periodic
    /// tasks registered for it.
    pub fn on_close(&self, connection: ConnectionId) {
        self.inner.registry.close(connection);
        self.inner.scheduler.cancel_session(connection);
    }

    /// Dispatches one inbound text frame
    pub fn on_frame(&self, connection: ConnectionId, text: &str) -> FrameOutcome {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(EnvelopeError::Empty) => return FrameOutcome::Empty,
            Err(e) => {
                debug!("dropping frame from {}: {}", connection, e);
                return FrameOutcome::Malformed;
            }
        };

        let Some(state) = self.inner.registry.state(connection) else {
            debug!("dropping frame from unknown {}", connection);
            return FrameOutcome::UnknownConnection;
        };

        let outcome = self.invoke(envelope.value, state, connection, envelope.args);
        debug!("{} frame {}: {:?}", connection, envelope.value, outcome);
        outcome
    }

    /// Calls the entry for `code` as if the session were in `state`
    ///
    /// This is also the entry point for server-internal calls between
    /// handlers: the caller passes an internal-only state marker that no
    /// session ever holds, which keeps internal routes unreachable from the
    /// wire.
    pub fn invoke(
        &self,
        code: Code,
        state: State,
        connection: ConnectionId,
        args: Args,
    ) -> FrameOutcome {
        let Some(entry) = self.inner.table.get(code) else {
            return FrameOutcome::UnknownCode(code);
        };

        if !entry.allowed.permits(state) {
            return FrameOutcome::Rejected { code, state };
        }

        entry.call(
            self,
            Request {
                connection,
                state,
                args,
            },
        );
        FrameOutcome::Handled(code)
    }

    /// Queues an envelope for the connection
    pub fn push(&self, connection: ConnectionId, code: Code, args: Args) {
        match Envelope::new(code, args).to_text() {
            Ok(text) => self.inner.queue.enqueue(connection, text),
            Err(e) => error!("failed to encode frame {} for {}: {}", code, connection, e),
        }
    }

    /// Queues an envelope with empty args
    pub fn push_empty(&self, connection: ConnectionId, code: Code) {
        self.push(connection, code, Args::new());
    }

    /// Queues a raw text frame
    pub fn push_text(&self, connection: ConnectionId, text: impl Into<String>) {
        self.inner.queue.enqueue(connection, text);
    }

    /// Queues a graceful close behind every frame already queued
    pub fn quit(&self, connection: ConnectionId) {
        self.inner.queue.enqueue_close(connection);
    }

    pub fn is_open(&self, connection: ConnectionId) -> bool {
        self.inner.registry.contains(connection)
    }

    pub fn state(&self, connection: ConnectionId) -> Option<State> {
        self.inner.registry.state(connection)
    }

    pub fn set_state(&self, connection: ConnectionId, state: State) -> bool {
        self.inner.registry.set_state(connection, state)
    }

    pub fn bind_identity(&self, connection: ConnectionId, identity: Identity) -> bool {
        self.inner.registry.bind_identity(connection, identity)
    }

    pub fn lookup_connection(&self, identity: Identity) -> Option<ConnectionId> {
        self.inner.registry.lookup_by_identity(identity)
    }

    pub fn lookup_identity(&self, connection: ConnectionId) -> Option<Identity> {
        self.inner.registry.lookup_identity(connection)
    }

    /// Runs `task` once after `delay` on the worker pool
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TaskHandle
    where
        F: FnOnce(&Runtime) + Send + 'static,
    {
        let runtime = self.clone();
        self.inner.scheduler.schedule(delay, move || task(&runtime))
    }

    /// Runs `task` every `period` until it stops or is cancelled
    pub fn schedule_repeating<F>(&self, period: Duration, mut task: F) -> TaskHandle
    where
        F: FnMut(&Runtime) -> Tick + Send + 'static,
    {
        let runtime = self.clone();
        self.inner
            .scheduler
            .schedule_repeating(period, move || task(&runtime))
    }

    /// Runs `task` every `period` for as long as the connection is open
    ///
    /// Liveness is checked before each run and again before the next tick
    /// is awaited; the task is also cancelled when the connection closes.
    /// Nothing is scheduled for a connection that is already closed.
    pub fn schedule_session<F>(
        &self,
        connection: ConnectionId,
        period: Duration,
        mut task: F,
    ) -> TaskHandle
    where
        F: FnMut(&Runtime, ConnectionId) -> Tick + Send + 'static,
    {
        if !self.is_open(connection) {
            let handle = TaskHandle::default();
            handle.cancel();
            return handle;
        }

        let runtime = self.clone();
        self.inner
            .scheduler
            .schedule_session(connection, period, move || {
                if !runtime.is_open(connection) {
                    return Tick::Stop;
                }
                let tick = task(&runtime, connection);
                if runtime.is_open(connection) {
                    tick
                } else {
                    Tick::Stop
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{OutboundFrame, Payload};
    use crate::dispatch::{AllowedStates, Route};
    use serde_json::json;
    use shared::states;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::runtime::Handle;

    const GATED: Code = 500;
    const OPEN: Code = 502;
    const LOGIN_LIKE: Code = 504;
    const INTERNAL: Code = 506;

    struct Counters {
        gated: AtomicUsize,
        open: AtomicUsize,
        internal: AtomicUsize,
    }

    fn counters() -> Arc<Counters> {
        Arc::new(Counters {
            gated: AtomicUsize::new(0),
            open: AtomicUsize::new(0),
            internal: AtomicUsize::new(0),
        })
    }

    fn test_runtime(counters: &Arc<Counters>) -> Runtime {
        let gated = Arc::clone(counters);
        let open = Arc::clone(counters);
        let internal = Arc::clone(counters);

        let table = DispatchTable::builder()
            .route(
                "test",
                Route::new(
                    GATED,
                    AllowedStates::only([states::AUTHORIZED, states::GAMING]),
                    move |_, _| {
                        gated.gated.fetch_add(1, Ordering::SeqCst);
                    },
                ),
            )
            .unwrap()
            .route(
                "test",
                Route::new(OPEN, AllowedStates::Any, move |rt, req| {
                    open.open.fetch_add(1, Ordering::SeqCst);
                    rt.push(req.connection, OPEN + 1, req.args);
                }),
            )
            .unwrap()
            .route(
                "test",
                Route::new(
                    LOGIN_LIKE,
                    AllowedStates::only([states::NONE]),
                    |rt, req| {
                        rt.set_state(req.connection, states::AUTHORIZED);
                        rt.invoke(INTERNAL, states::PROGRAM, req.connection, Args::new());
                    },
                ),
            )
            .unwrap()
            .route(
                "test",
                Route::new(
                    INTERNAL,
                    AllowedStates::only([states::PROGRAM]),
                    move |_, req| {
                        assert_eq!(req.state, states::PROGRAM);
                        internal.internal.fetch_add(1, Ordering::SeqCst);
                    },
                ),
            )
            .unwrap()
            .build();

        Runtime::new(
            table,
            Arc::new(DeliveryQueue::new()),
            Scheduler::new(Handle::current()),
            16,
        )
    }

    fn drain_frames(runtime: &Runtime) -> Vec<OutboundFrame> {
        std::iter::from_fn(|| runtime.queue().pop()).collect()
    }

    #[tokio::test]
    async fn test_open_starts_in_default_state() {
        let runtime = test_runtime(&counters());
        let conn = runtime.on_open().unwrap();

        assert_eq!(runtime.state(conn), Some(states::NONE));
        assert_eq!(runtime.lookup_identity(conn), None);
        assert!(runtime.is_open(conn));
    }

    #[tokio::test]
    async fn test_gate_follows_session_state() {
        let counters = counters();
        let runtime = test_runtime(&counters);
        let conn = runtime.on_open().unwrap();
        let frame = r#"{"value":500}"#;

        assert_eq!(
            runtime.on_frame(conn, frame),
            FrameOutcome::Rejected {
                code: GATED,
                state: states::NONE
            }
        );
        assert_eq!(counters.gated.load(Ordering::SeqCst), 0);

        runtime.set_state(conn, states::AUTHORIZED);
        assert_eq!(runtime.on_frame(conn, frame), FrameOutcome::Handled(GATED));

        runtime.set_state(conn, states::GAMING);
        assert_eq!(runtime.on_frame(conn, frame), FrameOutcome::Handled(GATED));

        runtime.set_state(conn, states::PROGRAM);
        assert!(matches!(
            runtime.on_frame(conn, frame),
            FrameOutcome::Rejected { .. }
        ));

        assert_eq!(counters.gated.load(Ordering::SeqCst), 2);
        assert!(runtime.queue().is_empty());
    }

    #[tokio::test]
    async fn test_any_state_route_always_fires() {
        let counters = counters();
        let runtime = test_runtime(&counters);
        let conn = runtime.on_open().unwrap();

        for state in [states::NONE, states::AUTHORIZED, 77] {
            runtime.set_state(conn, state);
            assert_eq!(
                runtime.on_frame(conn, r#"{"value":502,"args":{"n":1}}"#),
                FrameOutcome::Handled(OPEN)
            );
        }

        assert_eq!(counters.open.load(Ordering::SeqCst), 3);
        let frames = drain_frames(&runtime);
        assert_eq!(frames.len(), 3);
        assert_eq!(
            frames[0].payload,
            Payload::Text(r#"{"value":503,"args":{"n":1}}"#.to_string())
        );
    }

    #[tokio::test]
    async fn test_silent_drops() {
        let counters = counters();
        let runtime = test_runtime(&counters);
        let conn = runtime.on_open().unwrap();

        assert_eq!(runtime.on_frame(conn, ""), FrameOutcome::Empty);
        assert_eq!(runtime.on_frame(conn, "[1,2]"), FrameOutcome::Malformed);
        assert_eq!(runtime.on_frame(conn, "not json"), FrameOutcome::Malformed);
        assert_eq!(
            runtime.on_frame(conn, r#"{"value":"502"}"#),
            FrameOutcome::Malformed
        );
        assert_eq!(
            runtime.on_frame(conn, r#"{"value":9998}"#),
            FrameOutcome::UnknownCode(9998)
        );

        assert_eq!(counters.open.load(Ordering::SeqCst), 0);
        assert!(runtime.queue().is_empty());
        assert_eq!(runtime.state(conn), Some(states::NONE));
    }

    #[tokio::test]
    async fn test_handler_transition_and_internal_call() {
        let counters = counters();
        let runtime = test_runtime(&counters);
        let conn = runtime.on_open().unwrap();

        assert_eq!(
            runtime.on_frame(conn, r#"{"value":504}"#),
            FrameOutcome::Handled(LOGIN_LIKE)
        );
        assert_eq!(runtime.state(conn), Some(states::AUTHORIZED));
        assert_eq!(counters.internal.load(Ordering::SeqCst), 1);

        // the state change closes the login route again
        assert!(matches!(
            runtime.on_frame(conn, r#"{"value":504}"#),
            FrameOutcome::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_internal_route_unreachable_from_wire() {
        let counters = counters();
        let runtime = test_runtime(&counters);
        let conn = runtime.on_open().unwrap();
        runtime.set_state(conn, states::AUTHORIZED);

        assert!(matches!(
            runtime.on_frame(conn, r#"{"value":506}"#),
            FrameOutcome::Rejected { code: INTERNAL, .. }
        ));
        assert_eq!(counters.internal.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_cleans_up_session() {
        let counters = counters();
        let runtime = test_runtime(&counters);
        let conn = runtime.on_open().unwrap();
        runtime.bind_identity(conn, 9);
        runtime.set_state(conn, states::AUTHORIZED);

        runtime.on_close(conn);

        assert!(!runtime.is_open(conn));
        assert_eq!(runtime.lookup_identity(conn), None);
        assert_eq!(runtime.lookup_connection(9), None);
        assert!(!runtime.set_state(conn, states::GAMING));
        assert_eq!(
            runtime.on_frame(conn, r#"{"value":502}"#),
            FrameOutcome::UnknownConnection
        );
        assert_eq!(counters.open.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_quit_queues_close_behind_pushes() {
        let runtime = test_runtime(&counters());
        let conn = runtime.on_open().unwrap();

        runtime.push(conn, 105, Args::new());
        runtime.quit(conn);
        runtime.push_text(conn, "late");

        let frames = drain_frames(&runtime);
        assert_eq!(
            frames.iter().map(|f| f.payload.clone()).collect::<Vec<_>>(),
            vec![
                Payload::Text(r#"{"value":105,"args":{}}"#.to_string()),
                Payload::Close,
                Payload::Text("late".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_session_task_stops_after_close() {
        let runtime = test_runtime(&counters());
        let conn = runtime.on_open().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&runs);

        runtime.schedule_session(conn, Duration::from_millis(10), move |rt, c| {
            seen.fetch_add(1, Ordering::SeqCst);
            rt.push(c, 103, json!({"beat": 1}).as_object().cloned().unwrap_or_default());
            Tick::Continue
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        runtime.on_close(conn);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let after_close = runs.load(Ordering::SeqCst);
        assert!(after_close >= 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_close);
        assert_eq!(runtime.scheduler().tracked_sessions(), 0);
    }

    #[tokio::test]
    async fn test_session_task_for_closed_connection() {
        let runtime = test_runtime(&counters());
        let conn = runtime.on_open().unwrap();
        runtime.on_close(conn);

        let handle = runtime.schedule_session(conn, Duration::from_millis(10), |_, _| {
            panic!("task for a closed connection ran")
        });

        assert!(handle.is_cancelled());
        assert_eq!(runtime.scheduler().tracked_sessions(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_schedule_passes_runtime() {
        let runtime = test_runtime(&counters());
        let conn = runtime.on_open().unwrap();

        runtime.schedule(Duration::from_millis(10), move |rt| {
            rt.set_state(conn, states::GAMING);
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(runtime.state(conn), Some(states::GAMING));
    }
}
