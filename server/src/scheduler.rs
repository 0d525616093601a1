//! Delayed and periodic task facility shared by the runtime and handlers
//!
//! Timers live on the tokio reactor, the task bodies run on the blocking
//! worker pool so they may perform blocking storage calls. Periodic tasks
//! are cancelled cooperatively: every tick checks the task's cancellation
//! flag (and the scheduler-wide shutdown flag) before doing any work and
//! again before waiting for the next tick.
//!
//! Tasks tied to one connection are registered under its id with
//! [`Scheduler::schedule_session`] and torn down together by
//! [`Scheduler::cancel_session`] when the connection closes.

use crate::registry::ConnectionId;
use log::{debug, error};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Returned by periodic tasks to decide whether they run again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Continue,
    Stop,
}

/// Cancellation handle for a scheduled task
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    fn new() -> Self {
        Self::default()
    }

    /// Prevents any further run of the task
    ///
    /// A run already in progress finishes normally.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn same_task(&self, other: &TaskHandle) -> bool {
        Arc::ptr_eq(&self.cancelled, &other.cancelled)
    }
}

type SessionTasks = Arc<Mutex<HashMap<ConnectionId, Vec<TaskHandle>>>>;

pub struct Scheduler {
    handle: Handle,
    shutdown: Arc<AtomicBool>,
    sessions: SessionTasks,
}

impl Scheduler {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            shutdown: Arc::new(AtomicBool::new(false)),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs `task` once after `delay`
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let token = TaskHandle::new();
        let guard = token.clone();
        let shutdown = Arc::clone(&self.shutdown);

        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if guard.is_cancelled() || shutdown.load(Ordering::Acquire) {
                return;
            }
            if let Err(e) = tokio::task::spawn_blocking(task).await {
                error!("scheduled task failed: {}", e);
            }
        });

        token
    }

    /// Runs `task` every `period`, first after one full period
    ///
    /// The task keeps running until it returns [`Tick::Stop`], its handle is
    /// cancelled, or the scheduler shuts down. Runs never overlap; a run that
    /// overruns the period delays the next one instead of piling up.
    pub fn schedule_repeating<F>(&self, period: Duration, task: F) -> TaskHandle
    where
        F: FnMut() -> Tick + Send + 'static,
    {
        let token = TaskHandle::new();
        self.spawn_repeating(period, token.clone(), None, task);
        token
    }

    /// Like [`schedule_repeating`](Self::schedule_repeating), tracked under
    /// the connection so it is cancelled when the connection closes
    ///
    /// The registration is dropped again once the task ends on its own.
    pub fn schedule_session<F>(&self, connection: ConnectionId, period: Duration, task: F) -> TaskHandle
    where
        F: FnMut() -> Tick + Send + 'static,
    {
        let token = TaskHandle::new();
        self.sessions
            .lock()
            .entry(connection)
            .or_default()
            .push(token.clone());
        self.spawn_repeating(period, token.clone(), Some(connection), task);
        token
    }

    /// Cancels every task registered for the connection
    pub fn cancel_session(&self, connection: ConnectionId) -> usize {
        let tokens = self.sessions.lock().remove(&connection).unwrap_or_default();
        for token in &tokens {
            token.cancel();
        }
        if !tokens.is_empty() {
            debug!("cancelled {} task(s) for {}", tokens.len(), connection);
        }
        tokens.len()
    }

    /// Number of connections with registered tasks
    pub fn tracked_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Stops every outstanding task; nothing scheduled afterwards will run
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for (_, tokens) in self.sessions.lock().drain() {
            for token in tokens {
                token.cancel();
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn spawn_repeating<F>(
        &self,
        period: Duration,
        token: TaskHandle,
        session: Option<ConnectionId>,
        mut task: F,
    ) where
        F: FnMut() -> Tick + Send + 'static,
    {
        let shutdown = Arc::clone(&self.shutdown);
        let sessions = Arc::clone(&self.sessions);
        let guard = token.clone();
        let stopped = move || guard.is_cancelled() || shutdown.load(Ordering::Acquire);

        self.handle.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if stopped() {
                    break;
                }

                let run = tokio::task::spawn_blocking(move || {
                    let tick = task();
                    (task, tick)
                })
                .await;

                match run {
                    Ok((returned, Tick::Continue)) => task = returned,
                    Ok((_, Tick::Stop)) => break,
                    Err(e) => {
                        error!("periodic task failed: {}", e);
                        break;
                    }
                }

                if stopped() {
                    break;
                }
            }

            if let Some(connection) = session {
                untrack(&sessions, connection, &token);
            }
        });
    }
}

fn untrack(sessions: &Mutex<HashMap<ConnectionId, Vec<TaskHandle>>>, connection: ConnectionId, token: &TaskHandle) {
    let mut sessions = sessions.lock();
    if let Some(tokens) = sessions.get_mut(&connection) {
        tokens.retain(|t| !t.same_task(token));
        if tokens.is_empty() {
            sessions.remove(&connection);
        }
    }
}
