//! Per-run shared state handed to every component by `Arc`.

use crate::config::PipelineConfig;
use crate::db::DatabaseAdapter;
use crate::error::{AbortPolicy, PipelineError};
use crate::events::{Event, EventBus, EventType, Subscription};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::error;

/// The shared "should continue" flag plus the first abort cause.
#[derive(Default)]
pub struct CancelState {
    stopped: AtomicBool,
    cause: Mutex<Option<String>>,
}

impl CancelState {
    /// Marks the run as stopped. Returns `true` for the first caller only.
    pub fn stop(&self, cause: &str) -> bool {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        *self.cause.lock().unwrap_or_else(PoisonError::into_inner) = Some(cause.to_string());
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn cause(&self) -> Option<String> {
        self.cause
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct RunContext {
    run_id: String,
    config: PipelineConfig,
    adapter: Arc<dyn DatabaseAdapter>,
    events: EventBus,
    policy: AbortPolicy,
    cancel: Arc<CancelState>,
    _abort_listener: Subscription,
}

impl RunContext {
    pub fn new(config: PipelineConfig, adapter: Arc<dyn DatabaseAdapter>) -> Self {
        let events = EventBus::new(config.event_queue_capacity);
        let cancel = Arc::new(CancelState::default());
        // Aborts published by anyone (not just our own workers) stop the run.
        let listener = {
            let cancel = Arc::clone(&cancel);
            events.subscribe(
                EventType::Abort,
                move |event| {
                    if let Event::Abort { cause, .. } = event {
                        cancel.stop(cause);
                    }
                },
                false,
            )
        };
        Self {
            run_id: new_run_id(),
            policy: AbortPolicy::new(config.abort_on.iter().copied()),
            config,
            adapter,
            events,
            cancel,
            _abort_listener: listener,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn adapter(&self) -> &Arc<dyn DatabaseAdapter> {
        &self.adapter
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn policy(&self) -> &AbortPolicy {
        &self.policy
    }

    pub fn should_continue(&self) -> bool {
        !self.cancel.is_stopped()
    }

    pub fn abort_cause(&self) -> Option<String> {
        self.cancel.cause()
    }

    /// Stops the run and synchronously tells every subscriber why.
    ///
    /// Only the first abort is published; later ones are logged and ignored.
    pub fn abort(&self, err: &PipelineError, unit: Option<&str>) {
        let cause = format!("{err:#}");
        error!(error = %cause, unit = unit.unwrap_or("-"), "Aborting run");
        if self.cancel.stop(&cause) {
            self.events.publish_sync(Event::Abort {
                cause,
                unit: unit.map(str::to_string),
            });
        }
    }
}

fn new_run_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{}_{:x}", std::process::id(), nanos % 0xffff_ffff)
}
