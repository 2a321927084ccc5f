//! Runtime context handed to components at invocation time.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::Notify;

use crate::events::EmitFn;
use crate::history::HistoryRegistry;

/// Cancellation signal shared across a run. Setting it is idempotent;
/// components observe it at their own yield points.
#[derive(Clone)]
pub struct CancelToken {
    notify: Arc<Notify>,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, std::sync::atomic::Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Current map-iteration position, set while invoking a map node's body and
/// cleared afterward.
#[derive(Debug, Clone)]
pub struct LoopContext {
    pub item: JsonValue,
    pub index: usize,
}

/// Live context passed to every component invocation: a concrete struct
/// with a typed surface rather than an untyped mutable mapping.
#[derive(Clone)]
pub struct ComponentContext {
    pub node_id: String,
    pub graph_name: Option<String>,
    pub config: HashMap<String, JsonValue>,
    pub emit: EmitFn,
    pub cancel_token: CancelToken,
    pub deadline: Option<std::time::Instant>,
    pub run_id: String,
    pub loop_ctx: Option<LoopContext>,
    pub histories: Arc<HistoryRegistry>,
}

impl ComponentContext {
    pub fn child_for_loop(&self, item: JsonValue, index: usize) -> Self {
        let mut ctx = self.clone();
        ctx.loop_ctx = Some(LoopContext { item, index });
        ctx
    }
}
