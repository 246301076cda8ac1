//! 请求批处理模块：在短时间窗口内合并兼容请求为一次厂商调用。
//!
//! # Request Batching Module
//!
//! Requests flagged `batchable` for the same model with the same semantic
//! parameters share a [`BatchWindow`]. The first member opens the window; it is
//! flushed as one [`ProviderInvoker::invoke_batch`] call when it reaches
//! `max_members` or when `max_wait` elapses, whichever comes first. Results are
//! handed back to members in submission order.
//!
//! Batching is transparent to callers: a member receives exactly the result it
//! would have received from a direct `invoke`.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Batcher`] | Routes calls to open windows and flushes them |
//! | [`BatchConfig`] | `enabled`, `max_wait_ms`, `max_members` |
//! | [`BatchWindow`] | Ordered members plus open time and limits |
//! | [`FlushReason`] | Why a window was flushed |

mod collector;

pub use collector::{BatchAddResult, BatchItem, BatchWindow};

use crate::config::duration_ms;
use crate::error::PROVIDER_CALL_STAGE;
use crate::provider::{InvokeResult, ProviderInvoker, ProviderRequest};
use crate::telemetry::{record_quietly, MetricAttributes, MetricEvent, MetricsSink};
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub enabled: bool,
    /// Longest a member may wait for its window to flush.
    #[serde(rename = "max_wait_ms", with = "duration_ms")]
    pub max_wait: Duration,
    pub max_members: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_wait: Duration::from_millis(20),
            max_members: 8,
        }
    }
}

impl BatchConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
    pub fn with_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = wait;
        self
    }
    pub fn with_max_members(mut self, n: usize) -> Self {
        self.max_members = n;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    Full,
    MaxWait,
}

impl FlushReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushReason::Full => "full",
            FlushReason::MaxWait => "max_wait",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSnapshot {
    pub open_windows: usize,
    pub pending_members: usize,
    pub flushed_windows: u64,
}

/// Windows are per model and per semantic parameter set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    model: String,
    params: String,
}

impl WindowKey {
    fn of(request: &ProviderRequest) -> Self {
        let semantic: BTreeMap<_, _> = request.params.semantic().collect();
        Self {
            model: request.model.clone(),
            params: serde_json::to_string(&semantic).unwrap_or_default(),
        }
    }
}

struct Member {
    request: ProviderRequest,
    reply: oneshot::Sender<Result<InvokeResult>>,
}

struct OpenWindow {
    id: u64,
    window: BatchWindow<Member>,
}

type Windows = Arc<Mutex<HashMap<WindowKey, OpenWindow>>>;

pub struct Batcher {
    config: BatchConfig,
    invoker: Arc<dyn ProviderInvoker>,
    sink: Arc<dyn MetricsSink>,
    windows: Windows,
    next_id: AtomicU64,
    flushed: Arc<AtomicU64>,
}

impl Batcher {
    pub fn new(
        config: BatchConfig,
        invoker: Arc<dyn ProviderInvoker>,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            config,
            invoker,
            sink,
            windows: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            flushed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Whether `request` goes through a batch window.
    pub fn accepts(&self, request: &ProviderRequest) -> bool {
        self.config.enabled && request.params.batchable() && !request.params.is_streaming()
    }

    /// Issues `request`, through a batch window when it is batchable.
    ///
    /// The outer error is a pipeline failure (timeout, broken batch); the inner
    /// result is the provider's own answer for this request.
    pub async fn call(&self, request: ProviderRequest, deadline: Option<Instant>) -> Result<InvokeResult> {
        if !self.accepts(&request) {
            let invoke = self.invoker.invoke(request);
            return match deadline {
                Some(d) => tokio::time::timeout_at(d, invoke)
                    .await
                    .map_err(|_| Error::timeout(PROVIDER_CALL_STAGE)),
                None => Ok(invoke.await),
            };
        }

        let rx = self.join(request);
        let wait = async {
            rx.await.unwrap_or_else(|_| {
                Err(Error::runtime_with_context(
                    "batch dropped before replying",
                    ErrorContext::new().with_source("batcher"),
                ))
            })
        };
        match deadline {
            Some(d) => tokio::time::timeout_at(d, wait)
                .await
                .unwrap_or_else(|_| Err(Error::timeout("batch window"))),
            None => wait.await,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<WindowKey, OpenWindow>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn join(&self, request: ProviderRequest) -> oneshot::Receiver<Result<InvokeResult>> {
        let (reply, rx) = oneshot::channel();
        let key = WindowKey::of(&request);
        let item = BatchItem::new(Member {
            reply,
            request: request.clone(),
        })
        .with_request_id(request.request_id);

        let mut windows = self.lock();
        let open = windows.entry(key.clone()).or_insert_with(|| {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let window = BatchWindow::open(self.config.max_wait, self.config.max_members);
            self.spawn_timer(key.clone(), id, window.deadline());
            OpenWindow { id, window }
        });
        let added = open.window.add(item);
        tracing::debug!(model = %key.model, members = added.count(), "joined batch window");
        let full = if added.should_flush() {
            windows.remove(&key)
        } else {
            None
        };
        drop(windows);
        if let Some(full) = full {
            self.spawn_flush(key.model, full.window, FlushReason::Full);
        }
        rx
    }

    fn spawn_timer(&self, key: WindowKey, id: u64, at: Instant) {
        let windows = Arc::clone(&self.windows);
        let invoker = Arc::clone(&self.invoker);
        let sink = Arc::clone(&self.sink);
        let flushed = Arc::clone(&self.flushed);
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            let expired = {
                let mut map = windows.lock().unwrap_or_else(PoisonError::into_inner);
                // The window may already have flushed full and been replaced.
                match map.get(&key) {
                    Some(open) if open.id == id => map.remove(&key),
                    _ => None,
                }
            };
            if let Some(open) = expired {
                flush(invoker, sink, flushed, key.model, open.window, FlushReason::MaxWait).await;
            }
        });
    }

    fn spawn_flush(&self, model: String, window: BatchWindow<Member>, reason: FlushReason) {
        tokio::spawn(flush(
            Arc::clone(&self.invoker),
            Arc::clone(&self.sink),
            Arc::clone(&self.flushed),
            model,
            window,
            reason,
        ));
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        let windows = self.lock();
        BatchSnapshot {
            open_windows: windows.len(),
            pending_members: windows.values().map(|w| w.window.len()).sum(),
            flushed_windows: self.flushed.load(Ordering::Relaxed),
        }
    }
}

async fn flush(
    invoker: Arc<dyn ProviderInvoker>,
    sink: Arc<dyn MetricsSink>,
    flushed: Arc<AtomicU64>,
    model: String,
    window: BatchWindow<Member>,
    reason: FlushReason,
) {
    let waited = window.opened_at().elapsed();
    let items = window.into_items();
    let longest_member_wait = items
        .iter()
        .map(|item| item.added_at.elapsed())
        .max()
        .unwrap_or_default();
    let (requests, replies): (Vec<_>, Vec<_>) = items
        .into_iter()
        .map(|item| (item.data.request, item.data.reply))
        .unzip();
    let members = requests.len();
    flushed.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(model = %model, members, reason = reason.as_str(), "flushing batch window");
    record_quietly(
        sink.as_ref(),
        MetricEvent::BatchFlush,
        &MetricAttributes::new()
            .with("model", &model)
            .with("members", members)
            .with("reason", reason.as_str())
            .with("waited_ms", waited.as_millis())
            .with("max_member_wait_ms", longest_member_wait.as_millis()),
    );

    let results = invoker.invoke_batch(requests).await;
    if results.len() != members {
        tracing::warn!(model = %model, members, results = results.len(), "batch result count mismatch");
        let err = Error::runtime_with_context(
            format!("batch returned {} results for {} members", results.len(), members),
            ErrorContext::new().with_source("batcher"),
        );
        for reply in replies {
            let _ = reply.send(Err(err.clone()));
        }
        return;
    }
    // A member that stopped waiting has dropped its receiver.
    for (reply, result) in replies.into_iter().zip(results) {
        let _ = reply.send(Ok(result));
    }
}
