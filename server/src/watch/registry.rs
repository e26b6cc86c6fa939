//! Per-root watch registry.
//!
//! The registry keeps one [`RootEntry`] per root that currently has at least
//! one subscriber. An entry owns the OS watchers for the root's targets, an
//! intake channel the watchers feed, a single debounce task draining that
//! channel, and the subscriber set.
//!
//! # Lifecycle
//!
//! - The first [`WatchRegistry::attach`] for a root resolves its targets and
//!   opens watchers on the blocking pool. Concurrent attaches for the same
//!   root await the same in-flight initialisation.
//! - An entry enters the map together with its first subscriber.
//! - [`WatchRegistry::detach`] of the last subscriber removes the entry and
//!   tears it down immediately: debounce task aborted, watchers closed,
//!   pending changes discarded.
//!
//! # Debouncing
//!
//! Relevant notifications accumulate PRD ids and re-arm a deadline of
//! [`DEBOUNCE_WINDOW`]. When the deadline passes, one [`ChangeEvent`] is
//! emitted whose `prd_id` is set only if exactly one PRD was touched and no
//! notification was ambiguous.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use crate::error::ConfigError;
use crate::roots::RootsConfig;
use crate::types::ChangeEvent;
use crate::watch::subscribers::{Subscriber, SubscriberId, SubscriberSet};
use crate::watch::targets::{resolve_watch_targets, WatchTarget};
use crate::watch::watcher::{watch_target, RawChange, RawKind, WatchMode, WatcherSet};

/// Quiet period after the last relevant notification before emitting.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(200);

/// Errors from attaching a subscriber to a root.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The root id is not in the current configuration.
    #[error("unknown root: {0}")]
    UnknownRoot(String),

    /// The configuration file could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Entry initialisation failed unexpectedly.
    #[error("watch setup failed: {0}")]
    Setup(String),
}

/// Point-in-time registry counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    /// Roots with a live entry.
    pub roots: usize,
    /// Open OS watchers across all entries.
    pub watchers: usize,
    /// Subscriber attachments across all entries.
    pub subscribers: usize,
}

type EntryInit = Shared<BoxFuture<'static, Result<Arc<RootEntry>, RegistryError>>>;

/// Watch state for one root.
struct RootEntry {
    root_id: String,
    target_count: usize,
    subscribers: Arc<SubscriberSet>,
    intake: mpsc::UnboundedSender<RawChange>,
    watchers: Arc<WatcherSet>,
    tasks: Vec<JoinHandle<()>>,
    closed: AtomicBool,
}

impl RootEntry {
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in &self.tasks {
            task.abort();
        }
        self.watchers.close();
        debug!(root_id = %self.root_id, "Root watch entry closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for RootEntry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<String, Arc<RootEntry>>,
    inits: HashMap<String, EntryInit>,
}

struct RegistryInner {
    config: RootsConfig,
    debounce: Duration,
    state: Mutex<RegistryState>,
    open_watchers: Arc<AtomicUsize>,
}

/// Registry of live root watches. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct WatchRegistry {
    inner: Arc<RegistryInner>,
}

impl WatchRegistry {
    /// Creates an empty registry reading roots from `config`.
    pub fn new(config: RootsConfig) -> Self {
        Self::with_debounce(config, DEBOUNCE_WINDOW)
    }

    /// Creates an empty registry with a custom debounce window.
    pub fn with_debounce(config: RootsConfig, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                debounce,
                state: Mutex::new(RegistryState::default()),
                open_watchers: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    /// The roots configuration this registry resolves ids against.
    pub fn config(&self) -> &RootsConfig {
        &self.inner.config
    }

    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches `subscriber` to the entry for `root_id`, creating the entry
    /// if needed.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::UnknownRoot`] if the id is not configured
    /// - [`RegistryError::Config`] if the config file cannot be loaded
    pub async fn attach(&self, root_id: &str, subscriber: &Subscriber) -> Result<(), RegistryError> {
        loop {
            let init = {
                let mut state = self.lock_state();
                if let Some(entry) = state.entries.get(root_id) {
                    entry.subscribers.insert(subscriber.clone());
                    trace!(root_id, subscriber_id = subscriber.id(), "Subscriber attached");
                    return Ok(());
                }
                state
                    .inits
                    .entry(root_id.to_string())
                    .or_insert_with(|| self.start_init(root_id))
                    .clone()
            };

            let outcome = init.clone().await;

            let mut state = self.lock_state();
            if state
                .inits
                .get(root_id)
                .is_some_and(|pending| pending.ptr_eq(&init))
            {
                state.inits.remove(root_id);
            }
            let entry = outcome?;

            if let Some(live) = state.entries.get(root_id) {
                live.subscribers.insert(subscriber.clone());
                trace!(root_id, subscriber_id = subscriber.id(), "Subscriber attached");
                return Ok(());
            }
            if entry.is_closed() {
                debug!(root_id, "Joined a closed entry, retrying");
                continue;
            }

            entry.subscribers.insert(subscriber.clone());
            state.entries.insert(root_id.to_string(), entry);
            info!(root_id, "Root watch entry activated");
            return Ok(());
        }
    }

    /// Detaches a subscriber; tears the entry down if it was the last one.
    ///
    /// Returns `true` if the subscriber was attached to `root_id`.
    pub fn detach(&self, root_id: &str, subscriber_id: SubscriberId) -> bool {
        let (removed, released) = {
            let mut state = self.lock_state();
            let Some(entry) = state.entries.get(root_id) else {
                return false;
            };
            let removed = entry.subscribers.remove(subscriber_id);
            if !entry.subscribers.is_empty() {
                return removed;
            }
            state.inits.remove(root_id);
            (removed, state.entries.remove(root_id))
        };

        if let Some(entry) = released {
            entry.shutdown();
            info!(root_id, "Root watch entry released");
        }
        removed
    }

    /// Current counters.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.lock_state();
        RegistrySnapshot {
            roots: state.entries.len(),
            watchers: self.inner.open_watchers.load(Ordering::SeqCst),
            subscribers: state
                .entries
                .values()
                .map(|entry| entry.subscribers.len())
                .sum(),
        }
    }

    /// Feeds a synthetic notification into the live entry for `root_id`, as
    /// if observed on its primary target.
    ///
    /// Returns `false` if no entry is live.
    pub fn inject_change(&self, root_id: &str, relative: Option<&str>, kind: RawKind) -> bool {
        let state = self.lock_state();
        let Some(entry) = state.entries.get(root_id) else {
            return false;
        };
        if entry.target_count == 0 {
            return false;
        }
        entry
            .intake
            .send(RawChange {
                target: 0,
                kind,
                relative: relative.map(str::to_string),
            })
            .is_ok()
    }

    /// Tears down every entry. Subscribers keep their receivers, which will
    /// simply never yield again.
    pub fn reset(&self) {
        let entries: Vec<Arc<RootEntry>> = {
            let mut state = self.lock_state();
            state.inits.clear();
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.shutdown();
        }
        if !entries.is_empty() {
            info!(released = entries.len(), "Watch registry reset");
        }
    }

    fn start_init(&self, root_id: &str) -> EntryInit {
        let root_id = root_id.to_string();
        let config = self.inner.config.clone();
        let debounce = self.inner.debounce;
        let open = Arc::clone(&self.inner.open_watchers);

        async move { build_entry(root_id, config, debounce, open).await.map(Arc::new) }
            .boxed()
            .shared()
    }
}

async fn build_entry(
    root_id: String,
    config: RootsConfig,
    debounce: Duration,
    open: Arc<AtomicUsize>,
) -> Result<RootEntry, RegistryError> {
    let lookup_id = root_id.clone();
    let targets = tokio::task::spawn_blocking(move || {
        config
            .resolve_root(&lookup_id)
            .map(|root| root.map(|root| resolve_watch_targets(&root)))
    })
    .await
    .map_err(|err| RegistryError::Setup(err.to_string()))??
    .ok_or_else(|| RegistryError::UnknownRoot(root_id.clone()))?;

    let (intake_tx, intake_rx) = mpsc::unbounded_channel();
    let subscribers = Arc::new(SubscriberSet::default());
    let watchers = Arc::new(WatcherSet::default());
    let setup_guard = SetupGuard {
        watchers: Arc::clone(&watchers),
        armed: true,
    };

    let mut tasks = {
        let root_id = root_id.clone();
        let targets = targets.clone();
        let intake = intake_tx.clone();
        let watchers = Arc::clone(&watchers);
        tokio::task::spawn_blocking(move || {
            open_targets(&root_id, &targets, &intake, &watchers, &open)
        })
        .await
        .map_err(|err| RegistryError::Setup(err.to_string()))?
    };
    setup_guard.disarm();

    tasks.push(tokio::spawn(run_debounce_loop(
        root_id.clone(),
        targets.clone(),
        intake_rx,
        Arc::clone(&subscribers),
        debounce,
    )));

    debug!(
        root_id = %root_id,
        target_count = targets.len(),
        "Root watch entry initialised"
    );

    Ok(RootEntry {
        root_id,
        target_count: targets.len(),
        subscribers,
        intake: intake_tx,
        watchers,
        tasks,
        closed: AtomicBool::new(false),
    })
}

/// Closes the watchers of an initialisation that was abandoned before its
/// entry was assembled.
struct SetupGuard {
    watchers: Arc<WatcherSet>,
    armed: bool,
}

impl SetupGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SetupGuard {
    fn drop(&mut self) {
        if self.armed {
            self.watchers.close();
        }
    }
}

/// Opens a watcher for every target; unwatchable targets are skipped.
/// Returns the fallback sync tasks.
fn open_targets(
    root_id: &str,
    targets: &[WatchTarget],
    intake: &mpsc::UnboundedSender<RawChange>,
    watchers: &Arc<WatcherSet>,
    open: &Arc<AtomicUsize>,
) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();
    for (index, target) in targets.iter().enumerate() {
        match watch_target(index, target, intake, watchers, open) {
            Ok(WatchMode::Recursive) => {}
            Ok(WatchMode::Fallback(task)) => tasks.push(task),
            Err(err) => warn!(
                root_id = %root_id,
                path = %target.path.display(),
                error = %err,
                "Skipping unwatchable target"
            ),
        }
    }
    tasks
}

/// Decides whether a notification may affect what clients display.
///
/// A notification is relevant when it has no path, names a plan file or a
/// markdown file, sits directly at PRD level, or renames something inside a
/// PRD.
pub fn is_relevant(kind: RawKind, relative: Option<&str>, prd_id: Option<&str>) -> bool {
    let Some(relative) = relative else {
        return true;
    };
    let normalized = relative.replace('\\', "/");
    let normalized = normalized.trim().trim_matches('/');
    if normalized.is_empty() {
        return true;
    }

    let file_name = normalized
        .rsplit('/')
        .next()
        .unwrap_or(normalized)
        .to_lowercase();
    if file_name == "plan.json" || file_name == "plan.md" || file_name.ends_with(".md") {
        return true;
    }
    if prd_id.is_none() {
        return false;
    }
    !normalized.contains('/') || kind == RawKind::Rename
}

/// Changes accumulated since the last flush.
#[derive(Debug, Default)]
struct PendingChanges {
    prd_ids: BTreeSet<String>,
    ambiguous: bool,
}

impl PendingChanges {
    /// Records a change; returns `false` if it was irrelevant.
    fn record(&mut self, target: &WatchTarget, change: &RawChange) -> bool {
        let prd_id = change
            .relative
            .as_deref()
            .and_then(|relative| target.prd_id_for(relative));
        if !is_relevant(change.kind, change.relative.as_deref(), prd_id.as_deref()) {
            return false;
        }
        match prd_id {
            Some(id) => {
                self.prd_ids.insert(id);
            }
            None => self.ambiguous = true,
        }
        true
    }

    /// Clears the accumulator and returns the PRD id to report.
    fn take(&mut self) -> Option<String> {
        let prd_ids = std::mem::take(&mut self.prd_ids);
        let ambiguous = std::mem::take(&mut self.ambiguous);
        if ambiguous || prd_ids.len() != 1 {
            return None;
        }
        prd_ids.into_iter().next()
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Drains an entry's intake channel and emits debounced change events.
async fn run_debounce_loop(
    root_id: String,
    targets: Vec<WatchTarget>,
    mut intake: mpsc::UnboundedReceiver<RawChange>,
    subscribers: Arc<SubscriberSet>,
    window: Duration,
) {
    let mut pending = PendingChanges::default();
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            change = intake.recv() => {
                let Some(change) = change else {
                    break;
                };
                let Some(target) = targets.get(change.target) else {
                    continue;
                };
                if pending.record(target, &change) {
                    deadline = Some(Instant::now() + window);
                } else {
                    trace!(root_id = %root_id, relative = ?change.relative, "Ignoring irrelevant change");
                }
            }
            () = sleep_until_deadline(deadline) => {
                deadline = None;
                let prd_id = pending.take();
                if subscribers.is_empty() {
                    continue;
                }
                let event = ChangeEvent::changed(root_id.clone(), prd_id);
                let delivered = subscribers.broadcast(&event);
                debug!(
                    root_id = %root_id,
                    prd_id = ?event.prd_id,
                    delivered = delivered,
                    "Emitted change event"
                );
            }
        }
    }

    debug!(root_id = %root_id, "Debounce loop terminated");
}
