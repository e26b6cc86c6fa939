//! OS watchers for watch targets.
//!
//! Each target is watched recursively when the platform allows it. When a
//! recursive watch cannot be opened the target is watched non-recursively
//! and one extra non-recursive watcher is kept per PRD-shaped child
//! directory; any event on the target re-syncs that child set.
//!
//! Watchers never follow symlinks, so a linked directory inside a target is
//! not descended into in either mode.
//!
//! The notify callbacks are kept lightweight: they translate events into
//! [`RawChange`]s and push them onto the owning entry's unbounded intake
//! channel. All classification and debouncing happens on the entry's task.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::mem;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::paths::contain_in_root;
use crate::watch::targets::WatchTarget;

/// Coarse classification of a filesystem notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    /// Entries appeared, disappeared or were renamed.
    Rename,
    /// Content or metadata of an existing entry changed.
    Change,
}

/// One raw notification, tagged with the target it was observed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    /// Index into the entry's target list.
    pub target: usize,
    pub kind: RawKind,
    /// Path relative to the target, when the platform reported one.
    pub relative: Option<String>,
}

/// Maps a notify event kind; access events are dropped.
pub fn classify_kind(kind: &EventKind) -> Option<RawKind> {
    match kind {
        EventKind::Access(_) => None,
        EventKind::Create(_) | EventKind::Remove(_) => Some(RawKind::Rename),
        EventKind::Modify(ModifyKind::Name(_)) => Some(RawKind::Rename),
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => Some(RawKind::Change),
    }
}

/// A live OS watcher, counted in the registry's open-watcher gauge while it
/// exists.
pub struct WatchHandle {
    _watcher: RecommendedWatcher,
    open: Arc<AtomicUsize>,
}

impl WatchHandle {
    fn new(watcher: RecommendedWatcher, open: &Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self {
            _watcher: watcher,
            open: Arc::clone(open),
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Forwards notify events from one target into an entry's intake channel.
#[derive(Clone)]
struct Forwarder {
    target_index: usize,
    target: WatchTarget,
    intake: mpsc::UnboundedSender<RawChange>,
}

impl Forwarder {
    fn forward(&self, event: &Event) {
        let Some(kind) = classify_kind(&event.kind) else {
            return;
        };
        trace!(kind = ?event.kind, paths = ?event.paths, "Received notify event");

        if event.paths.is_empty() {
            self.send(kind, None);
            return;
        }
        for path in &event.paths {
            self.send(kind, self.target.relative_path(path));
        }
    }

    fn send(&self, kind: RawKind, relative: Option<String>) {
        let change = RawChange {
            target: self.target_index,
            kind,
            relative,
        };
        if self.intake.send(change).is_err() {
            trace!("Intake channel closed, dropping notification");
        }
    }
}

/// Opens one non-symlink-following watcher whose callback runs `on_event`
/// for each event.
fn open_watcher<F>(
    path: &Path,
    mode: RecursiveMode,
    open: &Arc<AtomicUsize>,
    on_event: F,
) -> notify::Result<WatchHandle>
where
    F: Fn(&Event) + Send + 'static,
{
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => on_event(&event),
            Err(err) => warn!(error = %err, "File watcher error"),
        },
        Config::default().with_follow_symlinks(false),
    )?;
    watcher.watch(path, mode)?;
    Ok(WatchHandle::new(watcher, open))
}

#[derive(Default)]
struct WatcherSetState {
    closed: bool,
    targets: Vec<WatchHandle>,
    children: HashMap<(usize, String), WatchHandle>,
    resyncs: Vec<Arc<Notify>>,
}

/// All watchers of one registry entry.
///
/// Shared with the fallback sync tasks. Once closed, every handle is
/// dropped, late insertions are refused (and dropped immediately) and the
/// sync tasks are woken so they can exit.
#[derive(Default)]
pub struct WatcherSet {
    state: Mutex<WatcherSetState>,
}

impl WatcherSet {
    fn lock(&self) -> MutexGuard<'_, WatcherSetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_target(&self, handle: WatchHandle) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.targets.push(handle);
        true
    }

    fn register_resync(&self, resync: Arc<Notify>) {
        let mut state = self.lock();
        if state.closed {
            resync.notify_one();
        } else {
            state.resyncs.push(resync);
        }
    }

    fn has_child(&self, target: usize, name: &str) -> bool {
        self.lock()
            .children
            .contains_key(&(target, name.to_string()))
    }

    fn insert_child(&self, target: usize, name: String, handle: WatchHandle) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.children.insert((target, name), handle);
        true
    }

    fn retain_children(&self, target: usize, keep: &HashSet<String>) {
        let removed: Vec<WatchHandle> = {
            let mut state = self.lock();
            let stale: Vec<_> = state
                .children
                .keys()
                .filter(|(index, name)| *index == target && !keep.contains(name))
                .cloned()
                .collect();
            stale
                .iter()
                .filter_map(|key| state.children.remove(key))
                .collect()
        };
        if !removed.is_empty() {
            debug!(target_index = target, closed = removed.len(), "Closed child watchers");
        }
    }

    /// Closes every watcher and refuses further insertions.
    pub fn close(&self) {
        let (targets, children, resyncs) = {
            let mut state = self.lock();
            state.closed = true;
            (
                mem::take(&mut state.targets),
                mem::take(&mut state.children),
                mem::take(&mut state.resyncs),
            )
        };
        drop(targets);
        drop(children);
        for resync in resyncs {
            resync.notify_one();
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// How a target ended up being watched.
pub enum WatchMode {
    Recursive,
    /// Non-recursive with per-child watchers kept in sync by this task.
    Fallback(JoinHandle<()>),
}

/// Starts watching `target`, registering every handle in `watchers`.
///
/// Performs blocking filesystem work; call it off the async workers. A
/// fallback watch spawns its sync task on the current runtime.
///
/// # Errors
///
/// Returns the notify error when neither a recursive nor a non-recursive
/// watch can be opened (e.g. the directory does not exist yet).
pub fn watch_target(
    target_index: usize,
    target: &WatchTarget,
    intake: &mpsc::UnboundedSender<RawChange>,
    watchers: &Arc<WatcherSet>,
    open: &Arc<AtomicUsize>,
) -> notify::Result<WatchMode> {
    let forwarder = Forwarder {
        target_index,
        target: target.clone(),
        intake: intake.clone(),
    };

    let recursive = {
        let forwarder = forwarder.clone();
        open_watcher(&target.path, RecursiveMode::Recursive, open, move |event| {
            forwarder.forward(event)
        })
    };
    match recursive {
        Ok(handle) => {
            watchers.push_target(handle);
            debug!(path = %target.path.display(), "Started recursive watch");
            return Ok(WatchMode::Recursive);
        }
        Err(err) => {
            debug!(
                path = %target.path.display(),
                error = %err,
                "Recursive watch unavailable, falling back to per-directory watches"
            );
        }
    }

    watch_fallback(forwarder, watchers, open)
}

/// Watches the target non-recursively plus one watcher per PRD child.
fn watch_fallback(
    forwarder: Forwarder,
    watchers: &Arc<WatcherSet>,
    open: &Arc<AtomicUsize>,
) -> notify::Result<WatchMode> {
    let resync = Arc::new(Notify::new());
    let handle = {
        let path = forwarder.target.path.clone();
        let forwarder = forwarder.clone();
        let resync = Arc::clone(&resync);
        open_watcher(&path, RecursiveMode::NonRecursive, open, move |event| {
            forwarder.forward(event);
            resync.notify_one();
        })?
    };
    watchers.push_target(handle);
    watchers.register_resync(Arc::clone(&resync));

    sync_children(&forwarder, watchers, open);
    let pass = {
        let watchers = Arc::clone(watchers);
        let open = Arc::clone(open);
        move || sync_children(&forwarder, &watchers, &open)
    };
    let task = tokio::spawn(run_child_sync(Arc::clone(watchers), resync, pass));
    Ok(WatchMode::Fallback(task))
}

/// Runs `pass` on the blocking pool whenever the target's own watcher fires,
/// until `watchers` closes.
///
/// `Notify` stores at most one permit, so requests that arrive while a pass
/// is running collapse into a single follow-up pass.
async fn run_child_sync<F>(watchers: Arc<WatcherSet>, resync: Arc<Notify>, pass: F)
where
    F: Fn() + Clone + Send + 'static,
{
    loop {
        resync.notified().await;
        if watchers.is_closed() {
            break;
        }
        if let Err(err) = tokio::task::spawn_blocking(pass.clone()).await {
            warn!(error = %err, "Child watcher sync failed");
        }
    }
    trace!("Child watcher sync stopped");
}

/// Opens watchers for new PRD-shaped children and closes vanished ones.
fn sync_children(forwarder: &Forwarder, watchers: &WatcherSet, open: &Arc<AtomicUsize>) {
    let target = &forwarder.target;
    let index = forwarder.target_index;
    let Ok(entries) = fs::read_dir(&target.path) else {
        watchers.retain_children(index, &HashSet::new());
        return;
    };

    let mut present = HashSet::new();
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if target.prd_id_for(&name).is_none() {
            continue;
        }
        present.insert(name.clone());
        if watchers.has_child(index, &name) {
            continue;
        }

        let Ok(child_real) = fs::canonicalize(entry.path()) else {
            continue;
        };
        if !contain_in_root(&child_real, &target.path) {
            continue;
        }

        let child_forwarder = forwarder.clone();
        match open_watcher(&child_real, RecursiveMode::NonRecursive, open, move |event| {
            child_forwarder.forward(event)
        }) {
            Ok(handle) => {
                if !watchers.insert_child(index, name, handle) {
                    return;
                }
            }
            Err(err) => {
                debug!(path = %child_real.display(), error = %err, "Failed to watch PRD directory");
            }
        }
    }

    watchers.retain_children(index, &present);
}
