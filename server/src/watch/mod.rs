//! Filesystem watching for configured roots.
//!
//! # Modules
//!
//! - [`targets`]: Which directories to watch for a root, and PRD matching
//! - [`watcher`]: notify-backed watchers with a non-recursive fallback
//! - [`subscribers`]: Subscriber channels and per-entry subscriber sets
//! - [`registry`]: Per-root entries, debouncing and lifecycle

pub mod registry;
pub mod subscribers;
pub mod targets;
pub mod watcher;

pub use registry::{RegistryError, RegistrySnapshot, WatchRegistry, DEBOUNCE_WINDOW};
pub use subscribers::{Subscriber, SubscriberId};
pub use targets::{resolve_watch_targets, WatchTarget};
pub use watcher::RawKind;
