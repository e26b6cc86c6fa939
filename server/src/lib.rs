//! PiggyChick Server - live PRD browser backend.
//!
//! This crate serves the PRD task folders of one or more project roots:
//! - Loading the roots config file (JSONC) and assigning stable root ids
//! - Listing PRDs, their progress and git worktree variants
//! - Reading plan and markdown documents without following symlinks
//! - Streaming debounced change notifications over Server-Sent Events
//!
//! # Architecture
//!
//! Every request re-reads the config and the filesystem; nothing is cached
//! except the live watch entries in [`watch::WatchRegistry`], which exist
//! only while at least one change stream is subscribed to a root.

pub mod config;
pub mod error;
pub mod events;
pub mod git;
pub mod jsonc;
pub mod paths;
pub mod roots;
pub mod routes;
pub mod secure_read;
pub mod tasks;
pub mod types;
pub mod utils;
pub mod watch;
