//! Core engine for heimdall, a daemon that watches over shell commands.
//!
//! Three pieces with real behavior live here: the registry of currently
//! running commands ([`registry`]), the notification policy that decides
//! whether a finished command is worth announcing ([`policy`]), and the
//! TTL-refreshed cache of command executions ([`cache`]). Everything else is
//! plumbing around them: the process executor seam, the outbound
//! notification queue, and configuration.
//!
//! All state is in-memory and owned by explicitly constructed objects; the
//! daemon binary wires them together and exposes them over IPC.

pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod notify;
pub mod policy;
pub mod registry;

pub use error::CoreError;
