//! coredog: automated collection, attribution, and dissemination of
//! core dumps from a containerized cluster.
//!
//! Two cooperating parts ship in one binary:
//!
//! - the **node agent** (`watcher` subcommand): watches the per-pod dump
//!   directories the mutator wired up, and for each settled core file
//!   runs inspect → upload → resolve → hook → notify → telemetry;
//! - the **admission mutator** (`webhook` subcommand): attaches a
//!   pod-scoped hostPath mount to opted-in containers so dumps land in a
//!   predictable location on the host.
//!
//! ## Modules
//!
//! - `watcher`: recursive fsnotify subscription with quiescence detection
//! - `inspector`: size, MD5, and executable-path extraction
//! - `store`: pluggable blob storage (S3-compatible or mounted filesystem)
//! - `resolver`: path-scheme parsing and cluster pod lookup
//! - `notice`: chat notification formatting and dispatch
//! - `reporter`: CloudEvents telemetry emission
//! - `handler`: operator hook execution
//! - `pipeline`: the per-event orchestrator
//! - `webhook`: the admission server and patch synthesis

pub mod handler;
pub mod inspector;
pub mod notice;
pub mod pipeline;
pub mod reporter;
pub mod resolver;
pub mod store;
pub mod watcher;
pub mod webhook;

pub use handler::{CustomHandler, HandlerError};
pub use inspector::{CoreInfo, CoreInspector, InspectError, DEFAULT_HASH_CONCURRENCY};
pub use notice::Notifier;
pub use pipeline::Pipeline;
pub use reporter::{CoredumpUploadedData, ReportError, Reporter};
pub use resolver::{parse_path_scheme, PathScheme, PodResolver, ADMISSION_UID_ANNOTATION};
pub use store::{CfsStore, S3Store, Store, StoreError};
pub use watcher::{FileWatcher, WatchError};
