//! Alertmanager webhook receiver that keeps files in a GitHub repository in
//! step with alerts.
//!
//! Alerts carrying the gating label are debounced per label set. When an
//! alert's quiet period elapses its target file is fetched, regenerated and
//! written back with optimistic concurrency:
//!
//! - **Pass-through** - create the file from a template, leave existing files alone
//! - **Incident** - keep a YAML header plus a newest-first timeline, preserving
//!   any free text written by hand
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use githubfiles_receiver::{
//!     ContentReconciler, ContentStrategy, DebounceQueue, IncidentMerger, InMemoryStore,
//!     ReconcilerSettings, RepoCoordinates, Templater,
//! };
//! use std::{sync::Arc, time::Duration};
//! use tokio_util::sync::CancellationToken;
//!
//! let repo = RepoCoordinates::parse("acme/status", "content/issues").unwrap();
//! let reconciler = ContentReconciler::new(
//!     Arc::new(InMemoryStore::new()),
//!     Templater::new(repo),
//!     ReconcilerSettings::new(
//!         "{{Alert.Labels.alertname}}.md",
//!         ContentStrategy::IncidentMerge(IncidentMerger::default()),
//!     ),
//! );
//!
//! let queue = Arc::new(DebounceQueue::new(Duration::from_secs(30)));
//! tokio::spawn(queue.clone().run(Arc::new(reconciler), CancellationToken::new()));
//! ```

pub mod alert;
pub mod config;
pub mod debounce;
pub mod error;
pub mod incident;
pub mod reconcile;
pub mod server;
pub mod store;
pub mod template;

pub use alert::{Alert, AlertKey, AlertStatus, WebhookMessage};
pub use config::{Cli, Config, ConfigError, Engine};
pub use debounce::{DebounceQueue, EnqueueOutcome, FiredAlertHandler, QueuedAlert};
pub use error::{MergeError, ReconcileError, StoreError, TemplateError};
pub use incident::{IncidentDocument, IncidentMerger};
pub use reconcile::{
    ContentReconciler, ContentStrategy, Disposition, ReconcileOutcome, ReconcilerSettings,
    ResolvedWithoutHistory, WriteMode,
};
pub use server::{build_router, ReceiverState};
pub use store::{CommitMetadata, GitHubStore, InMemoryStore, RemoteFile, RemoteStore};
pub use template::{RepoCoordinates, Templater};
