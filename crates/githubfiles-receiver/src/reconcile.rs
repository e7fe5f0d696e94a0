//! Fetch-merge-write of the file belonging to a fired alert.

use async_trait::async_trait;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::alert::Alert;
use crate::debounce::{FiredAlertHandler, QueuedAlert};
use crate::error::{ReconcileError, StoreError};
use crate::incident::IncidentMerger;
use crate::store::{CommitMetadata, RemoteFile, RemoteStore};
use crate::template::Templater;

/// Default bound on a single remote call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// How new file content is produced.
#[derive(Debug, Clone)]
pub enum ContentStrategy {
    /// Keep existing content; render `template` when the file is new
    PassThrough { template: String },
    /// Maintain an incident log
    IncidentMerge(IncidentMerger),
}

impl ContentStrategy {
    fn apply(
        &self,
        templater: &Templater,
        existing: &str,
        alert: &Alert,
    ) -> Result<String, ReconcileError> {
        match self {
            Self::PassThrough { template } => {
                if existing.is_empty() {
                    Ok(templater.render(template, alert)?)
                } else {
                    Ok(existing.to_string())
                }
            }
            Self::IncidentMerge(merger) => Ok(merger.merge(templater, existing, alert)?),
        }
    }
}

/// What to do with a resolved alert whose file does not exist yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ResolvedWithoutHistory {
    /// Create the file anyway
    #[default]
    Create,
    /// Leave the store untouched
    Skip,
}

/// Settings for a [`ContentReconciler`].
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub filename_template: String,
    pub strategy: ContentStrategy,
    pub commit: CommitMetadata,
    pub dry_run: bool,
    pub resolved_without_history: ResolvedWithoutHistory,
    pub call_timeout: Duration,
}

impl ReconcilerSettings {
    #[must_use]
    pub fn new(filename_template: impl Into<String>, strategy: ContentStrategy) -> Self {
        Self {
            filename_template: filename_template.into(),
            strategy,
            commit: CommitMetadata::default(),
            dry_run: false,
            resolved_without_history: ResolvedWithoutHistory::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Create,
    Update,
}

impl WriteMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
        }
    }
}

/// What happened to the computed content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Written,
    DryRun,
    /// Resolved alert without a file, per [`ResolvedWithoutHistory::Skip`]
    Skipped,
    /// Existing file already holds the computed content
    Unchanged,
}

/// Result of one reconciliation.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub path: String,
    pub mode: WriteMode,
    pub content: String,
    pub disposition: Disposition,
}

/// Converges remote files with fired alerts.
pub struct ContentReconciler {
    store: Arc<dyn RemoteStore>,
    templater: Templater,
    settings: ReconcilerSettings,
}

impl ContentReconciler {
    #[must_use]
    pub fn new(
        store: Arc<dyn RemoteStore>,
        templater: Templater,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            store,
            templater,
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    /// Render the target path for `alert`.
    pub fn target_path(&self, alert: &Alert) -> Result<String, ReconcileError> {
        let file_name = self
            .templater
            .render(&self.settings.filename_template, alert)?;
        let file_name = file_name.trim().trim_matches('/');
        if file_name.is_empty() {
            return Err(ReconcileError::EmptyPath);
        }
        Ok(self.templater.repo().join(file_name))
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, ReconcileError> {
        tokio::time::timeout(self.settings.call_timeout, call)
            .await
            .map_err(|_| ReconcileError::TimedOut(self.settings.call_timeout))?
            .map_err(ReconcileError::from)
    }

    /// Fetch, merge and write the file for `alert`.
    pub async fn reconcile(&self, alert: &Alert) -> Result<ReconcileOutcome, ReconcileError> {
        let path = self.target_path(alert)?;

        let file = match self.bounded(self.store.get(&path)).await {
            Ok(file) => file,
            Err(ReconcileError::Store(StoreError::NotFound(_))) => {
                debug!(path = %path, "File does not exist yet");
                RemoteFile::absent(&path)
            }
            Err(e) => return Err(e),
        };
        let mode = if file.exists() {
            WriteMode::Update
        } else {
            WriteMode::Create
        };

        if mode == WriteMode::Create
            && alert.is_resolved()
            && self.settings.resolved_without_history == ResolvedWithoutHistory::Skip
        {
            info!(path = %path, "Resolved alert has no file, skipping");
            return Ok(ReconcileOutcome {
                path,
                mode,
                content: String::new(),
                disposition: Disposition::Skipped,
            });
        }

        let existing = String::from_utf8(file.content)
            .map_err(|_| ReconcileError::NonUtf8 { path: path.clone() })?;
        let content = self
            .settings
            .strategy
            .apply(&self.templater, &existing, alert)?;

        debug!(path = %path, mode = mode.as_str(), content = %content, "Rendered content");

        if mode == WriteMode::Update && content == existing {
            info!(path = %path, "Content unchanged, not writing file");
            return Ok(ReconcileOutcome {
                path,
                mode,
                content,
                disposition: Disposition::Unchanged,
            });
        }

        if self.settings.dry_run {
            info!(path = %path, mode = mode.as_str(), "Dry run, not writing file");
            return Ok(ReconcileOutcome {
                path,
                mode,
                content,
                disposition: Disposition::DryRun,
            });
        }

        self.bounded(self.store.create_or_update(
            &path,
            content.as_bytes(),
            file.version.as_deref(),
            &self.settings.commit,
        ))
        .await?;

        info!(path = %path, mode = mode.as_str(), "File written");
        Ok(ReconcileOutcome {
            path,
            mode,
            content,
            disposition: Disposition::Written,
        })
    }
}

#[async_trait]
impl FiredAlertHandler for ContentReconciler {
    async fn handle(&self, fired: QueuedAlert) -> Result<(), ReconcileError> {
        let outcome = self.reconcile(&fired.alert).await?;
        debug!(
            key = %fired.key,
            path = %outcome.path,
            disposition = ?outcome.disposition,
            "Reconciled fired alert"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertStatus;
    use crate::incident::IncidentDocument;
    use crate::store::InMemoryStore;
    use crate::template::RepoCoordinates;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PATH_TEMPLATE: &str = "content/issues/{{.Alert.Labels.alertname}}.md";

    fn alert(status: AlertStatus, ends_hour: u32) -> Alert {
        Alert {
            status,
            labels: HashMap::from([
                ("alertname".to_string(), "disk-full".to_string()),
                ("githubfilesenabled".to_string(), "true".to_string()),
            ]),
            annotations: HashMap::new(),
            starts_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            ends_at: Utc.with_ymd_and_hms(2024, 1, 1, ends_hour, 0, 0).unwrap(),
            generator_url: String::new(),
            fingerprint: String::new(),
        }
    }

    fn reconciler(store: Arc<dyn RemoteStore>, settings: ReconcilerSettings) -> ContentReconciler {
        let repo = RepoCoordinates::parse("acme/status", "").unwrap();
        ContentReconciler::new(store, Templater::new(repo), settings)
    }

    fn incident_settings() -> ReconcilerSettings {
        ReconcilerSettings::new(
            PATH_TEMPLATE,
            ContentStrategy::IncidentMerge(IncidentMerger::default()),
        )
    }

    /// Store whose reads always fail with a server error and that counts writes.
    #[derive(Default)]
    struct BrokenStore {
        writes: AtomicUsize,
    }

    #[async_trait]
    impl RemoteStore for BrokenStore {
        async fn get(&self, _path: &str) -> Result<RemoteFile, StoreError> {
            Err(StoreError::Api {
                status: 503,
                body: "unavailable".to_string(),
            })
        }

        async fn create_or_update(
            &self,
            _path: &str,
            _content: &[u8],
            _expected_version: Option<&str>,
            _metadata: &CommitMetadata,
        ) -> Result<(), StoreError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Store that hangs on reads.
    struct HangingStore;

    #[async_trait]
    impl RemoteStore for HangingStore {
        async fn get(&self, _path: &str) -> Result<RemoteFile, StoreError> {
            std::future::pending().await
        }

        async fn create_or_update(
            &self,
            _path: &str,
            _content: &[u8],
            _expected_version: Option<&str>,
            _metadata: &CommitMetadata,
        ) -> Result<(), StoreError> {
            Ok(())
        }
    }

    /// Store that reports a version, then has it changed by another writer
    /// between read and write.
    struct RacingStore {
        inner: InMemoryStore,
    }

    #[async_trait]
    impl RemoteStore for RacingStore {
        async fn get(&self, path: &str) -> Result<RemoteFile, StoreError> {
            let file = self.inner.get(path).await?;
            self.inner.insert(path, "---\nstate: Investigating\n---\n\nother writer\n").await;
            Ok(file)
        }

        async fn create_or_update(
            &self,
            path: &str,
            content: &[u8],
            expected_version: Option<&str>,
            metadata: &CommitMetadata,
        ) -> Result<(), StoreError> {
            self.inner
                .create_or_update(path, content, expected_version, metadata)
                .await
        }
    }

    #[tokio::test]
    async fn test_worked_example_create_then_resolve() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = reconciler(store.clone(), incident_settings());

        let created = reconciler
            .reconcile(&alert(AlertStatus::Firing, 0))
            .await
            .unwrap();
        assert_eq!(created.path, "content/issues/disk-full.md");
        assert_eq!(created.mode, WriteMode::Create);
        assert_eq!(created.disposition, Disposition::Written);

        let content = store.content("content/issues/disk-full.md").await.unwrap();
        let doc = IncidentDocument::parse(&content).unwrap();
        assert_eq!(doc.header_str("state").unwrap(), Some("Investigating"));
        assert_eq!(
            doc.header_str("startsAt").unwrap(),
            Some("2024-01-01 00:00:00")
        );

        let updated = reconciler
            .reconcile(&alert(AlertStatus::Resolved, 1))
            .await
            .unwrap();
        assert_eq!(updated.mode, WriteMode::Update);

        let content = store.content("content/issues/disk-full.md").await.unwrap();
        let doc = IncidentDocument::parse(&content).unwrap();
        assert_eq!(doc.header_str("state").unwrap(), Some("Resolved"));
        assert_eq!(
            doc.header_str("startsAt").unwrap(),
            Some("2024-01-01 00:00:00")
        );
        assert_eq!(doc.header_str("endsAt").unwrap(), Some("2024-01-01 01:00:00"));
        assert_eq!(doc.entries().len(), 2);
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_dry_run_never_writes() {
        let store = Arc::new(InMemoryStore::new());
        let mut settings = incident_settings();
        settings.dry_run = true;
        let reconciler = reconciler(store.clone(), settings);

        let outcome = reconciler
            .reconcile(&alert(AlertStatus::Firing, 0))
            .await
            .unwrap();
        assert_eq!(outcome.disposition, Disposition::DryRun);
        assert_eq!(outcome.path, "content/issues/disk-full.md");
        assert!(outcome.content.contains("state: Investigating"));
        assert_eq!(store.write_count(), 0);
        assert!(store.content("content/issues/disk-full.md").await.is_none());
    }

    #[tokio::test]
    async fn test_read_error_aborts_without_write() {
        let store = Arc::new(BrokenStore::default());
        let reconciler = reconciler(store.clone(), incident_settings());

        let err = reconciler
            .reconcile(&alert(AlertStatus::Firing, 0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Store(StoreError::Api { status: 503, .. })
        ));
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_modification_is_conflict() {
        let store = Arc::new(RacingStore {
            inner: InMemoryStore::new(),
        });
        store
            .inner
            .insert(
                "content/issues/disk-full.md",
                "---\nstate: Investigating\nstartsAt: \"2024-01-01 00:00:00\"\n---\n\nfirst\n",
            )
            .await;
        let reconciler = reconciler(store.clone(), incident_settings());

        let err = reconciler
            .reconcile(&alert(AlertStatus::Resolved, 1))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(
            store.inner.content("content/issues/disk-full.md").await.as_deref(),
            Some("---\nstate: Investigating\n---\n\nother writer\n")
        );
        assert_eq!(store.inner.write_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_existing_document_is_not_overwritten() {
        let store = Arc::new(InMemoryStore::new());
        store
            .insert("content/issues/disk-full.md", "hand written notes\n")
            .await;
        let reconciler = reconciler(store.clone(), incident_settings());

        let err = reconciler
            .reconcile(&alert(AlertStatus::Firing, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Merge(_)));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_template_failure_happens_before_io() {
        let store = Arc::new(BrokenStore::default());
        let settings = ReconcilerSettings::new(
            "{{Alert.Labels.missing}}.md",
            ContentStrategy::PassThrough {
                template: String::new(),
            },
        );
        let err = reconciler(store, settings)
            .reconcile(&alert(AlertStatus::Firing, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Template(_)));
    }

    #[tokio::test]
    async fn test_empty_path_is_rejected() {
        let settings = ReconcilerSettings::new(
            "  ",
            ContentStrategy::PassThrough {
                template: String::new(),
            },
        );
        let err = reconciler(Arc::new(InMemoryStore::new()), settings)
            .reconcile(&alert(AlertStatus::Firing, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::EmptyPath));
    }

    #[tokio::test]
    async fn test_pass_through_creates_then_keeps_content() {
        let store = Arc::new(InMemoryStore::new());
        let settings = ReconcilerSettings::new(
            "{{Alert.Labels.alertname}}.txt",
            ContentStrategy::PassThrough {
                template: "{{Alert.Labels.alertname}} is {{Alert.Status}}\n".to_string(),
            },
        );
        let reconciler = reconciler(store.clone(), settings);

        reconciler
            .reconcile(&alert(AlertStatus::Firing, 0))
            .await
            .unwrap();
        assert_eq!(
            store.content("disk-full.txt").await.as_deref(),
            Some("disk-full is firing\n")
        );

        let outcome = reconciler
            .reconcile(&alert(AlertStatus::Resolved, 1))
            .await
            .unwrap();
        assert_eq!(outcome.mode, WriteMode::Update);
        assert_eq!(outcome.disposition, Disposition::Unchanged);
        assert_eq!(
            store.content("disk-full.txt").await.as_deref(),
            Some("disk-full is firing\n")
        );
        // Only the create reached the store
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_resolved_without_history_skip() {
        let store = Arc::new(InMemoryStore::new());
        let mut settings = incident_settings();
        settings.resolved_without_history = ResolvedWithoutHistory::Skip;
        let reconciler = reconciler(store.clone(), settings);

        let outcome = reconciler
            .reconcile(&alert(AlertStatus::Resolved, 1))
            .await
            .unwrap();
        assert_eq!(outcome.disposition, Disposition::Skipped);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_resolved_without_history_create() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = reconciler(store.clone(), incident_settings());

        reconciler
            .reconcile(&alert(AlertStatus::Resolved, 1))
            .await
            .unwrap();
        let content = store.content("content/issues/disk-full.md").await.unwrap();
        let doc = IncidentDocument::parse(&content).unwrap();
        assert_eq!(doc.header_str("state").unwrap(), Some("Resolved"));
    }

    #[tokio::test]
    async fn test_commit_metadata_is_forwarded() {
        let store = Arc::new(InMemoryStore::new());
        let mut settings = incident_settings();
        settings.commit = CommitMetadata {
            message: "Update incident".to_string(),
            branch: "main".to_string(),
            author_name: "bot".to_string(),
            author_email: "bot@example.com".to_string(),
        };
        let expected = settings.commit.clone();
        reconciler(store.clone(), settings)
            .reconcile(&alert(AlertStatus::Firing, 0))
            .await
            .unwrap();

        assert_eq!(
            store.last_commit("content/issues/disk-full.md").await,
            Some(expected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_remote_call_times_out() {
        let mut settings = incident_settings();
        settings.call_timeout = Duration::from_secs(3);
        let err = reconciler(Arc::new(HangingStore), settings)
            .reconcile(&alert(AlertStatus::Firing, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::TimedOut(d) if d == Duration::from_secs(3)));
    }
}
