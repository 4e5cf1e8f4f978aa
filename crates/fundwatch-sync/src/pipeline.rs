use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fundwatch_adapters::{global_registry, SourceAdapter};
use fundwatch_core::Opportunity;
use fundwatch_storage::{DedupeStore, DeliveryUpdate, HttpFetcher, HttpTransport, SeenUpdate, SqliteDedupeStore};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{AppConfig, PostingSettings};
use crate::filter::{OpportunityFilter, RuleBasedFilter};
use crate::notify::{Notifier, SlackWebhookNotifier, SourceDisplayNames};

pub const BACKFILL_REASON: &str = "backfill mark_seen";

/// Receives matches that would have been posted during a dry run.
pub trait PreviewHook: Send + Sync {
    fn preview(&self, opportunity: &Opportunity, match_reason: &str);
}

#[derive(Debug, Default)]
pub struct NoopPreviewHook;

impl PreviewHook for NoopPreviewHook {
    fn preview(&self, _opportunity: &Opportunity, _match_reason: &str) {}
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub processed: usize,
    pub matched: usize,
    pub filtered_out: usize,
    pub posted: usize,
    pub skipped_already_posted: usize,
    pub skipped_pending_confirmation: usize,
    pub errors: Vec<String>,
}

impl RunStats {
    fn start() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            processed: 0,
            matched: 0,
            filtered_out: 0,
            posted: 0,
            skipped_already_posted: 0,
            skipped_pending_confirmation: 0,
            errors: Vec::new(),
        }
    }

    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn record_error(&mut self, message: String) {
        error!("{message}");
        self.errors.push(message);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillStats {
    pub marked_seen: usize,
    pub errors: Vec<String>,
}

impl BackfillStats {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Open the configured SQLite store and make sure its schema exists.
pub async fn open_store(config: &AppConfig) -> Result<SqliteDedupeStore> {
    let path = &config.storage.path;
    let store = SqliteDedupeStore::open(path)
        .await
        .with_context(|| format!("opening dedupe store {}", path.display()))?;
    store.init().await.context("initializing dedupe store schema")?;
    Ok(store)
}

enum ItemOutcome {
    Continue,
    StopRun,
}

pub struct SyncPipeline {
    sources: Vec<Box<dyn SourceAdapter>>,
    filter: Box<dyn OpportunityFilter>,
    store: Arc<dyn DedupeStore>,
    notifier: Option<Box<dyn Notifier>>,
    preview: Box<dyn PreviewHook>,
    posting: PostingSettings,
}

impl SyncPipeline {
    pub fn new(
        sources: Vec<Box<dyn SourceAdapter>>,
        filter: Box<dyn OpportunityFilter>,
        store: Arc<dyn DedupeStore>,
        posting: PostingSettings,
    ) -> Self {
        Self {
            sources,
            filter,
            store,
            notifier: None,
            preview: Box::<NoopPreviewHook>::default(),
            posting,
        }
    }

    /// Build every configured adapter, the filter and (outside dry runs) the
    /// Slack notifier. Fails before any network access on setup errors.
    pub fn from_config(config: &AppConfig, store: Arc<dyn DedupeStore>) -> Result<Self> {
        let http: Arc<dyn HttpTransport> =
            Arc::new(HttpFetcher::new(config.http.client_config()).context("building http client")?);

        let registry = global_registry();
        let sources = config
            .sources
            .iter()
            .map(|settings| {
                registry
                    .create(settings, http.clone())
                    .with_context(|| format!("configuring source {}", settings.id))
            })
            .collect::<Result<Vec<_>>>()?;

        let filter = RuleBasedFilter::new(config.filters.clone()).context("compiling keyword filters")?;
        let mut pipeline = Self::new(sources, Box::new(filter), store, config.posting.clone());

        if !config.posting.dry_run {
            let webhook_url = config.webhook_url()?;
            let notifier = SlackWebhookNotifier::new(http, webhook_url)
                .with_display_names(SourceDisplayNames::from_sources(&config.sources))
                .with_timeout(config.slack.timeout());
            pipeline = pipeline.with_notifier(Box::new(notifier));
        }
        Ok(pipeline)
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_preview(mut self, preview: Box<dyn PreviewHook>) -> Self {
        self.preview = preview;
        self
    }

    pub fn source_ids(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.source_id()).collect()
    }

    pub async fn run_once(&self) -> RunStats {
        let mut stats = RunStats::start();
        let span = info_span!("sync_run", run_id = %stats.run_id, dry_run = self.posting.dry_run);
        self.run_sources(&mut stats).instrument(span).await;
        stats.finished_at = Utc::now();
        info!(
            run_id = %stats.run_id,
            processed = stats.processed,
            matched = stats.matched,
            posted = stats.posted,
            filtered_out = stats.filtered_out,
            skipped_already_posted = stats.skipped_already_posted,
            skipped_pending_confirmation = stats.skipped_pending_confirmation,
            errors = stats.errors.len(),
            "run complete"
        );
        stats
    }

    async fn run_sources(&self, stats: &mut RunStats) {
        for source in &self.sources {
            let opportunities = match source.fetch().await {
                Ok(items) => items,
                Err(err) => {
                    stats.record_error(format!("source {} fetch failed: {err}", source.source_id()));
                    continue;
                }
            };
            info!(source = source.source_id(), count = opportunities.len(), "source fetched");

            for opportunity in &opportunities {
                if stats.posted >= self.posting.max_posts_per_run {
                    info!(limit = self.posting.max_posts_per_run, "reached posting limit; stopping run");
                    return;
                }
                if let ItemOutcome::StopRun = self.process(opportunity, stats).await {
                    return;
                }
            }
        }
    }

    async fn process(&self, opportunity: &Opportunity, stats: &mut RunStats) -> ItemOutcome {
        stats.processed += 1;
        let external_id = opportunity.external_id.as_str();

        let seen = match self.store.has_seen(external_id).await {
            Ok(seen) => seen,
            Err(err) => {
                stats.record_error(format!("failed to read dedupe state {external_id}: {err}"));
                return ItemOutcome::Continue;
            }
        };
        if let Some(record) = &seen {
            if record.delivery.is_posted() || record.posted_at.is_some() {
                stats.skipped_already_posted += 1;
                return ItemOutcome::Continue;
            }
            if record.delivery.is_pending() {
                warn!(external_id, "previous post attempt unconfirmed; skipping");
                stats.skipped_pending_confirmation += 1;
                return ItemOutcome::Continue;
            }
        }

        let result = self.filter.evaluate(opportunity);
        let reason = result.reason_text();
        if !result.matched {
            stats.filtered_out += 1;
            if self.posting.record_non_matches_as_seen && !self.posting.dry_run {
                let update = seen_update(opportunity, Some(reason.as_str()), DeliveryUpdate::Unchanged);
                if let Err(err) = self.store.mark_seen(&update).await {
                    stats.record_error(format!("failed to mark non-match as seen ({external_id}): {err}"));
                }
            }
            return ItemOutcome::Continue;
        }

        stats.matched += 1;
        if self.posting.dry_run {
            self.preview.preview(opportunity, &reason);
            return ItemOutcome::Continue;
        }

        let Some(notifier) = &self.notifier else {
            stats.record_error("notifier is required when dry_run is false".to_string());
            return ItemOutcome::StopRun;
        };

        let pending = seen_update(opportunity, Some(reason.as_str()), DeliveryUpdate::Pending);
        if let Err(err) = self.store.mark_seen(&pending).await {
            stats.record_error(format!("failed to mark pending {external_id}: {err}"));
            return ItemOutcome::Continue;
        }

        if let Err(err) = notifier.post(opportunity, &reason).await {
            let failed = seen_update(opportunity, None, DeliveryUpdate::Failed(err.to_string()));
            if let Err(store_err) = self.store.mark_seen(&failed).await {
                stats.record_error(format!("failed to record post failure {external_id}: {store_err}"));
            }
            stats.record_error(format!("failed to post {external_id}: {err}"));
            return ItemOutcome::Continue;
        }

        let posted = seen_update(opportunity, Some(reason.as_str()), DeliveryUpdate::Posted(Utc::now()));
        if let Err(err) = self.store.mark_seen(&posted).await {
            stats.record_error(format!("failed to mark posted {external_id}: {err}"));
            return ItemOutcome::Continue;
        }

        stats.posted += 1;
        ItemOutcome::Continue
    }

    /// Record every currently listed, never-seen opportunity without posting.
    pub async fn backfill(&self) -> BackfillStats {
        let mut stats = BackfillStats::default();
        let span = info_span!("backfill", run_id = %Uuid::new_v4());
        async {
            for source in &self.sources {
                let opportunities = match source.fetch().await {
                    Ok(items) => items,
                    Err(err) => {
                        let message = format!("backfill fetch failed for {}: {err}", source.source_id());
                        error!("{message}");
                        stats.errors.push(message);
                        continue;
                    }
                };

                for opportunity in &opportunities {
                    let external_id = opportunity.external_id.as_str();
                    match self.store.has_seen(external_id).await {
                        Ok(Some(_)) => continue,
                        Ok(None) => {}
                        Err(err) => {
                            let message = format!("failed to read dedupe state {external_id}: {err}");
                            error!("{message}");
                            stats.errors.push(message);
                            continue;
                        }
                    }

                    let update = seen_update(opportunity, Some(BACKFILL_REASON), DeliveryUpdate::Unchanged);
                    match self.store.mark_seen(&update).await {
                        Ok(()) => stats.marked_seen += 1,
                        Err(err) => {
                            let message = format!("failed to mark seen during backfill for {external_id}: {err}");
                            error!("{message}");
                            stats.errors.push(message);
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;

        info!(marked_seen = stats.marked_seen, errors = stats.errors.len(), "backfill complete");
        stats
    }
}

fn seen_update<'a>(
    opportunity: &'a Opportunity,
    match_reason: Option<&'a str>,
    delivery: DeliveryUpdate,
) -> SeenUpdate<'a> {
    SeenUpdate {
        external_id: &opportunity.external_id,
        source_id: &opportunity.source_id,
        title: &opportunity.title,
        url: &opportunity.url,
        match_reason,
        delivery,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterSettings;
    use async_trait::async_trait;
    use fundwatch_adapters::AdapterError;
    use fundwatch_core::{DeliveryState, SeenRecord};
    use fundwatch_storage::StoreError;
    use std::sync::Mutex;

    use crate::notify::NotifyError;

    struct StaticSource {
        id: &'static str,
        items: Vec<Opportunity>,
        fail: bool,
    }

    #[async_trait]
    impl SourceAdapter for StaticSource {
        fn source_id(&self) -> &str {
            self.id
        }

        fn source_type(&self) -> &'static str {
            "static"
        }

        async fn fetch(&self) -> Result<Vec<Opportunity>, AdapterError> {
            if self.fail {
                return Err(AdapterError::Parse("malformed feed".into()));
            }
            Ok(self.items.clone())
        }
    }

    #[derive(Clone, Default)]
    struct RecordingNotifier {
        posted: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn post(&self, opportunity: &Opportunity, _reason: &str) -> Result<(), NotifyError> {
            self.posted.lock().unwrap().push(opportunity.external_id.clone());
            Ok(())
        }
    }

    /// Delegates to SQLite but fails the configured `(external_id, step)` calls.
    struct FlakyStore {
        inner: Arc<SqliteDedupeStore>,
        failures: Mutex<Vec<(&'static str, &'static str)>>,
    }

    impl FlakyStore {
        fn new(inner: Arc<SqliteDedupeStore>, failures: &[(&'static str, &'static str)]) -> Self {
            Self {
                inner,
                failures: Mutex::new(failures.to_vec()),
            }
        }

        fn check(&self, external_id: &str, step: &str) -> Result<(), StoreError> {
            let failing = self
                .failures
                .lock()
                .unwrap()
                .iter()
                .any(|(id, s)| *id == external_id && *s == step);
            if failing {
                return Err(StoreError::Io {
                    path: "state.sqlite".into(),
                    source: std::io::Error::other("disk full"),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl DedupeStore for FlakyStore {
        async fn init(&self) -> Result<(), StoreError> {
            self.inner.init().await
        }

        async fn has_seen(&self, external_id: &str) -> Result<Option<SeenRecord>, StoreError> {
            self.check(external_id, "read")?;
            self.inner.has_seen(external_id).await
        }

        async fn mark_seen(&self, update: &SeenUpdate<'_>) -> Result<(), StoreError> {
            let step = match update.delivery {
                DeliveryUpdate::Unchanged => "seen",
                DeliveryUpdate::Pending => "pending",
                DeliveryUpdate::Posted(_) => "posted",
                DeliveryUpdate::Failed(_) => "failed",
            };
            self.check(update.external_id, step)?;
            self.inner.mark_seen(update).await
        }
    }

    fn item(id: &str, title: &str) -> Opportunity {
        Opportunity::new("static", id, title, format!("https://example.org/{id}"))
    }

    async fn store() -> (tempfile::TempDir, Arc<SqliteDedupeStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteDedupeStore::open(dir.path().join("state.sqlite")).await.unwrap();
        store.init().await.unwrap();
        (dir, Arc::new(store))
    }

    fn pipeline(sources: Vec<StaticSource>, store: Arc<dyn DedupeStore>, posting: PostingSettings) -> SyncPipeline {
        let filter = RuleBasedFilter::new(FilterSettings {
            include_keywords: vec!["AI".into()],
            ..Default::default()
        })
        .unwrap();
        let sources = sources
            .into_iter()
            .map(|s| Box::new(s) as Box<dyn SourceAdapter>)
            .collect();
        SyncPipeline::new(sources, Box::new(filter), store, posting)
    }

    #[tokio::test]
    async fn posting_cap_stops_the_run() {
        let (_dir, store) = store().await;
        let source = StaticSource {
            id: "static",
            items: vec![item("a", "AI one"), item("b", "AI two"), item("c", "AI three")],
            fail: false,
        };
        let notifier = RecordingNotifier::default();
        let posting = PostingSettings {
            max_posts_per_run: 2,
            ..Default::default()
        };
        let stats = pipeline(vec![source], store, posting)
            .with_notifier(Box::new(notifier.clone()))
            .run_once()
            .await;

        assert_eq!(stats.posted, 2);
        assert_eq!(stats.processed, 2);
        assert!(stats.ok());
        assert_eq!(*notifier.posted.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn failing_source_is_recorded_and_others_continue() {
        let (_dir, store) = store().await;
        let broken = StaticSource {
            id: "broken",
            items: vec![],
            fail: true,
        };
        let healthy = StaticSource {
            id: "healthy",
            items: vec![item("a", "AI one")],
            fail: false,
        };
        let stats = pipeline(vec![broken, healthy], store, PostingSettings::default())
            .with_notifier(Box::new(RecordingNotifier::default()))
            .run_once()
            .await;

        assert_eq!(stats.errors, vec!["source broken fetch failed: parse error: malformed feed"]);
        assert_eq!(stats.posted, 1);
        assert!(!stats.ok());
    }

    #[tokio::test]
    async fn missing_notifier_stops_the_run() {
        let (_dir, store) = store().await;
        let source = StaticSource {
            id: "static",
            items: vec![item("a", "AI one"), item("b", "AI two")],
            fail: false,
        };
        let stats = pipeline(vec![source], store.clone(), PostingSettings::default())
            .run_once()
            .await;

        assert_eq!(stats.errors, vec!["notifier is required when dry_run is false"]);
        assert_eq!(stats.matched, 1);
        assert_eq!(stats.processed, 1);
        assert!(store.has_seen("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_matches_are_recorded_unless_disabled() {
        let (_dir, store) = store().await;
        let source = || StaticSource {
            id: "static",
            items: vec![item("m", "Maintenance programme")],
            fail: false,
        };

        let disabled = PostingSettings {
            record_non_matches_as_seen: false,
            ..Default::default()
        };
        let stats = pipeline(vec![source()], store.clone(), disabled).run_once().await;
        assert_eq!(stats.filtered_out, 1);
        assert!(store.has_seen("m").await.unwrap().is_none());

        let stats = pipeline(vec![source()], store.clone(), PostingSettings::default())
            .run_once()
            .await;
        assert_eq!(stats.filtered_out, 1);
        let record = store.has_seen("m").await.unwrap().unwrap();
        assert_eq!(record.match_reason.as_deref(), Some("no include keywords matched"));
        assert_eq!(record.delivery, DeliveryState::Unseen);
    }

    #[tokio::test]
    async fn store_failures_skip_the_item_without_double_posting() {
        let (_dir, sqlite) = store().await;
        let source = || StaticSource {
            id: "static",
            items: vec![item("a", "AI one"), item("b", "AI two"), item("c", "AI three")],
            fail: false,
        };
        let notifier = RecordingNotifier::default();
        let flaky = Arc::new(FlakyStore::new(
            sqlite.clone(),
            &[("a", "posted"), ("b", "pending"), ("c", "read")],
        ));

        let first = pipeline(vec![source()], flaky, PostingSettings::default())
            .with_notifier(Box::new(notifier.clone()))
            .run_once()
            .await;

        assert_eq!(first.processed, 3);
        assert_eq!(first.matched, 2);
        assert_eq!(first.posted, 0);
        assert_eq!(first.errors.len(), 3);
        assert!(first.errors[0].starts_with("failed to mark posted a: "), "{:?}", first.errors);
        assert!(first.errors[1].starts_with("failed to mark pending b: "), "{:?}", first.errors);
        assert!(first.errors[2].starts_with("failed to read dedupe state c: "), "{:?}", first.errors);
        assert_eq!(*notifier.posted.lock().unwrap(), vec!["a"]);

        assert!(sqlite.has_seen("a").await.unwrap().unwrap().delivery.is_pending());
        assert!(sqlite.has_seen("b").await.unwrap().is_none());
        assert!(sqlite.has_seen("c").await.unwrap().is_none());

        let second = pipeline(vec![source()], sqlite.clone(), PostingSettings::default())
            .with_notifier(Box::new(notifier.clone()))
            .run_once()
            .await;

        assert!(second.ok(), "{:?}", second.errors);
        assert_eq!(second.skipped_pending_confirmation, 1);
        assert_eq!(second.posted, 2);
        assert_eq!(*notifier.posted.lock().unwrap(), vec!["a", "b", "c"]);
        assert!(sqlite.has_seen("a").await.unwrap().unwrap().delivery.is_pending());
    }

    #[tokio::test]
    async fn failed_failure_write_is_reported_alongside_the_post_error() {
        struct RejectingNotifier;

        #[async_trait]
        impl Notifier for RejectingNotifier {
            async fn post(&self, _opportunity: &Opportunity, _reason: &str) -> Result<(), NotifyError> {
                Err(NotifyError::Rejected {
                    status: 500,
                    body: "no_service".into(),
                })
            }
        }

        let (_dir, sqlite) = store().await;
        let source = StaticSource {
            id: "static",
            items: vec![item("a", "AI one")],
            fail: false,
        };
        let flaky = Arc::new(FlakyStore::new(sqlite.clone(), &[("a", "failed")]));
        let stats = pipeline(vec![source], flaky, PostingSettings::default())
            .with_notifier(Box::new(RejectingNotifier))
            .run_once()
            .await;

        assert_eq!(stats.errors.len(), 2);
        assert!(stats.errors[0].starts_with("failed to record post failure a: "));
        assert_eq!(stats.errors[1], "failed to post a: Slack webhook returned 500: no_service");
        assert!(sqlite.has_seen("a").await.unwrap().unwrap().delivery.is_pending());
    }

    #[tokio::test]
    async fn backfill_marks_only_unseen_items() {
        let (_dir, store) = store().await;
        store
            .mark_seen(&seen_update(&item("a", "AI one"), Some("keywords: AI"), DeliveryUpdate::Posted(Utc::now())))
            .await
            .unwrap();

        let source = StaticSource {
            id: "static",
            items: vec![item("a", "AI one"), item("b", "Anything")],
            fail: false,
        };
        let stats = pipeline(vec![source], store.clone(), PostingSettings::default())
            .backfill()
            .await;

        assert_eq!(stats.marked_seen, 1);
        assert!(stats.ok());
        let record = store.has_seen("b").await.unwrap().unwrap();
        assert_eq!(record.match_reason.as_deref(), Some(BACKFILL_REASON));
        assert!(record.posted_at.is_none());
        assert_eq!(
            store.has_seen("a").await.unwrap().unwrap().match_reason.as_deref(),
            Some("keywords: AI")
        );
    }
}
