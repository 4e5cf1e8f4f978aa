use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fundwatch_adapters::{global_registry, SourceAdapter};
use fundwatch_core::{DeliveryState, Opportunity, SourceSettings};
use fundwatch_storage::{DedupeStore, DeliveryUpdate, FixtureTransport, SeenUpdate, SqliteDedupeStore};
use fundwatch_sync::{
    render_message_text, AppConfig, FilterSettings, PostingSettings, PreviewHook, RuleBasedFilter,
    SlackWebhookNotifier, SourceDisplayNames, SyncPipeline,
};
use tempfile::TempDir;

const FEED_URL: &str = "https://www.ukri.org/opportunity/feed/";
const HOOK_URL: &str = "https://hooks.slack.com/services/T000/B000/XXXX";
const AI_ID: &str = "https://www.ukri.org/opportunity/ai-for-health-systems";

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn feed_fixture() -> String {
    std::fs::read_to_string(workspace_root().join("fixtures/ukri_rss/feed.xml")).expect("reading feed fixture")
}

fn settings() -> SourceSettings {
    SourceSettings::new("ukri_rss", "rss", FEED_URL).with_option("display_name", "UKRI Funding Finder")
}

fn transport(webhook_status: u16) -> Arc<FixtureTransport> {
    Arc::new(
        FixtureTransport::new()
            .with_response(FEED_URL, 200, feed_fixture())
            .with_response(HOOK_URL, webhook_status, if webhook_status < 400 { "ok" } else { "no_service" }),
    )
}

async fn store() -> (TempDir, Arc<SqliteDedupeStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteDedupeStore::open(dir.path().join("data/state.sqlite")).await.unwrap();
    store.init().await.unwrap();
    (dir, Arc::new(store))
}

fn pipeline(http: Arc<FixtureTransport>, store: Arc<SqliteDedupeStore>, posting: PostingSettings) -> SyncPipeline {
    let source: Box<dyn SourceAdapter> = global_registry().create(&settings(), http.clone()).unwrap();
    let filter = RuleBasedFilter::new(FilterSettings {
        include_keywords: vec!["AI".into()],
        ..Default::default()
    })
    .unwrap();
    let notifier = SlackWebhookNotifier::new(http, HOOK_URL)
        .with_display_names(SourceDisplayNames::from_sources(&[settings()]));
    SyncPipeline::new(vec![source], Box::new(filter), store, posting).with_notifier(Box::new(notifier))
}

fn webhook_posts(http: &FixtureTransport) -> usize {
    http.requests().iter().filter(|r| r.method == "POST" && r.url == HOOK_URL).count()
}

#[tokio::test]
async fn same_opportunity_is_posted_once_across_runs() {
    let (_dir, store) = store().await;
    let http = transport(200);
    let pipeline = pipeline(http.clone(), store.clone(), PostingSettings::default());

    let first = pipeline.run_once().await;
    assert!(first.ok(), "{:?}", first.errors);
    assert_eq!(first.processed, 2);
    assert_eq!(first.matched, 1);
    assert_eq!(first.posted, 1);
    assert_eq!(first.filtered_out, 1);

    let second = pipeline.run_once().await;
    assert!(second.ok());
    assert_eq!(second.posted, 0);
    assert_eq!(second.skipped_already_posted, 1);
    assert_ne!(first.run_id, second.run_id);

    assert_eq!(webhook_posts(&http), 1);
    let record = store.has_seen(AI_ID).await.unwrap().unwrap();
    assert!(record.delivery.is_posted());
    assert_eq!(record.match_reason.as_deref(), Some("keywords: AI"));

    let payload = http.requests().into_iter().find(|r| r.url == HOOK_URL).unwrap().body.unwrap();
    assert!(payload["text"]
        .as_str()
        .unwrap()
        .ends_with("| Closes: 2026-03-30 | Source: UKRI Funding Finder"));
}

#[tokio::test]
async fn pending_records_are_not_reposted() {
    let (_dir, store) = store().await;
    store
        .mark_seen(&SeenUpdate {
            external_id: AI_ID,
            source_id: "ukri_rss",
            title: "AI for health systems",
            url: AI_ID,
            match_reason: Some("keywords: AI"),
            delivery: DeliveryUpdate::Pending,
        })
        .await
        .unwrap();

    let http = transport(200);
    let stats = pipeline(http.clone(), store.clone(), PostingSettings::default())
        .run_once()
        .await;

    assert!(stats.ok());
    assert_eq!(stats.skipped_pending_confirmation, 1);
    assert_eq!(stats.posted, 0);
    assert_eq!(webhook_posts(&http), 0);
    assert!(store.has_seen(AI_ID).await.unwrap().unwrap().delivery.is_pending());
}

#[derive(Clone, Default)]
struct CapturingPreview {
    rendered: Arc<Mutex<Vec<String>>>,
}

impl PreviewHook for CapturingPreview {
    fn preview(&self, opportunity: &Opportunity, match_reason: &str) {
        self.rendered
            .lock()
            .unwrap()
            .push(render_message_text(opportunity, match_reason, "UKRI Funding Finder"));
    }
}

#[tokio::test]
async fn dry_run_previews_without_touching_the_store() {
    let (_dir, store) = store().await;
    let http = transport(200);
    let preview = CapturingPreview::default();
    let posting = PostingSettings {
        dry_run: true,
        ..Default::default()
    };

    let stats = pipeline(http.clone(), store.clone(), posting)
        .with_preview(Box::new(preview.clone()))
        .run_once()
        .await;

    assert!(stats.ok());
    assert_eq!(stats.matched, 1);
    assert_eq!(stats.posted, 0);
    assert_eq!(webhook_posts(&http), 0);

    let rendered = preview.rendered.lock().unwrap().clone();
    assert_eq!(rendered.len(), 1);
    assert!(rendered[0].starts_with("AI for health systems (https://www.ukri.org/opportunity/ai-for-health-systems)"));
    assert!(rendered[0].contains("*Why it matched:* keywords: AI"));

    assert!(store.has_seen(AI_ID).await.unwrap().is_none());
    assert!(store
        .has_seen("https://www.ukri.org/opportunity/maintenance-infrastructure")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn rejected_webhook_marks_failure_and_a_later_run_retries() {
    let (_dir, store) = store().await;

    let failing = transport(500);
    let stats = pipeline(failing, store.clone(), PostingSettings::default())
        .run_once()
        .await;
    assert!(!stats.ok());
    assert_eq!(stats.posted, 0);
    assert_eq!(
        stats.errors,
        vec![format!("failed to post {AI_ID}: Slack webhook returned 500: no_service")]
    );
    let record = store.has_seen(AI_ID).await.unwrap().unwrap();
    assert_eq!(
        record.delivery,
        DeliveryState::PostFailed {
            reason: "Slack webhook returned 500: no_service".into()
        }
    );
    assert_eq!(record.match_reason.as_deref(), Some("keywords: AI"));

    let healthy = transport(200);
    let retry = pipeline(healthy.clone(), store.clone(), PostingSettings::default())
        .run_once()
        .await;
    assert!(retry.ok());
    assert_eq!(retry.posted, 1);
    assert_eq!(webhook_posts(&healthy), 1);
    assert!(store.has_seen(AI_ID).await.unwrap().unwrap().delivery.is_posted());
}

#[tokio::test]
async fn setup_errors_surface_before_fetching() {
    let dir = tempfile::tempdir().unwrap();
    let (_store_dir, store) = store().await;

    let unknown = r#"
sources:
  - id: gopher
    type: gopher
    url: gopher://example.org/
posting:
  dry_run: true
"#;
    let config = AppConfig::from_yaml_str(unknown, dir.path()).unwrap();
    let err = SyncPipeline::from_config(&config, store.clone()).err().unwrap();
    assert!(format!("{err:#}").contains("unknown source type `gopher`"), "{err:#}");

    let missing_hook = r#"
sources:
  - id: ukri_rss
    type: rss
    url: https://www.ukri.org/opportunity/feed/
slack:
  webhook_env_var: FUNDWATCH_PIPELINE_TEST_UNSET_HOOK
"#;
    let config = AppConfig::from_yaml_str(missing_hook, dir.path()).unwrap();
    let err = SyncPipeline::from_config(&config, store.clone()).err().unwrap();
    assert!(err.to_string().contains("FUNDWATCH_PIPELINE_TEST_UNSET_HOOK"));

    let dry = missing_hook.replace("slack:", "posting:\n  dry_run: true\nslack:");
    let config = AppConfig::from_yaml_str(&dry, dir.path()).unwrap();
    let pipeline = SyncPipeline::from_config(&config, store).unwrap();
    assert_eq!(pipeline.source_ids(), vec!["ukri_rss"]);
}
