//! Run orchestration for fundwatch: configuration, filtering, Slack delivery
//! and the fetch → dedupe → filter → post pipeline.

pub mod config;
pub mod filter;
pub mod notify;
pub mod pipeline;

pub use config::{AppConfig, ConfigError, HttpSettings, PostingSettings, SlackSettings, StorageSettings};
pub use filter::{FilterResult, FilterSettings, OpportunityFilter, RuleBasedFilter};
pub use notify::{
    build_payload, format_timestamp, render_message_text, Notifier, NotifyError, SlackWebhookNotifier,
    SourceDisplayNames,
};
pub use pipeline::{
    open_store, BackfillStats, NoopPreviewHook, PreviewHook, RunStats, SyncPipeline, BACKFILL_REASON,
};

pub const CRATE_NAME: &str = "fundwatch-sync";
