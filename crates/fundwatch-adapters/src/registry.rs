//! String-keyed table of source adapter factories.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use fundwatch_core::SourceSettings;
use fundwatch_storage::HttpTransport;

use crate::{
    competition_cards, embedded_json, feed, job_board, AdapterError, CompetitionCardsAdapter, EmbeddedJsonAdapter,
    FeedAdapter, JobBoardAdapter, SourceAdapter,
};

pub type SourceFactory =
    fn(&SourceSettings, Arc<dyn HttpTransport>) -> Result<Box<dyn SourceAdapter>, AdapterError>;

#[derive(Default, Clone)]
pub struct SourceRegistry {
    factories: BTreeMap<String, SourceFactory>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every adapter this crate ships.
    pub fn with_builtin_sources() -> Self {
        let mut registry = Self::new();
        registry.register(feed::SOURCE_TYPE, FeedAdapter::factory);
        registry.register(embedded_json::SOURCE_TYPE, EmbeddedJsonAdapter::factory);
        registry.register(competition_cards::SOURCE_TYPE, CompetitionCardsAdapter::factory);
        registry.register(job_board::SOURCE_TYPE, JobBoardAdapter::factory);
        registry
    }

    /// Register a factory, replacing any earlier one for the same type.
    pub fn register(&mut self, source_type: &str, factory: SourceFactory) {
        self.factories.insert(normalize_type(source_type), factory);
    }

    pub fn contains(&self, source_type: &str) -> bool {
        self.factories.contains_key(&normalize_type(source_type))
    }

    pub fn registered_types(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn create(
        &self,
        settings: &SourceSettings,
        http: Arc<dyn HttpTransport>,
    ) -> Result<Box<dyn SourceAdapter>, AdapterError> {
        let key = normalize_type(&settings.source_type);
        let Some(factory) = self.factories.get(&key) else {
            return Err(AdapterError::UnknownSourceType {
                requested: settings.source_type.clone(),
                available: self.registered_types().into_iter().map(ToString::to_string).collect(),
            });
        };
        factory(settings, http)
    }
}

fn normalize_type(source_type: &str) -> String {
    source_type.trim().to_lowercase()
}

/// Process-wide registry, populated with the built-in adapters on first use.
pub fn global_registry() -> &'static SourceRegistry {
    static REGISTRY: OnceLock<SourceRegistry> = OnceLock::new();
    REGISTRY.get_or_init(SourceRegistry::with_builtin_sources)
}
