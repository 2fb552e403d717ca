use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use upstream::{ModelSource, UpstreamError};

static DATE_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)-(\d{4}-\d{2}-\d{2})(?:-[a-z0-9]+)?$").expect("date suffix pattern")
});

/// Strips a trailing `-YYYY-MM-DD` (optionally followed by one short token).
pub fn simplify(real_id: &str) -> String {
    let model = real_id.trim();
    match DATE_SUFFIX.find(model) {
        Some(m) => model[..m.start()].to_string(),
        None => model.to_string(),
    }
}

/// Display names and the alias map for a set of real ids.
///
/// Aliases that two distinct real ids would share are not created; both ids
/// are then shown and resolved under their own name only.
pub fn build_mapping(real_ids: &[String]) -> (Vec<String>, HashMap<String, String>) {
    let mut simplified_map: HashMap<String, &str> = HashMap::new();
    let mut collisions: HashSet<String> = HashSet::new();
    for real in real_ids {
        let simplified = simplify(real);
        match simplified_map.get(&simplified) {
            Some(existing) if *existing != real.as_str() => {
                collisions.insert(simplified);
            }
            _ => {
                simplified_map.insert(simplified, real);
            }
        }
    }

    let mut aliases: HashMap<String, String> = real_ids
        .iter()
        .map(|real| (real.clone(), real.clone()))
        .collect();
    let mut display = BTreeSet::new();
    for real in real_ids {
        let simplified = simplify(real);
        if collisions.contains(&simplified) || simplified == *real {
            display.insert(real.clone());
        } else {
            aliases.insert(simplified.clone(), real.clone());
            display.insert(simplified);
        }
    }

    (display.into_iter().collect(), aliases)
}

#[derive(Debug, Default)]
struct Snapshot {
    display: Vec<String>,
    aliases: HashMap<String, String>,
    loaded_at: Option<DateTime<Utc>>,
}

/// Alias cache for the upstream's model list. Each refresh replaces the
/// whole snapshot; the lock is never held across the upstream call.
pub struct ModelCache {
    source: Arc<dyn ModelSource>,
    snapshot: Mutex<Arc<Snapshot>>,
}

impl ModelCache {
    pub fn new(source: Arc<dyn ModelSource>) -> Self {
        Self {
            source,
            snapshot: Mutex::new(Arc::new(Snapshot::default())),
        }
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.current().display.is_empty()
    }

    /// Returns the number of display names now cached.
    pub async fn refresh(&self) -> Result<usize, UpstreamError> {
        let real_ids = self.source.list_models().await?;
        if real_ids.is_empty() {
            return Err(UpstreamError::NoModels);
        }
        let (display, aliases) = build_mapping(&real_ids);
        let count = display.len();
        let next = Arc::new(Snapshot {
            display,
            aliases,
            loaded_at: Some(Utc::now()),
        });
        *self.snapshot.lock() = next;
        Ok(count)
    }

    pub async fn ensure_loaded(&self) -> Result<(), UpstreamError> {
        if self.is_empty() {
            let count = self.refresh().await?;
            log::info!("[models] cached {count} models");
        }
        Ok(())
    }

    /// Unknown names pass through unchanged.
    pub fn resolve(&self, name: &str) -> String {
        self.current()
            .aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    pub fn snapshot(&self) -> (Vec<String>, Option<DateTime<Utc>>) {
        let current = self.current();
        (current.display.clone(), current.loaded_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSource {
        models: Mutex<Result<Vec<String>, u16>>,
        calls: AtomicUsize,
    }

    impl FakeSource {
        fn with(models: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                models: Mutex::new(Ok(models.iter().map(|m| m.to_string()).collect())),
                calls: AtomicUsize::new(0),
            })
        }

        fn set(&self, models: Result<Vec<String>, u16>) {
            *self.models.lock() = models;
        }
    }

    #[async_trait]
    impl ModelSource for FakeSource {
        async fn list_models(&self) -> Result<Vec<String>, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &*self.models.lock() {
                Ok(models) => Ok(models.clone()),
                Err(status) => Err(UpstreamError::Status {
                    status: *status,
                    body: "boom".to_string(),
                }),
            }
        }
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn simplify_strips_date_suffix() {
        assert_eq!(simplify("gpt-4o-2024-08-06"), "gpt-4o");
        assert_eq!(simplify("gpt-4o"), "gpt-4o");
        assert_eq!(simplify("custom-2024-08-06-preview"), "custom");
        assert_eq!(simplify("  o1-2024-12-17 "), "o1");
        assert_eq!(simplify("model-2024-08"), "model-2024-08");
    }

    #[test]
    fn single_dated_id_gets_alias() {
        let (display, aliases) = build_mapping(&ids(&["gpt-4o-2024-08-06"]));
        assert_eq!(display, vec!["gpt-4o"]);
        assert_eq!(aliases["gpt-4o"], "gpt-4o-2024-08-06");
        assert_eq!(aliases["gpt-4o-2024-08-06"], "gpt-4o-2024-08-06");
    }

    #[test]
    fn colliding_aliases_are_not_created() {
        let (display, aliases) = build_mapping(&ids(&["a-2024-01-01", "a-2024-02-02"]));
        assert_eq!(display, vec!["a-2024-01-01", "a-2024-02-02"]);
        assert!(!aliases.contains_key("a"));
        assert_eq!(aliases["a-2024-01-01"], "a-2024-01-01");
        assert_eq!(aliases["a-2024-02-02"], "a-2024-02-02");
    }

    #[test]
    fn undated_id_colliding_with_dated_one_keeps_both_real_names() {
        let (display, aliases) = build_mapping(&ids(&["a", "a-2024-01-01"]));
        assert_eq!(display, vec!["a", "a-2024-01-01"]);
        assert_eq!(aliases["a"], "a");
    }

    #[test]
    fn every_real_id_resolves_to_itself_and_display_names_resolve() {
        let real = ids(&[
            "gpt-4o-2024-08-06",
            "gpt-4o-mini-2024-07-18",
            "o1-2024-12-17",
            "o1-2025-01-31",
            "text-embedding-3-small",
            "gpt-4o-mini-2024-07-18",
        ]);
        let (display, aliases) = build_mapping(&real);
        for id in &real {
            assert_eq!(&aliases[id], id);
        }
        for name in &display {
            assert!(aliases.contains_key(name), "{name} missing from alias map");
        }
        assert!(display.contains(&"gpt-4o-mini".to_string()));
        assert!(display.contains(&"o1-2024-12-17".to_string()));
        let mut sorted = display.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted, display);
    }

    #[tokio::test]
    async fn ensure_loaded_refreshes_only_when_empty() {
        let source = FakeSource::with(&["gpt-4o-2024-08-06"]);
        let cache = ModelCache::new(source.clone());
        assert!(cache.is_empty());

        cache.ensure_loaded().await.unwrap();
        cache.ensure_loaded().await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.resolve("gpt-4o"), "gpt-4o-2024-08-06");
        assert_eq!(cache.resolve("unknown-model"), "unknown-model");

        let (display, loaded_at) = cache.snapshot();
        assert_eq!(display, vec!["gpt-4o"]);
        assert!(loaded_at.is_some());
    }

    #[tokio::test]
    async fn refresh_replaces_rather_than_merges() {
        let source = FakeSource::with(&["gpt-4o-2024-08-06"]);
        let cache = ModelCache::new(source.clone());
        cache.refresh().await.unwrap();

        source.set(Ok(ids(&["o1-2024-12-17"])));
        cache.refresh().await.unwrap();
        assert_eq!(cache.resolve("gpt-4o"), "gpt-4o");
        assert_eq!(cache.resolve("o1"), "o1-2024-12-17");
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_snapshot() {
        let source = FakeSource::with(&["gpt-4o-2024-08-06"]);
        let cache = ModelCache::new(source.clone());
        cache.refresh().await.unwrap();

        source.set(Err(500));
        assert!(cache.refresh().await.is_err());
        assert_eq!(cache.resolve("gpt-4o"), "gpt-4o-2024-08-06");

        source.set(Ok(Vec::new()));
        assert!(matches!(cache.refresh().await, Err(UpstreamError::NoModels)));
        assert!(!cache.is_empty());
    }

    #[tokio::test]
    async fn empty_cache_surfaces_refresh_error() {
        let source = FakeSource::with(&[]);
        source.set(Err(401));
        let cache = ModelCache::new(source);
        assert!(matches!(
            cache.ensure_loaded().await,
            Err(UpstreamError::Status { status: 401, .. })
        ));
        assert_eq!(cache.resolve("gpt-4o"), "gpt-4o");
    }
}
