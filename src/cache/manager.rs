//! Cache manager that matches requests to strategies and runs them.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::storage::CacheStore;
use super::strategy::{CacheStrategy, CacheStrategyConfig, DEFAULT_NETWORK_TIMEOUT};
use super::traits::{CacheEntry, CacheResult, CacheSource, CacheStats};
use crate::net::{Network, Request, Response};

/// Routes requests through registered cache strategies.
///
/// The manager sits between callers and the network. `get` never fails:
/// timeouts, fetch errors and cache write failures are absorbed and a total
/// failure resolves to `None`.
#[derive(Clone)]
pub struct CacheManager {
  store: Arc<dyn CacheStore>,
  network: Arc<dyn Network>,
  strategies: Arc<RwLock<Vec<CacheStrategyConfig>>>,
  /// Caches owned by other components that garbage collection must keep
  reserved: Arc<BTreeSet<String>>,
  precache: Arc<Vec<String>>,
  counters: Arc<Mutex<HashMap<String, (u64, u64)>>>,
  background: TaskTracker,
}

impl CacheManager {
  pub fn new(store: Arc<dyn CacheStore>, network: Arc<dyn Network>) -> Self {
    Self {
      store,
      network,
      strategies: Arc::new(RwLock::new(Vec::new())),
      reserved: Arc::new(BTreeSet::new()),
      precache: Arc::new(Vec::new()),
      counters: Arc::new(Mutex::new(HashMap::new())),
      background: TaskTracker::new(),
    }
  }

  /// Keep `cache_name` during garbage collection even if no strategy uses it.
  pub fn with_reserved_cache(mut self, cache_name: impl Into<String>) -> Self {
    let mut reserved = (*self.reserved).clone();
    reserved.insert(cache_name.into());
    self.reserved = Arc::new(reserved);
    self
  }

  /// URLs fetched into their strategy's cache during `initialize`.
  pub fn with_precache(mut self, urls: Vec<String>) -> Self {
    self.precache = Arc::new(urls);
    self
  }

  pub fn store(&self) -> &Arc<dyn CacheStore> {
    &self.store
  }

  /// Register strategies, open their caches, drop unreferenced caches and
  /// pre-warm critical resources.
  ///
  /// Calling this again with the same registry only re-opens caches; already
  /// cached pre-warm URLs are not fetched again.
  pub async fn initialize(&self, strategies: Vec<CacheStrategyConfig>) -> Result<()> {
    let mut seen = BTreeSet::new();
    for config in &strategies {
      if !seen.insert(config.cache_name.as_str()) {
        return Err(eyre!(
          "Cache {} is configured by more than one strategy",
          config.cache_name
        ));
      }
    }

    for config in &strategies {
      self.store.open(&config.cache_name)?;
    }
    for name in self.reserved.iter() {
      self.store.open(name)?;
    }

    {
      let mut registry = self
        .strategies
        .write()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      *registry = strategies;
    }

    let keep = self.referenced_caches();
    let purged = self.delete_stale_caches(&keep)?;
    if !purged.is_empty() {
      info!(caches = ?purged, "Deleted unreferenced caches");
    }

    self.prewarm().await;
    Ok(())
  }

  /// Names of caches referenced by the registry or reserved.
  pub fn referenced_caches(&self) -> BTreeSet<String> {
    let mut keep: BTreeSet<String> = self.reserved.iter().cloned().collect();
    if let Ok(registry) = self.strategies.read() {
      keep.extend(registry.iter().map(|c| c.cache_name.clone()));
    }
    keep
  }

  /// Delete every cache whose name is not in `keep`. Returns the deleted names.
  pub fn delete_stale_caches(&self, keep: &BTreeSet<String>) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.store.cache_names()? {
      if !keep.contains(&name) && self.store.delete_cache(&name)? {
        deleted.push(name);
      }
    }
    Ok(deleted)
  }

  async fn prewarm(&self) {
    for url in self.precache.iter() {
      let request = match Request::get(url) {
        Ok(r) => r,
        Err(e) => {
          warn!("Skipping pre-cache URL: {}", e);
          continue;
        }
      };
      let Some(config) = self.match_strategy(request.url.as_str()) else {
        debug!(%url, "No strategy for pre-cache URL");
        continue;
      };
      if self.read_cache(&config, &request).is_some() {
        continue;
      }
      match self.fetch_with_timeout(&request, config.timeout()).await {
        Ok(resp) => self.write_cache(&config, &request, &resp),
        Err(e) => warn!(%url, "Pre-cache fetch failed: {}", e),
      }
    }
  }

  /// First registered strategy whose pattern matches `url`.
  pub fn match_strategy(&self, url: &str) -> Option<CacheStrategyConfig> {
    self
      .strategies
      .read()
      .ok()?
      .iter()
      .find(|c| c.matches(url))
      .cloned()
  }

  /// Resolve a request through its strategy. `None` on total failure.
  pub async fn get(&self, request: &Request) -> Option<Response> {
    self.get_with_source(request).await.map(|r| r.data)
  }

  /// Like [`CacheManager::get`] but also reports where the response came from.
  pub async fn get_with_source(&self, request: &Request) -> Option<CacheResult<Response>> {
    let Some(config) = self.match_strategy(request.url.as_str()) else {
      debug!(url = %request.url, "No cache strategy, going to network");
      return self
        .fetch_with_timeout(request, DEFAULT_NETWORK_TIMEOUT)
        .await
        .ok()
        .map(CacheResult::from_network);
    };

    debug!(url = %request.url, strategy = ?config.strategy, cache = %config.cache_name, "Routing request");

    let result = match config.strategy {
      CacheStrategy::CacheFirst => self.cache_first(&config, request).await,
      CacheStrategy::NetworkFirst => self.network_first(&config, request).await,
      CacheStrategy::StaleWhileRevalidate => self.stale_while_revalidate(&config, request).await,
      CacheStrategy::NetworkOnly => self
        .fetch_with_timeout(request, config.timeout())
        .await
        .map_err(|e| debug!(url = %request.url, "Network-only request failed: {}", e))
        .ok()
        .map(CacheResult::from_network),
      CacheStrategy::CacheOnly => self
        .read_cache(&config, request)
        .map(|entry| CacheResult::from_cache(entry.response, entry.stored_at, false)),
    };

    let hit = matches!(
      result.as_ref().map(|r| r.source),
      Some(CacheSource::CacheFresh | CacheSource::CacheStale | CacheSource::Offline)
    );
    self.record(&config.cache_name, hit);

    result
  }

  async fn cache_first(
    &self,
    config: &CacheStrategyConfig,
    request: &Request,
  ) -> Option<CacheResult<Response>> {
    if let Some(entry) = self.read_cache(config, request) {
      let stale = entry.is_stale(config.max_age, Utc::now());
      if stale {
        self.spawn_refresh(config.clone(), request.clone());
      }
      return Some(CacheResult::from_cache(entry.response, entry.stored_at, stale));
    }

    match self.fetch_with_timeout(request, config.timeout()).await {
      Ok(resp) => {
        self.write_cache(config, request, &resp);
        Some(CacheResult::from_network(resp))
      }
      Err(e) => {
        debug!(url = %request.url, "Cache-first fetch failed: {}", e);
        None
      }
    }
  }

  async fn network_first(
    &self,
    config: &CacheStrategyConfig,
    request: &Request,
  ) -> Option<CacheResult<Response>> {
    match self.fetch_with_timeout(request, config.timeout()).await {
      Ok(resp) => {
        self.write_cache(config, request, &resp);
        Some(CacheResult::from_network(resp))
      }
      Err(e) => {
        debug!(url = %request.url, "Network-first fell back to cache: {}", e);
        self
          .read_cache(config, request)
          .map(|entry| CacheResult::offline(entry.response, entry.stored_at))
      }
    }
  }

  async fn stale_while_revalidate(
    &self,
    config: &CacheStrategyConfig,
    request: &Request,
  ) -> Option<CacheResult<Response>> {
    if let Some(entry) = self.read_cache(config, request) {
      let stale = entry.is_stale(config.max_age, Utc::now());
      self.spawn_refresh(config.clone(), request.clone());
      return Some(CacheResult::from_cache(entry.response, entry.stored_at, stale));
    }

    match self.fetch_with_timeout(request, config.timeout()).await {
      Ok(resp) => {
        self.write_cache(config, request, &resp);
        Some(CacheResult::from_network(resp))
      }
      Err(e) => {
        debug!(url = %request.url, "Revalidation fetch failed: {}", e);
        None
      }
    }
  }

  /// Network attempt bounded by `timeout`; the in-flight future is dropped on expiry.
  async fn fetch_with_timeout(&self, request: &Request, timeout: Duration) -> Result<Response> {
    match tokio::time::timeout(timeout, self.network.fetch(request)).await {
      Ok(result) => result,
      Err(_) => Err(eyre!(
        "Request to {} timed out after {:?}",
        request.url,
        timeout
      )),
    }
  }

  /// Cache lookup; storage errors count as a miss.
  fn read_cache(&self, config: &CacheStrategyConfig, request: &Request) -> Option<CacheEntry> {
    match self.store.get(&config.cache_name, &request.cache_key()) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(cache = %config.cache_name, "Cache read failed, treating as miss: {}", e);
        None
      }
    }
  }

  /// Store a successful response and enforce `max_entries`. Failures are logged.
  fn write_cache(&self, config: &CacheStrategyConfig, request: &Request, response: &Response) {
    if !response.is_success() {
      return;
    }

    let now = Utc::now();
    let entry = CacheEntry {
      key: request.cache_key(),
      cache_name: config.cache_name.clone(),
      url: request.url.to_string(),
      response: response.clone(),
      stored_at: now,
      timestamp: Some(response.date().unwrap_or(now)),
      max_age: config.max_age,
    };

    if let Err(e) = self.store.put(&entry) {
      warn!(cache = %config.cache_name, url = %request.url, "Cache write failed: {}", e);
      return;
    }

    if let Some(max) = config.max_entries {
      match self.store.evict_to(&config.cache_name, max) {
        Ok(0) => {}
        Ok(n) => debug!(cache = %config.cache_name, evicted = n, "Evicted oldest entries"),
        Err(e) => warn!(cache = %config.cache_name, "Eviction failed: {}", e),
      }
    }
  }

  fn spawn_refresh(&self, config: CacheStrategyConfig, request: Request) {
    let this = self.clone();
    self.background.spawn(async move {
      match this.fetch_with_timeout(&request, config.timeout()).await {
        Ok(resp) => this.write_cache(&config, &request, &resp),
        Err(e) => debug!(url = %request.url, "Background refresh failed: {}", e),
      }
    });
  }

  fn record(&self, cache_name: &str, hit: bool) {
    if let Ok(mut counters) = self.counters.lock() {
      let entry = counters.entry(cache_name.to_string()).or_default();
      if hit {
        entry.0 += 1;
      } else {
        entry.1 += 1;
      }
    }
  }

  /// Hit/miss counters and entry counts for every registered cache.
  pub fn stats(&self) -> HashMap<String, CacheStats> {
    let counters = self
      .counters
      .lock()
      .map(|c| c.clone())
      .unwrap_or_default();

    self
      .referenced_caches()
      .into_iter()
      .map(|name| {
        let (hits, misses) = counters.get(&name).copied().unwrap_or_default();
        let entries = self.store.entry_count(&name).unwrap_or(0);
        (
          name,
          CacheStats {
            hits,
            misses,
            entries,
          },
        )
      })
      .collect()
  }

  /// Remove all entries of one cache.
  pub fn clear(&self, cache_name: &str) -> Result<()> {
    self.store.clear(cache_name)
  }

  /// Wait for all background refreshes started so far.
  pub async fn settle(&self) {
    self.background.close();
    self.background.wait().await;
    self.background.reopen();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::SqliteStore;
  use crate::cache::strategy::UrlPattern;
  use crate::db::Database;
  use crate::net::fake::{FakeNetwork, FakeReply};
  use std::time::Instant;

  const URL: &str = "https://app.test/api/charts";

  fn setup() -> (CacheManager, Arc<FakeNetwork>, Arc<SqliteStore>) {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let store = Arc::new(SqliteStore::new(db));
    let net = Arc::new(FakeNetwork::new());
    let manager = CacheManager::new(store.clone(), net.clone());
    (manager, net, store)
  }

  fn strategy(kind: CacheStrategy) -> CacheStrategyConfig {
    CacheStrategyConfig::new("api", UrlPattern::contains("/api/"), kind, "api-v1")
  }

  fn seed(store: &SqliteStore, url: &str, body: &str, age_secs: i64) {
    let request = Request::get(url).unwrap();
    let at = Utc::now() - chrono::Duration::seconds(age_secs);
    store
      .put(&CacheEntry {
        key: request.cache_key(),
        cache_name: "api-v1".to_string(),
        url: url.to_string(),
        response: Response::ok(body),
        stored_at: at,
        timestamp: Some(at),
        max_age: Some(60),
      })
      .unwrap();
  }

  fn body(resp: Option<Response>) -> Option<String> {
    resp.map(|r| r.text())
  }

  #[tokio::test]
  async fn test_cache_first_fresh_hit_skips_network() {
    let (manager, net, store) = setup();
    manager
      .initialize(vec![strategy(CacheStrategy::CacheFirst).with_max_age(60)])
      .await
      .unwrap();
    seed(&store, URL, "cached", 0);

    let result = manager
      .get_with_source(&Request::get(URL).unwrap())
      .await
      .unwrap();
    manager.settle().await;

    assert_eq!(result.data.text(), "cached");
    assert_eq!(result.source, CacheSource::CacheFresh);
    assert_eq!(net.total_calls(), 0);
    assert_eq!(manager.stats()["api-v1"].hits, 1);
  }

  #[tokio::test]
  async fn test_cache_first_stale_returns_cached_and_refreshes_once() {
    let (manager, net, store) = setup();
    manager
      .initialize(vec![strategy(CacheStrategy::CacheFirst).with_max_age(60)])
      .await
      .unwrap();
    seed(&store, URL, "old", 120);
    net.set(
      URL,
      FakeReply::Delayed(
        Duration::from_millis(20),
        Box::new(FakeReply::Respond(Response::ok("new"))),
      ),
    );

    let result = manager
      .get_with_source(&Request::get(URL).unwrap())
      .await
      .unwrap();
    assert_eq!(result.data.text(), "old");
    assert_eq!(result.source, CacheSource::CacheStale);

    manager.settle().await;
    assert_eq!(net.calls(URL), 1);

    // The refresh replaced the entry
    let again = manager.get(&Request::get(URL).unwrap()).await;
    manager.settle().await;
    assert_eq!(body(again).as_deref(), Some("new"));
    assert_eq!(net.calls(URL), 1);
  }

  #[tokio::test]
  async fn test_cache_first_miss_fetches_and_stores() {
    let (manager, net, _) = setup();
    manager
      .initialize(vec![strategy(CacheStrategy::CacheFirst)])
      .await
      .unwrap();
    net.respond(URL, 200, "fresh");

    assert_eq!(body(manager.get(&Request::get(URL).unwrap()).await).as_deref(), Some("fresh"));
    assert_eq!(body(manager.get(&Request::get(URL).unwrap()).await).as_deref(), Some("fresh"));
    assert_eq!(net.calls(URL), 1);

    let stats = manager.stats()["api-v1"];
    assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
  }

  #[tokio::test]
  async fn test_cache_first_network_failure_is_none() {
    let (manager, net, _) = setup();
    manager
      .initialize(vec![strategy(CacheStrategy::CacheFirst)])
      .await
      .unwrap();
    net.set_online(false);

    assert!(manager.get(&Request::get(URL).unwrap()).await.is_none());
  }

  #[tokio::test]
  async fn test_entry_without_timestamp_is_stale() {
    let (manager, net, store) = setup();
    manager
      .initialize(vec![strategy(CacheStrategy::CacheFirst).with_max_age(3600)])
      .await
      .unwrap();
    let request = Request::get(URL).unwrap();
    store
      .put(&CacheEntry {
        key: request.cache_key(),
        cache_name: "api-v1".to_string(),
        url: URL.to_string(),
        response: Response::ok("undated"),
        stored_at: Utc::now(),
        timestamp: None,
        max_age: Some(3600),
      })
      .unwrap();
    net.respond(URL, 200, "dated");

    let result = manager.get_with_source(&request).await.unwrap();
    manager.settle().await;
    assert_eq!(result.source, CacheSource::CacheStale);
    assert_eq!(net.calls(URL), 1);
  }

  #[tokio::test]
  async fn test_network_first_success_updates_cache() {
    let (manager, net, store) = setup();
    manager
      .initialize(vec![strategy(CacheStrategy::NetworkFirst)])
      .await
      .unwrap();
    seed(&store, URL, "old", 0);
    net.respond(URL, 200, "new");

    let result = manager
      .get_with_source(&Request::get(URL).unwrap())
      .await
      .unwrap();
    assert_eq!(result.data.text(), "new");
    assert_eq!(result.source, CacheSource::Network);

    let key = Request::get(URL).unwrap().cache_key();
    assert_eq!(store.get("api-v1", &key).unwrap().unwrap().response.text(), "new");
  }

  #[tokio::test]
  async fn test_network_first_timeout_falls_back_to_cache() {
    let (manager, net, store) = setup();
    manager
      .initialize(vec![strategy(CacheStrategy::NetworkFirst).with_network_timeout(0.05)])
      .await
      .unwrap();
    seed(&store, URL, "prior", 0);
    net.set(
      URL,
      FakeReply::Delayed(
        Duration::from_secs(10),
        Box::new(FakeReply::Respond(Response::ok("late"))),
      ),
    );

    let started = Instant::now();
    let result = manager
      .get_with_source(&Request::get(URL).unwrap())
      .await
      .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(result.data.text(), "prior");
    assert_eq!(result.source, CacheSource::Offline);
  }

  #[tokio::test]
  async fn test_network_first_nothing_available() {
    let (manager, net, _) = setup();
    manager
      .initialize(vec![strategy(CacheStrategy::NetworkFirst).with_network_timeout(0.05)])
      .await
      .unwrap();
    net.set(URL, FakeReply::Fail("connection reset".into()));

    assert!(manager.get(&Request::get(URL).unwrap()).await.is_none());
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_always_refreshes() {
    let (manager, net, store) = setup();
    manager
      .initialize(vec![strategy(CacheStrategy::StaleWhileRevalidate).with_max_age(3600)])
      .await
      .unwrap();
    seed(&store, URL, "cached", 0);
    net.respond(URL, 200, "revalidated");

    let first = manager.get(&Request::get(URL).unwrap()).await;
    assert_eq!(body(first).as_deref(), Some("cached"));
    manager.settle().await;
    assert_eq!(net.calls(URL), 1);

    let second = manager.get(&Request::get(URL).unwrap()).await;
    assert_eq!(body(second).as_deref(), Some("revalidated"));
    manager.settle().await;
    assert_eq!(net.calls(URL), 2);
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_miss_waits_for_network() {
    let (manager, net, _) = setup();
    manager
      .initialize(vec![strategy(CacheStrategy::StaleWhileRevalidate)])
      .await
      .unwrap();
    net.respond(URL, 200, "first");

    assert_eq!(body(manager.get(&Request::get(URL).unwrap()).await).as_deref(), Some("first"));
    manager.settle().await;
    assert_eq!(net.calls(URL), 1);
  }

  #[tokio::test]
  async fn test_network_only_and_cache_only() {
    let (manager, net, store) = setup();
    let only_net = CacheStrategyConfig::new(
      "live",
      UrlPattern::contains("/live/"),
      CacheStrategy::NetworkOnly,
      "live-v1",
    );
    let only_cache = strategy(CacheStrategy::CacheOnly);
    manager.initialize(vec![only_net, only_cache]).await.unwrap();

    let live = "https://app.test/live/feed";
    net.respond(live, 200, "stream");
    assert_eq!(body(manager.get(&Request::get(live).unwrap()).await).as_deref(), Some("stream"));
    assert_eq!(store.entry_count("live-v1").unwrap(), 0);

    net.set_online(false);
    assert!(manager.get(&Request::get(live).unwrap()).await.is_none());

    assert!(manager.get(&Request::get(URL).unwrap()).await.is_none());
    seed(&store, URL, "offline copy", 10_000);
    assert_eq!(
      body(manager.get(&Request::get(URL).unwrap()).await).as_deref(),
      Some("offline copy")
    );
    assert_eq!(net.calls(URL), 0);
  }

  #[tokio::test]
  async fn test_fifo_eviction_keeps_newest_three() {
    let (manager, net, store) = setup();
    manager
      .initialize(vec![strategy(CacheStrategy::NetworkFirst).with_max_entries(3)])
      .await
      .unwrap();

    let urls: Vec<String> = ["a", "b", "c", "d"]
      .iter()
      .map(|k| format!("https://app.test/api/{}", k))
      .collect();
    for url in &urls {
      net.respond(url, 200, url);
      manager.get(&Request::get(url).unwrap()).await.unwrap();
    }

    let expected: Vec<String> = urls[1..]
      .iter()
      .map(|u| Request::get(u).unwrap().cache_key())
      .collect();
    assert_eq!(store.keys("api-v1").unwrap(), expected);
  }

  #[tokio::test]
  async fn test_non_success_responses_are_not_cached() {
    let (manager, net, store) = setup();
    manager
      .initialize(vec![strategy(CacheStrategy::NetworkFirst)])
      .await
      .unwrap();
    net.respond(URL, 500, "boom");

    let resp = manager.get(&Request::get(URL).unwrap()).await.unwrap();
    assert_eq!(resp.status, 500);
    assert_eq!(store.entry_count("api-v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_quota_failure_does_not_abort_strategy() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let store = Arc::new(SqliteStore::new(db).with_quota(2));
    let net = Arc::new(FakeNetwork::new());
    let manager = CacheManager::new(store.clone(), net.clone());
    manager
      .initialize(vec![strategy(CacheStrategy::NetworkFirst)])
      .await
      .unwrap();
    net.respond(URL, 200, "too large for quota");

    let resp = manager.get(&Request::get(URL).unwrap()).await;
    assert_eq!(body(resp).as_deref(), Some("too large for quota"));
    assert_eq!(store.entry_count("api-v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_first_matching_strategy_wins() {
    let (manager, net, _) = setup();
    let first = CacheStrategyConfig::new(
      "charts",
      UrlPattern::regex(r"/api/charts").unwrap(),
      CacheStrategy::CacheOnly,
      "charts-v1",
    );
    manager
      .initialize(vec![first, strategy(CacheStrategy::NetworkFirst)])
      .await
      .unwrap();
    net.respond(URL, 200, "network");

    assert!(manager.get(&Request::get(URL).unwrap()).await.is_none());
    assert_eq!(net.total_calls(), 0);
    assert_eq!(manager.match_strategy(URL).unwrap().name, "charts");
  }

  #[tokio::test]
  async fn test_initialize_purges_unreferenced_caches_and_prewarms() {
    let (manager, net, store) = setup();
    store.open("api-v0").unwrap();
    store.open("offline").unwrap();
    let manager = manager
      .with_reserved_cache("offline")
      .with_precache(vec![URL.to_string()]);
    net.respond(URL, 200, "warm");

    manager
      .initialize(vec![strategy(CacheStrategy::CacheFirst)])
      .await
      .unwrap();
    assert_eq!(store.cache_names().unwrap(), vec!["api-v1", "offline"]);
    assert_eq!(store.entry_count("api-v1").unwrap(), 1);

    // Idempotent: nothing fetched twice
    manager
      .initialize(vec![strategy(CacheStrategy::CacheFirst)])
      .await
      .unwrap();
    assert_eq!(net.calls(URL), 1);
  }

  #[tokio::test]
  async fn test_duplicate_cache_name_is_rejected() {
    let (manager, _, _) = setup();
    let result = manager
      .initialize(vec![
        strategy(CacheStrategy::CacheFirst),
        strategy(CacheStrategy::NetworkFirst),
      ])
      .await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_unmatched_request_goes_to_network_uncached() {
    let (manager, net, store) = setup();
    manager
      .initialize(vec![strategy(CacheStrategy::CacheFirst)])
      .await
      .unwrap();
    let other = "https://app.test/about";
    net.respond(other, 200, "about");

    assert_eq!(body(manager.get(&Request::get(other).unwrap()).await).as_deref(), Some("about"));
    assert_eq!(store.entry_count("api-v1").unwrap(), 0);
  }
}
