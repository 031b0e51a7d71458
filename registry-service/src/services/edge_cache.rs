//! Edge cache adapter: a Cloudflare Workers KV namespace read by the gateway.

use crate::config::EdgeCacheConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One page of a prefix listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPage {
    pub keys: Vec<String>,
    pub next_cursor: Option<String>,
    pub complete: bool,
}

#[async_trait]
pub trait EdgeCache: Send + Sync {
    /// False when running with placeholder credentials; callers skip cache work.
    fn is_configured(&self) -> bool;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn list_keys(&self, prefix: &str, cursor: Option<&str>) -> Result<KeyPage>;
}

#[derive(Debug, Deserialize)]
struct ListKeysResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    result: Vec<KeyEntry>,
    #[serde(default)]
    result_info: Option<ResultInfo>,
    #[serde(default)]
    errors: Vec<ApiMessage>,
}

#[derive(Debug, Deserialize)]
struct KeyEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ResultInfo {
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// Cloudflare KV REST client.
#[derive(Clone)]
pub struct CloudflareKv {
    client: Client,
    config: EdgeCacheConfig,
}

impl CloudflareKv {
    pub fn new(config: EdgeCacheConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build edge cache HTTP client")?;
        Ok(Self { client, config })
    }

    fn namespace_url(&self, tail: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.config.api_base_url)
            .with_context(|| format!("Invalid CF_API_BASE_URL '{}'", self.config.api_base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("CF_API_BASE_URL cannot be a base URL"))?
            .pop_if_empty()
            .extend(["accounts", self.config.account_id.as_str(), "storage", "kv", "namespaces"])
            .push(&self.config.namespace_id)
            .extend(tail);
        Ok(url)
    }

    fn ensure_configured(&self) -> Result<()> {
        if self.is_configured() {
            Ok(())
        } else {
            Err(anyhow!("Edge cache credentials not configured"))
        }
    }
}

#[async_trait]
impl EdgeCache for CloudflareKv {
    fn is_configured(&self) -> bool {
        self.config.has_credentials()
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_configured()?;
        let url = self.namespace_url(&["values", key])?;

        let response = self
            .client
            .get(url)
            .bearer_auth(self.config.api_token.expose_secret())
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.text().await?)),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(anyhow!("Edge cache GET '{}' failed with {}: {}", key, status, body))
            }
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.ensure_configured()?;
        let url = self.namespace_url(&["values", key])?;

        let response = self
            .client
            .put(url)
            .bearer_auth(self.config.api_token.expose_secret())
            .body(value.to_string())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(key = %key, "Edge cache entry written");
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(anyhow!("Edge cache PUT '{}' failed with {}: {}", key, status, body))
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_configured()?;
        let url = self.namespace_url(&["values", key])?;

        let response = self
            .client
            .delete(url)
            .bearer_auth(self.config.api_token.expose_secret())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(anyhow!("Edge cache DELETE '{}' failed with {}: {}", key, status, body))
        }
    }

    async fn list_keys(&self, prefix: &str, cursor: Option<&str>) -> Result<KeyPage> {
        self.ensure_configured()?;
        let mut url = self.namespace_url(&["keys"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("prefix", prefix);
            if let Some(cursor) = cursor {
                query.append_pair("cursor", cursor);
            }
        }

        let response = self
            .client
            .get(url)
            .bearer_auth(self.config.api_token.expose_secret())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!("Edge cache key listing failed with {}: {}", status, body));
        }

        let parsed: ListKeysResponse =
            serde_json::from_str(&body).context("Malformed edge cache key listing")?;
        if !parsed.success {
            let reasons: Vec<String> = parsed
                .errors
                .iter()
                .map(|e| format!("{} {}", e.code, e.message))
                .collect();
            return Err(anyhow!("Edge cache key listing rejected: {}", reasons.join("; ")));
        }

        let next_cursor = parsed
            .result_info
            .and_then(|info| info.cursor)
            .filter(|c| !c.is_empty());
        Ok(KeyPage {
            keys: parsed.result.into_iter().map(|k| k.name).collect(),
            complete: next_cursor.is_none(),
            next_cursor,
        })
    }
}

/// In-memory edge cache with failure injection.
pub struct MemoryEdgeCache {
    entries: Mutex<BTreeMap<String, String>>,
    page_size: usize,
    configured: AtomicBool,
    unreachable: AtomicBool,
    fail_puts: AtomicBool,
    failing_keys: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
}

impl Default for MemoryEdgeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEdgeCache {
    pub fn new() -> Self {
        Self::with_page_size(100)
    }

    /// Listing returns at most `page_size` keys per page.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            page_size: page_size.max(1),
            configured: AtomicBool::new(true),
            unreachable: AtomicBool::new(false),
            fail_puts: AtomicBool::new(false),
            failing_keys: Mutex::new(HashSet::new()),
            delays: Mutex::new(HashMap::new()),
        }
    }

    /// Behave as if running with placeholder credentials.
    pub fn set_configured(&self, configured: bool) {
        self.configured.store(configured, Ordering::SeqCst);
    }

    /// Every call fails.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Puts fail; reads and deletes keep working.
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Reads of `key` fail.
    pub fn fail_key(&self, key: &str) {
        if let Ok(mut keys) = self.failing_keys.lock() {
            keys.insert(key.to_string());
        }
    }

    /// Reads of `key` stall for `delay` before answering.
    pub fn delay_key(&self, key: &str, delay: Duration) {
        if let Ok(mut delays) = self.delays.lock() {
            delays.insert(key.to_string(), delay);
        }
    }

    /// Seeds an entry directly, bypassing failure injection.
    pub fn insert(&self, key: &str, value: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), value.to_string());
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(anyhow!("Edge cache unreachable"))
        } else {
            Ok(())
        }
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|e| anyhow!("Edge cache mutex poisoned: {}", e))
    }
}

#[async_trait]
impl EdgeCache for MemoryEdgeCache {
    fn is_configured(&self) -> bool {
        self.configured.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_reachable()?;
        let delay = self.delays.lock().ok().and_then(|d| d.get(key).copied());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failing_keys
            .lock()
            .map(|keys| keys.contains(key))
            .unwrap_or(false);
        if failing {
            return Err(anyhow!("Injected read failure for '{}'", key));
        }
        Ok(self.entries()?.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.check_reachable()?;
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(anyhow!("Injected write failure for '{}'", key));
        }
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_reachable()?;
        self.entries()?.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str, cursor: Option<&str>) -> Result<KeyPage> {
        self.check_reachable()?;
        let entries = self.entries()?;
        let offset: usize = match cursor {
            Some(c) => c.parse().with_context(|| format!("Invalid cursor '{}'", c))?,
            None => 0,
        };
        let matching: Vec<&String> = entries.keys().filter(|k| k.starts_with(prefix)).collect();
        let keys: Vec<String> = matching
            .iter()
            .skip(offset)
            .take(self.page_size)
            .map(|k| (*k).clone())
            .collect();
        let end = offset + keys.len();
        let complete = end >= matching.len();
        Ok(KeyPage {
            keys,
            next_cursor: (!complete).then(|| end.to_string()),
            complete,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::Secret;
    use std::time::Duration;
    use wiremock::matchers::{body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const NS_PATH: &str = "/accounts/acct/storage/kv/namespaces/ns";

    fn client(base: &str) -> CloudflareKv {
        CloudflareKv::new(EdgeCacheConfig {
            account_id: "acct".to_string(),
            api_token: Secret::new("cf-token".to_string()),
            namespace_id: "ns".to_string(),
            api_base_url: base.to_string(),
            timeout: Duration::from_secs(2),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn get_returns_none_on_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{}/values/token:abc", NS_PATH)))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let kv = client(&server.uri());
        assert_eq!(kv.get("token:abc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_sends_bearer_and_raw_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path(format!("{}/values/routes", NS_PATH)))
            .and(header("authorization", "Bearer cf-token"))
            .and(body_string("{}"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client(&server.uri()).put("routes", "{}").await.unwrap();
    }

    #[tokio::test]
    async fn list_keys_follows_cursor_semantics() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{}/keys", NS_PATH)))
            .and(query_param("prefix", "token:"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "result": [{"name": "token:a"}, {"name": "token:b"}],
                "result_info": {"count": 2, "cursor": "next-page"}
            })))
            .mount(&server)
            .await;

        let page = client(&server.uri()).list_keys("token:", None).await.unwrap();
        assert_eq!(page.keys, vec!["token:a".to_string(), "token:b".to_string()]);
        assert_eq!(page.next_cursor.as_deref(), Some("next-page"));
        assert!(!page.complete);
    }

    #[tokio::test]
    async fn sentinel_credentials_disable_client() {
        let kv = CloudflareKv::new(EdgeCacheConfig {
            account_id: "dummy".to_string(),
            api_token: Secret::new("dummy".to_string()),
            namespace_id: "dummy".to_string(),
            api_base_url: "http://127.0.0.1:9".to_string(),
            timeout: Duration::from_secs(1),
        })
        .unwrap();
        assert!(!kv.is_configured());
        assert!(kv.get("token:x").await.is_err());
    }

    #[tokio::test]
    async fn memory_cache_paginates() {
        let cache = MemoryEdgeCache::with_page_size(2);
        for key in ["token:a", "token:b", "token:c", "routes"] {
            cache.insert(key, "{}");
        }

        let first = cache.list_keys("token:", None).await.unwrap();
        assert_eq!(first.keys.len(), 2);
        assert!(!first.complete);

        let second = cache
            .list_keys("token:", first.next_cursor.as_deref())
            .await
            .unwrap();
        assert_eq!(second.keys, vec!["token:c".to_string()]);
        assert!(second.complete);
        assert!(second.next_cursor.is_none());
    }
}
