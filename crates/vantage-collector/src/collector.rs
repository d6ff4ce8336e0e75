use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use reqwest::Client;
use tracing::{debug, info, instrument, warn};
use vantage_core::StopToken;
use vantage_store::Store;

use crate::error::CollectorError;
use crate::extract::{extract_from_base64_blob, extract_from_json_text, extract_from_text, is_base64_encoded, is_json_content};
use crate::sources::SourceList;

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

/// Aggregate counts for one collection run, logged as a single summary
/// line when the run finishes (§10, grounded on the collector's
/// end-of-run report).
#[derive(Debug, Default)]
pub struct CollectRunSummary {
    pub total_sources: u64,
    pub successful_sources: u64,
    pub failed_sources: u64,
    pub total_configs: u64,
    pub json_content_count: u64,
    pub base64_content_count: u64,
    pub text_content_count: u64,
    pub empty_responses: u64,
    pub retry_attempts: u64,
}

#[derive(Default)]
struct Counters {
    successful_sources: AtomicU64,
    failed_sources: AtomicU64,
    total_configs: AtomicU64,
    json_content_count: AtomicU64,
    base64_content_count: AtomicU64,
    text_content_count: AtomicU64,
    empty_responses: AtomicU64,
    retry_attempts: AtomicU64,
}

/// Concurrently fetches every URL in a [`SourceList`], extracts proxy
/// URIs from each response, and inserts them into the store (§4.2). A
/// source that fails after retries, or whose content yields no configs,
/// is pruned from the source list so future runs don't keep paying for
/// it.
pub struct SubscriptionCollector {
    client: Client,
    max_workers: usize,
    timeout: Duration,
}

impl SubscriptionCollector {
    pub fn new(max_workers: usize, timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().user_agent(USER_AGENT).timeout(timeout).build()?;
        Ok(SubscriptionCollector { client, max_workers, timeout })
    }

    #[instrument(skip(self, store, sources, stop))]
    pub async fn collect(
        &self,
        store: &Store,
        sources: &SourceList,
        stop: &StopToken,
    ) -> Result<CollectRunSummary, CollectorError> {
        let urls = sources.read().await?;
        let total = urls.len() as u64;
        if urls.is_empty() {
            info!("no sources to collect from");
            return Ok(CollectRunSummary::default());
        }
        info!(total, workers = self.max_workers, "starting collection");

        let counters = Counters::default();
        let results: Vec<()> = stream::iter(urls.into_iter().enumerate())
            .map(|(idx, url)| {
                let counters = &counters;
                async move {
                    if stop.is_stopped() {
                        return;
                    }
                    self.process_one(store, sources, stop, &url, idx as u64 + 1, total, counters)
                        .await;
                }
            })
            .buffer_unordered(self.max_workers.max(1))
            .collect()
            .await;
        let _ = results;

        let summary = CollectRunSummary {
            total_sources: total,
            successful_sources: counters.successful_sources.load(Ordering::Relaxed),
            failed_sources: counters.failed_sources.load(Ordering::Relaxed),
            total_configs: counters.total_configs.load(Ordering::Relaxed),
            json_content_count: counters.json_content_count.load(Ordering::Relaxed),
            base64_content_count: counters.base64_content_count.load(Ordering::Relaxed),
            text_content_count: counters.text_content_count.load(Ordering::Relaxed),
            empty_responses: counters.empty_responses.load(Ordering::Relaxed),
            retry_attempts: counters.retry_attempts.load(Ordering::Relaxed),
        };
        info!(
            successful = summary.successful_sources,
            failed = summary.failed_sources,
            configs = summary.total_configs,
            "collection finished"
        );
        Ok(summary)
    }

    async fn process_one(
        &self,
        store: &Store,
        sources: &SourceList,
        stop: &StopToken,
        url: &str,
        idx: u64,
        total: u64,
        counters: &Counters,
    ) {
        let Some(content) = self.fetch_with_retry(url, idx, total, stop, counters).await else {
            counters.failed_sources.fetch_add(1, Ordering::Relaxed);
            let _ = sources.remove(url).await;
            return;
        };

        let configs = if is_json_content(&content) {
            let configs = extract_from_json_text(&content);
            counters.json_content_count.fetch_add(1, Ordering::Relaxed);
            configs
        } else if is_base64_encoded(&content) {
            let configs = extract_from_base64_blob(&content);
            counters.base64_content_count.fetch_add(1, Ordering::Relaxed);
            configs
        } else {
            let configs = extract_from_text(&content);
            counters.text_content_count.fetch_add(1, Ordering::Relaxed);
            configs
        };

        if configs.is_empty() {
            debug!(url, "source yielded no configs, pruning");
            counters.failed_sources.fetch_add(1, Ordering::Relaxed);
            let _ = sources.remove(url).await;
            return;
        }

        counters.successful_sources.fetch_add(1, Ordering::Relaxed);
        counters.total_configs.fetch_add(configs.len() as u64, Ordering::Relaxed);
        for uri in configs {
            if let Err(e) = store.insert_or_ignore_uri(&uri) {
                warn!(error = %e, "failed to insert collected uri");
            }
        }
    }

    async fn fetch_with_retry(
        &self,
        url: &str,
        idx: u64,
        total: u64,
        stop: &StopToken,
        counters: &Counters,
    ) -> Option<String> {
        for attempt in 0..MAX_RETRIES {
            if stop.is_stopped() {
                return None;
            }
            if attempt == 0 {
                debug!(idx, total, url, "fetching");
            } else {
                debug!(idx, total, url, attempt, "retrying");
            }

            match self.client.get(url).send().await {
                Ok(resp) => match resp.error_for_status() {
                    Ok(resp) => match resp.text().await {
                        Ok(text) if !text.trim().is_empty() => return Some(text),
                        Ok(_) => {
                            counters.empty_responses.fetch_add(1, Ordering::Relaxed);
                            if attempt + 1 < MAX_RETRIES {
                                counters.retry_attempts.fetch_add(1, Ordering::Relaxed);
                                tokio::time::sleep(RETRY_DELAY).await;
                                continue;
                            }
                            return None;
                        }
                        Err(_) => return None,
                    },
                    Err(_) => {
                        if attempt + 1 < MAX_RETRIES {
                            counters.retry_attempts.fetch_add(1, Ordering::Relaxed);
                            tokio::time::sleep(RETRY_DELAY).await;
                            continue;
                        }
                        return None;
                    }
                },
                Err(_) => {
                    if attempt + 1 < MAX_RETRIES {
                        counters.retry_attempts.fetch_add(1, Ordering::Relaxed);
                        tokio::time::sleep(RETRY_DELAY).await;
                        continue;
                    }
                    return None;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn collects_configs_from_plain_text_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sub"))
            .respond_with(ResponseTemplate::new(200).set_body_string("vmess://aaaa\nvless://bbbb@h:443"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let sources_path = dir.path().join("sources.txt");
        tokio::fs::write(&sources_path, format!("{}/sub\n", server.uri())).await.unwrap();
        let sources = SourceList::new(&sources_path);

        let store = Store::open_in_memory().unwrap();
        let stop = StopToken::new();
        let collector = SubscriptionCollector::new(4, Duration::from_secs(5)).unwrap();
        let summary = collector.collect(&store, &sources, &stop).await.unwrap();

        assert_eq!(summary.successful_sources, 1);
        assert_eq!(summary.total_configs, 2);
        assert_eq!(sources.read().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn prunes_source_that_returns_no_configs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/empty"))
            .respond_with(ResponseTemplate::new(200).set_body_string("nothing useful here"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let sources_path = dir.path().join("sources.txt");
        tokio::fs::write(&sources_path, format!("{}/empty\n", server.uri())).await.unwrap();
        let sources = SourceList::new(&sources_path);

        let store = Store::open_in_memory().unwrap();
        let stop = StopToken::new();
        let collector = SubscriptionCollector::new(4, Duration::from_secs(5)).unwrap();
        let summary = collector.collect(&store, &sources, &stop).await.unwrap();

        assert_eq!(summary.failed_sources, 1);
        assert_eq!(sources.read().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn raised_stop_token_halts_collection_early() {
        let store = Store::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let sources_path = dir.path().join("sources.txt");
        tokio::fs::write(&sources_path, "http://example.invalid/a\nhttp://example.invalid/b\n")
            .await
            .unwrap();
        let sources = SourceList::new(&sources_path);

        let stop = StopToken::new();
        stop.raise();
        let collector = SubscriptionCollector::new(4, Duration::from_secs(5)).unwrap();
        let summary = collector.collect(&store, &sources, &stop).await.unwrap();
        assert_eq!(summary.successful_sources, 0);
        assert_eq!(summary.failed_sources, 0);
    }
}
