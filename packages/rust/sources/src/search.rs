//! Web search over a JSON endpoint.
//!
//! The endpoint is called as `GET {endpoint}?q=...&country=..&count=..` and
//! must answer `{"results": [{"url": "...", "title": "..."}]}`.

use async_trait::async_trait;
use curricula_shared::{
    AuthorityHint, CountryProfile, CurriculaError, MAX_SEARCH_QUERIES, Result, SearchCapability,
    SearchConfig, SearchHit,
};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::{build_client, is_ssrf_target};

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    url: String,
    #[serde(default)]
    title: Option<String>,
}

pub struct HttpSearch {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    max_results: usize,
    countries: Vec<CountryProfile>,
    /// Allow loopback result URLs (tests only).
    allow_localhost: bool,
}

impl HttpSearch {
    /// Build from the `[search]` section. Fails if no endpoint is set.
    pub fn new(config: &SearchConfig, countries: Vec<CountryProfile>) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| CurriculaError::config("search.endpoint is not set"))?;
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            endpoint,
            api_key: std::env::var(&config.api_key_env).ok(),
            max_results: config.max_results,
            countries,
            allow_localhost: false,
        })
    }

    /// Allow loopback result URLs (for testing against a local server).
    #[cfg(test)]
    pub fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }

    fn authority(&self, country_code: &str, url: &Url) -> AuthorityHint {
        let official = self
            .countries
            .iter()
            .find(|c| c.code.eq_ignore_ascii_case(country_code))
            .zip(url.host_str())
            .is_some_and(|(profile, host)| profile.is_official_host(host));
        if official {
            AuthorityHint::Official
        } else {
            AuthorityHint::Unknown
        }
    }

    async fn query(&self, country_code: &str, query: &str) -> Result<Vec<SearchResult>> {
        let count = self.max_results.to_string();
        let mut request = self.client.get(&self.endpoint).query(&[
            ("q", query),
            ("country", country_code),
            ("count", count.as_str()),
        ]);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CurriculaError::Network(format!("{}: {e}", self.endpoint)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CurriculaError::Network(format!(
                "{}: HTTP {status}",
                self.endpoint
            )));
        }
        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| CurriculaError::parse(format!("search response: {e}")))?;
        Ok(body.results)
    }
}

#[async_trait]
impl SearchCapability for HttpSearch {
    fn name(&self) -> &str {
        "http-search"
    }

    #[instrument(skip_all, fields(country = %country_code, queries = queries.len()))]
    async fn search(&self, country_code: &str, queries: &[String]) -> Result<Vec<SearchHit>> {
        let mut hits: Vec<SearchHit> = Vec::new();
        let mut last_error = None;

        for query in queries.iter().take(MAX_SEARCH_QUERIES) {
            let results = match self.query(country_code, query).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(query = %query, error = %e, "search query failed");
                    last_error = Some(e);
                    continue;
                }
            };

            for result in results {
                let Ok(url) = Url::parse(&result.url) else {
                    debug!(url = %result.url, "skipping unparseable result");
                    continue;
                };
                if !self.allow_localhost && is_ssrf_target(&url) {
                    debug!(url = %url, "skipping private result");
                    continue;
                }
                if hits.iter().any(|h| h.url == url.as_str()) {
                    continue;
                }
                hits.push(SearchHit {
                    authority_hint: self.authority(country_code, &url),
                    url: url.to_string(),
                    title: result.title,
                });
            }
            if hits.len() >= self.max_results {
                break;
            }
        }

        // Every query failing is an error; an empty but healthy search is not.
        if hits.is_empty() {
            if let Some(e) = last_error {
                return Err(e);
            }
        }

        // Official hosts first, provider order otherwise.
        hits.sort_by_key(|h| h.authority_hint != AuthorityHint::Official);
        hits.truncate(self.max_results);
        info!(hits = hits.len(), "search complete");
        Ok(hits)
    }
}
