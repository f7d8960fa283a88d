//! HTTP client for a SearXNG-style federated search endpoint.
//!
//! `GET {base}/search?q=..&format=json[&engines=a,b][&categories=music]`
//! answers with `{ "results": [ { "title", "url", ... } ] }`. Reachability is
//! checked with `GET {base}/healthz`.

use async_trait::async_trait;
use log::{debug, trace, warn};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::error::{CoreError, Result};
use crate::model::RemoteResultFields;
use crate::sources::{ReachabilityProbe, RemoteSearch};

const USER_AGENT: &str = concat!("tunesift/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<RawResult>,
}

#[derive(Debug, Deserialize)]
struct RawResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    content: Option<String>,
    engine: Option<String>,
    artist: Option<String>,
    author: Option<String>,
    album: Option<String>,
    /// Seconds as a number, or `m:ss` / `h:mm:ss` text
    duration: Option<Value>,
    score: Option<f64>,
}

/// Parse `"3:45"`, `"1:02:03"`, `"245"` or a JSON number into seconds
fn parse_duration(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|s| s.is_finite() && *s >= 0.0),
        Value::String(s) => {
            let mut total = 0.0;
            for part in s.trim().split(':') {
                let n: f64 = part.trim().parse().ok()?;
                total = total * 60.0 + n;
            }
            (total.is_finite() && total >= 0.0).then_some(total)
        }
        _ => None,
    }
}

impl RawResult {
    /// `None` for results without a URL, which cannot be identified
    fn into_fields(self) -> Option<RemoteResultFields> {
        if self.url.trim().is_empty() {
            return None;
        }

        let explicit_artist = self
            .artist
            .or(self.author)
            .filter(|a| !a.trim().is_empty());
        // Many engines only give "Artist - Title"
        let (artist, title) = match explicit_artist {
            Some(artist) => (artist, self.title),
            None => match self.title.split_once(" - ") {
                Some((artist, title)) => (artist.trim().to_string(), title.trim().to_string()),
                None => (String::new(), self.title),
            },
        };

        Some(RemoteResultFields {
            id: self.url.clone(),
            title,
            artist,
            album: self.album,
            duration_sec: self.duration.as_ref().and_then(parse_duration),
            url: self.url,
            engine: self.engine,
            content: self.content,
            score: self.score,
        })
    }
}

/// Federated search over HTTP
#[derive(Debug, Clone)]
pub struct SearxClient {
    http: reqwest::Client,
    base_url: String,
}

impl SearxClient {
    /// `timeout` bounds every request made by this client
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl RemoteSearch for SearxClient {
    async fn search(
        &self,
        query: &str,
        engines: Option<&[String]>,
        categories: Option<&[String]>,
    ) -> Result<Vec<RemoteResultFields>> {
        let mut params = vec![("q", query.to_string()), ("format", "json".to_string())];
        if let Some(engines) = engines.filter(|e| !e.is_empty()) {
            params.push(("engines", engines.join(",")));
        }
        if let Some(categories) = categories.filter(|c| !c.is_empty()) {
            params.push(("categories", categories.join(",")));
        }

        let url = format!("{}/search", self.base_url);
        debug!("Remote search `{query}` at {url}");

        let response = self.http.get(&url).query(&params).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!("Remote search returned HTTP {status}");
            return Err(CoreError::RemoteUnavailable(format!(
                "search endpoint returned HTTP {status}"
            )));
        }

        let body: SearchResponse = response.json().await?;
        let results: Vec<RemoteResultFields> = body
            .results
            .into_iter()
            .filter_map(RawResult::into_fields)
            .collect();
        trace!("Remote search `{query}` returned {} results", results.len());
        Ok(results)
    }
}

/// Reachability check against the endpoint's health route
#[derive(Debug, Clone)]
pub struct HttpProbe {
    http: reqwest::Client,
    health_url: String,
}

impl HttpProbe {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            health_url: format!("{}/healthz", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn probe(&self) -> bool {
        match self.http.get(&self.health_url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Health probe failed: {e}");
                false
            }
        }
    }
}
