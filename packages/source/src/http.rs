//! A generic JSON-over-HTTP [`MatchSource`].
//!
//! The listing endpoint is fetched for a day and ids are pulled out of the
//! response with a small path expression; documents are fetched one id at a
//! time through a session that owns its own `reqwest::Client` (and therefore
//! its own connection pool).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use scout_bronze_models::MatchDate;
use scout_ingest_models::HttpSourceConfig;
use serde_json::Value;

use crate::{FetchError, FetchSession, MatchSource, retry};

/// [`MatchSource`] driven entirely by an [`HttpSourceConfig`].
#[derive(Debug, Clone)]
pub struct HttpMatchSource {
    name: String,
    config: Arc<HttpSourceConfig>,
    client: reqwest::Client,
}

impl HttpMatchSource {
    /// Builds the listing client up front so bad headers fail fast.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Permanent`] if a header is invalid or the
    /// client cannot be built.
    pub fn new(name: &str, config: HttpSourceConfig) -> Result<Self, FetchError> {
        let client = build_client(&config)?;
        Ok(Self {
            name: name.to_string(),
            config: Arc::new(config),
            client,
        })
    }
}

fn build_client(config: &HttpSourceConfig) -> Result<reqwest::Client, FetchError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| FetchError::permanent(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| FetchError::permanent(format!("invalid value for header {name}: {e}")))?;
        headers.insert(name, value);
    }

    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .default_headers(headers)
        .build()
        .map_err(|e| FetchError::permanent(format!("failed to build HTTP client: {e}")))
}

/// Fills `{date}`, `{date_dashed}` and `{id}` in a URL template.
#[must_use]
pub fn render_url(template: &str, date: Option<&MatchDate>, id: Option<&str>) -> String {
    let mut url = template.to_string();
    if let Some(date) = date {
        url = url
            .replace("{date}", &date.compact())
            .replace("{date_dashed}", &date.naive().format("%Y-%m-%d").to_string());
    }
    if let Some(id) = id {
        url = url.replace("{id}", id);
    }
    url
}

/// Extracts ids from `value` along `path`.
///
/// `path` is dot-separated; a segment ending in `[]` iterates an array.
/// Missing keys contribute nothing. String and integer ids are accepted;
/// duplicates are dropped, first occurrence wins.
///
/// # Errors
///
/// Returns [`FetchError::Permanent`] when a `[]` segment is not an array or
/// an id is neither a string nor a number.
pub fn extract_ids(value: &Value, path: &str) -> Result<Vec<String>, FetchError> {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let mut ids = Vec::new();
    walk(value, &segments, path, &mut ids)?;

    let mut seen = std::collections::BTreeSet::new();
    ids.retain(|id| seen.insert(id.clone()));
    Ok(ids)
}

fn walk(value: &Value, segments: &[&str], path: &str, out: &mut Vec<String>) -> Result<(), FetchError> {
    let Some((segment, rest)) = segments.split_first() else {
        match value {
            Value::String(s) => out.push(s.clone()),
            Value::Number(n) => out.push(n.to_string()),
            Value::Null => {}
            other => {
                return Err(FetchError::permanent(format!(
                    "id at {path} is not a string or number: {other}"
                )));
            }
        }
        return Ok(());
    };

    let (key, iterate) = segment
        .strip_suffix("[]")
        .map_or((*segment, false), |key| (key, true));
    let next = if key.is_empty() {
        Some(value)
    } else {
        value.get(key)
    };
    let Some(next) = next else {
        return Ok(());
    };

    if iterate {
        let items = next.as_array().ok_or_else(|| {
            FetchError::permanent(format!("expected an array at {segment} in {path}"))
        })?;
        for item in items {
            walk(item, rest, path, out)?;
        }
        Ok(())
    } else {
        walk(next, rest, path, out)
    }
}

#[async_trait]
impl MatchSource for HttpMatchSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_ids_for_date(&self, date: &MatchDate) -> Result<Vec<String>, FetchError> {
        let url = render_url(&self.config.listing_url, Some(date), None);
        log::debug!("Fetching match listing for {date} from {url}");

        let body = retry::send_json(self.client.get(&url), None).await?;
        let ids = extract_ids(&body, &self.config.id_path)?;

        log::info!("{}: {} matches listed for {date}", self.name, ids.len());
        Ok(ids)
    }

    fn session(&self) -> Result<Box<dyn FetchSession>, FetchError> {
        Ok(Box::new(HttpSession {
            client: build_client(&self.config)?,
            config: Arc::clone(&self.config),
        }))
    }
}

/// A worker's own client, reused for every id it fetches.
struct HttpSession {
    client: reqwest::Client,
    config: Arc<HttpSourceConfig>,
}

#[async_trait]
impl FetchSession for HttpSession {
    async fn fetch_document(&mut self, id: &str) -> Result<Value, FetchError> {
        let url = render_url(&self.config.document_url, None, Some(id));
        retry::send_json(self.client.get(&url), Some(id)).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn extracts_nested_ids_in_order_without_duplicates() {
        let body = json!({
            "leagues": [
                {"matches": [{"id": 3}, {"id": "1"}]},
                {"matches": [{"id": 2}, {"id": 3}]},
                {"name": "no matches key"}
            ]
        });
        let ids = extract_ids(&body, "leagues[].matches[].id").unwrap();
        assert_eq!(ids, ["3", "1", "2"]);
    }

    #[test]
    fn missing_root_key_is_empty() {
        let ids = extract_ids(&json!({"other": []}), "leagues[].matches[].id").unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn top_level_array_path() {
        let ids = extract_ids(&json!([{"id": "a"}, {"id": "b"}]), "[].id").unwrap();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn wrong_shape_is_permanent() {
        let err = extract_ids(&json!({"leagues": {"x": 1}}), "leagues[].id").unwrap_err();
        assert!(matches!(err, FetchError::Permanent { .. }));

        let err = extract_ids(&json!({"id": {"nested": 1}}), "id").unwrap_err();
        assert!(matches!(err, FetchError::Permanent { .. }));
    }

    #[test]
    fn renders_url_placeholders() {
        let date = MatchDate::parse("20250101").unwrap();
        assert_eq!(
            render_url("https://x/api/matches?date={date}", Some(&date), None),
            "https://x/api/matches?date=20250101"
        );
        assert_eq!(
            render_url("https://x/{date_dashed}/m/{id}", Some(&date), Some("42")),
            "https://x/2025-01-01/m/42"
        );
    }

    #[test]
    fn invalid_header_is_rejected() {
        let config = HttpSourceConfig {
            listing_url: "http://localhost/{date}".to_string(),
            document_url: "http://localhost/{id}".to_string(),
            id_path: "[].id".to_string(),
            headers: [("bad header".to_string(), "v".to_string())].into(),
            timeout_secs: 1,
        };
        assert!(matches!(
            HttpMatchSource::new("test", config),
            Err(FetchError::Permanent { .. })
        ));
    }
}
