//! Page-wise enumeration of collection endpoints.
//!
//! GitHub list endpoints come in two shapes: a bare JSON array (`/pulls`)
//! and an envelope object with the items under a named key (`/check-runs`
//! under `check_runs`). The paginator handles both and stops on the first
//! empty or short page, a page-count cap, or a `304 Not Modified`.

use serde_json::Value;

use crate::client::{ApiResponse, GithubClient, RateHeaders};
use crate::error::GithubError;

/// Driver for one paginated enumeration. Not reusable across listings.
pub struct Paginator<'a> {
    client: &'a GithubClient,
    path: String,
    query: Vec<(String, String)>,
    per_page: usize,
    max_pages: u32,
    /// Key holding the item array for envelope responses; `None` for bare
    /// array responses.
    items_key: Option<&'static str>,
    /// ETag sent as `If-None-Match` on the first page only.
    conditional_etag: Option<String>,

    page: u32,
    done: bool,
    not_modified: bool,
    api_calls: u32,
    last_etag: Option<String>,
    last_rate: Option<RateHeaders>,
}

impl<'a> Paginator<'a> {
    pub fn new(client: &'a GithubClient, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
            query: Vec::new(),
            per_page: 100,
            max_pages: 10,
            items_key: None,
            conditional_etag: None,
            page: 0,
            done: false,
            not_modified: false,
            api_calls: 0,
            last_etag: None,
            last_rate: None,
        }
    }

    pub fn query(mut self, params: Vec<(String, String)>) -> Self {
        self.query = params;
        self
    }

    pub fn per_page(mut self, per_page: usize) -> Self {
        self.per_page = per_page.min(100);
        self
    }

    pub fn max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn items_key(mut self, key: &'static str) -> Self {
        self.items_key = Some(key);
        self
    }

    pub fn conditional(mut self, etag: Option<String>) -> Self {
        self.conditional_etag = etag;
        self
    }

    /// Fetch the next page of items. `Ok(None)` means the enumeration is
    /// finished; check [`Paginator::was_not_modified`] to distinguish an
    /// empty listing from a 304 short-circuit.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Value>>, GithubError> {
        if self.done || self.page >= self.max_pages {
            self.done = true;
            return Ok(None);
        }
        self.page += 1;

        let mut query = self.query.clone();
        query.push(("per_page".into(), self.per_page.to_string()));
        query.push(("page".into(), self.page.to_string()));

        // Conditional fetch applies to the first page only: a 304 there
        // covers the whole listing.
        let etag = if self.page == 1 {
            self.conditional_etag.as_deref()
        } else {
            None
        };

        let resp = self.client.get(&self.path, &query, etag).await?;
        self.api_calls += 1;
        self.record_headers(&resp);

        if resp.not_modified() {
            self.not_modified = true;
            self.done = true;
            return Ok(None);
        }

        let items = self.extract_items(resp.body.unwrap_or(Value::Null))?;
        if items.is_empty() {
            self.done = true;
            return Ok(None);
        }
        if items.len() < self.per_page {
            // Short page: this is the last one.
            self.done = true;
        }
        Ok(Some(items))
    }

    fn record_headers(&mut self, resp: &ApiResponse) {
        if let Some(tag) = &resp.etag {
            self.last_etag = Some(tag.clone());
        }
        if let Some(rate) = resp.rate {
            self.last_rate = Some(rate);
        }
    }

    fn extract_items(&self, body: Value) -> Result<Vec<Value>, GithubError> {
        let items = match self.items_key {
            None => body,
            Some(key) => body
                .get(key)
                .cloned()
                .ok_or_else(|| GithubError::Decode(format!("missing items key '{key}'")))?,
        };
        match items {
            Value::Array(arr) => Ok(arr),
            other => Err(GithubError::Decode(format!(
                "expected item array, got {}",
                type_name(&other)
            ))),
        }
    }

    pub fn was_not_modified(&self) -> bool {
        self.not_modified
    }

    pub fn api_calls(&self) -> u32 {
        self.api_calls
    }

    /// ETag captured from the most recent response, used to cache the
    /// freshly fetched listing.
    pub fn last_etag(&self) -> Option<&str> {
        self.last_etag.as_deref()
    }

    pub fn last_rate(&self) -> Option<RateHeaders> {
        self.last_rate
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::GithubClient;
    use httpmock::prelude::*;

    fn client_for(server: &MockServer) -> GithubClient {
        GithubClient::with_base_url("t".into(), server.base_url())
    }

    fn numbered(range: std::ops::Range<i64>) -> serde_json::Value {
        Value::Array(
            range
                .map(|n| serde_json::json!({"number": n}))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn enumerates_until_short_page() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/items").query_param("page", "1");
            then.status(200).json_body(numbered(0..3));
        });
        server.mock(|when, then| {
            when.method(GET).path("/items").query_param("page", "2");
            then.status(200).json_body(numbered(3..5));
        });

        let client = client_for(&server);
        let mut pages = Paginator::new(&client, "/items").per_page(3);

        assert_eq!(pages.next_page().await.unwrap().unwrap().len(), 3);
        // Short second page terminates the enumeration.
        assert_eq!(pages.next_page().await.unwrap().unwrap().len(), 2);
        assert!(pages.next_page().await.unwrap().is_none());
        assert_eq!(pages.api_calls(), 2);
    }

    #[tokio::test]
    async fn stops_on_empty_page() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/items").query_param("page", "1");
            then.status(200).json_body(numbered(0..3));
        });
        server.mock(|when, then| {
            when.method(GET).path("/items").query_param("page", "2");
            then.status(200).json_body(serde_json::json!([]));
        });

        let client = client_for(&server);
        let mut pages = Paginator::new(&client, "/items").per_page(3);

        assert!(pages.next_page().await.unwrap().is_some());
        assert!(pages.next_page().await.unwrap().is_none());
        assert!(!pages.was_not_modified());
    }

    #[tokio::test]
    async fn respects_max_pages() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/items");
            then.status(200).json_body(numbered(0..2));
        });

        let client = client_for(&server);
        let mut pages = Paginator::new(&client, "/items").per_page(2).max_pages(2);

        assert!(pages.next_page().await.unwrap().is_some());
        assert!(pages.next_page().await.unwrap().is_some());
        assert!(pages.next_page().await.unwrap().is_none());
        assert_eq!(pages.api_calls(), 2);
    }

    #[tokio::test]
    async fn not_modified_short_circuits_listing() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/items")
                .header("if-none-match", "\"known\"");
            then.status(304).header("etag", "\"known\"");
        });

        let client = client_for(&server);
        let mut pages = Paginator::new(&client, "/items")
            .conditional(Some("\"known\"".into()));

        assert!(pages.next_page().await.unwrap().is_none());
        assert!(pages.was_not_modified());
        assert_eq!(pages.api_calls(), 1);
        mock.assert();
    }

    #[tokio::test]
    async fn envelope_items_key_extraction() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/commits/abc/check-runs").query_param("page", "1");
            then.status(200).json_body(serde_json::json!({
                "total_count": 2,
                "check_runs": [{"id": 1}, {"id": 2}]
            }));
        });

        let client = client_for(&server);
        let mut pages = Paginator::new(&client, "/commits/abc/check-runs")
            .per_page(100)
            .items_key("check_runs");

        let items = pages.next_page().await.unwrap().unwrap();
        assert_eq!(items.len(), 2);
        assert!(pages.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn captures_last_etag_across_pages() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/items").query_param("page", "1");
            then.status(200)
                .header("etag", "\"p1\"")
                .json_body(numbered(0..1));
        });

        let client = client_for(&server);
        let mut pages = Paginator::new(&client, "/items").per_page(100);
        pages.next_page().await.unwrap();
        assert_eq!(pages.last_etag(), Some("\"p1\""));
    }
}
