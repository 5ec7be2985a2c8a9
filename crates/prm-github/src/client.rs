//! Token-authenticated HTTP client for a GitHub-compatible API.

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, IF_NONE_MATCH};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;

use crate::error::GithubError;

const DEFAULT_BASE_URL: &str = "https://api.github.com";
const ACCEPT_JSON: &str = "application/vnd.github+json";

/// Rate-limit headers captured from one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateHeaders {
    pub limit: u32,
    pub remaining: u32,
    /// Reset instant (header carries seconds since epoch).
    pub reset_at: DateTime<Utc>,
}

/// One decoded response: status, optional JSON body, captured headers.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    /// `None` exactly when the response was `304 Not Modified`.
    pub body: Option<Value>,
    pub etag: Option<String>,
    pub rate: Option<RateHeaders>,
}

impl ApiResponse {
    pub fn not_modified(&self) -> bool {
        self.status == StatusCode::NOT_MODIFIED.as_u16()
    }
}

/// Read-only API client. The token is held for the process lifetime and is
/// never logged.
#[derive(Debug, Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl GithubClient {
    pub fn new(token: String) -> Self {
        Self::with_base_url(token, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(token: String, base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            token,
        }
    }

    fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Issue one conditional GET. `etag`, when given, is sent as
    /// `If-None-Match`; a 304 yields an `ApiResponse` with no body.
    pub async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
        etag: Option<&str>,
    ) -> Result<ApiResponse, GithubError> {
        let mut req = self
            .http
            .get(self.build_url(path))
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .header(ACCEPT, ACCEPT_JSON)
            .query(query);

        if let Some(tag) = etag {
            req = req.header(IF_NONE_MATCH, tag.to_string());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| GithubError::Transport(e.to_string()))?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let rate = parse_rate_headers(&headers);
        let response_etag = headers
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if status == StatusCode::NOT_MODIFIED {
            return Ok(ApiResponse {
                status: status.as_u16(),
                body: None,
                etag: response_etag,
                rate,
            });
        }

        if !status.is_success() {
            return Err(classify_failure(status, &rate, resp).await);
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| GithubError::Decode(e.to_string()))?;

        Ok(ApiResponse {
            status: status.as_u16(),
            body: Some(body),
            etag: response_etag,
            rate,
        })
    }

    /// `GET /rate_limit` decoded into per-resource limits.
    pub async fn rate_limit(&self) -> Result<RateLimitOverview, GithubError> {
        let resp = self.get("/rate_limit", &[], None).await?;
        let body = resp
            .body
            .ok_or_else(|| GithubError::Decode("empty rate_limit body".into()))?;
        serde_json::from_value(body).map_err(|e| GithubError::Decode(e.to_string()))
    }

    /// Cheap connectivity probe.
    pub async fn ping(&self) -> Result<(), GithubError> {
        self.rate_limit().await.map(|_| ())
    }
}

/// Decoded `GET /rate_limit` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitOverview {
    pub resources: std::collections::BTreeMap<String, ResourceLimit>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ResourceLimit {
    pub limit: u32,
    pub remaining: u32,
    /// Seconds since epoch.
    pub reset: i64,
    #[serde(default)]
    pub used: u32,
}

impl ResourceLimit {
    pub fn reset_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.reset, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

fn parse_rate_headers(headers: &HeaderMap) -> Option<RateHeaders> {
    let parse_u32 = |name: &str| -> Option<u32> {
        headers.get(name)?.to_str().ok()?.parse().ok()
    };
    let limit = parse_u32("x-ratelimit-limit")?;
    let remaining = parse_u32("x-ratelimit-remaining")?;
    let reset: i64 = headers
        .get("x-ratelimit-reset")?
        .to_str()
        .ok()?
        .parse()
        .ok()?;
    Some(RateHeaders {
        limit,
        remaining,
        reset_at: Utc.timestamp_opt(reset, 0).single()?,
    })
}

async fn classify_failure(
    status: StatusCode,
    rate: &Option<RateHeaders>,
    resp: reqwest::Response,
) -> GithubError {
    if status == StatusCode::NOT_FOUND {
        return GithubError::NotFound;
    }
    // 429, or 403 with an exhausted quota, is a rate rejection, not auth.
    let quota_exhausted = rate.map(|r| r.remaining) == Some(0);
    if status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && quota_exhausted)
    {
        return GithubError::RateLimited {
            reset_at: rate.map(|r| r.reset_at),
            remaining: rate.map(|r| r.remaining),
        };
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return GithubError::Authentication {
            status: status.as_u16(),
        };
    }

    let message: String = resp
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(200)
        .collect();
    GithubError::Api {
        status: status.as_u16(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn client_for(server: &MockServer) -> GithubClient {
        GithubClient::with_base_url("test-token".into(), server.base_url())
    }

    #[tokio::test]
    async fn get_sends_auth_and_accept_headers() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/repos/o/r/pulls")
                .header("authorization", "Bearer test-token")
                .header("accept", "application/vnd.github+json");
            then.status(200).json_body(serde_json::json!([]));
        });

        let resp = client_for(&server)
            .get("/repos/o/r/pulls", &[], None)
            .await
            .unwrap();
        mock.assert();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, Some(serde_json::json!([])));
    }

    #[tokio::test]
    async fn get_captures_etag_and_rate_headers() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/x");
            then.status(200)
                .header("etag", "\"abc\"")
                .header("x-ratelimit-limit", "5000")
                .header("x-ratelimit-remaining", "4321")
                .header("x-ratelimit-reset", "1700000000")
                .json_body(serde_json::json!({}));
        });

        let resp = client_for(&server).get("/x", &[], None).await.unwrap();
        assert_eq!(resp.etag.as_deref(), Some("\"abc\""));
        let rate = resp.rate.unwrap();
        assert_eq!(rate.limit, 5000);
        assert_eq!(rate.remaining, 4321);
        assert_eq!(rate.reset_at.timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn not_modified_has_no_body() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/y").header("if-none-match", "\"tag\"");
            then.status(304);
        });

        let resp = client_for(&server).get("/y", &[], Some("\"tag\"")).await.unwrap();
        assert!(resp.not_modified());
        assert!(resp.body.is_none());
    }

    #[tokio::test]
    async fn status_classification() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/missing");
            then.status(404);
        });
        server.mock(|when, then| {
            when.method(GET).path("/secret");
            then.status(401);
        });
        server.mock(|when, then| {
            when.method(GET).path("/limited");
            then.status(403)
                .header("x-ratelimit-limit", "5000")
                .header("x-ratelimit-remaining", "0")
                .header("x-ratelimit-reset", "1700000060");
        });
        server.mock(|when, then| {
            when.method(GET).path("/broken");
            then.status(502).body("bad gateway");
        });

        let client = client_for(&server);

        assert!(matches!(
            client.get("/missing", &[], None).await,
            Err(GithubError::NotFound)
        ));
        assert!(matches!(
            client.get("/secret", &[], None).await,
            Err(GithubError::Authentication { status: 401 })
        ));
        match client.get("/limited", &[], None).await {
            Err(GithubError::RateLimited { remaining, reset_at }) => {
                assert_eq!(remaining, Some(0));
                assert_eq!(reset_at.unwrap().timestamp(), 1_700_000_060);
            }
            other => panic!("expected rate limited, got {other:?}"),
        }
        assert!(matches!(
            client.get("/broken", &[], None).await,
            Err(GithubError::Api { status: 502, .. })
        ));
    }

    #[tokio::test]
    async fn rate_limit_endpoint_decodes() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/rate_limit");
            then.status(200).json_body(serde_json::json!({
                "resources": {
                    "core": {"limit": 5000, "remaining": 4999, "reset": 1700000000, "used": 1},
                    "search": {"limit": 30, "remaining": 30, "reset": 1700000000, "used": 0},
                    "graphql": {"limit": 5000, "remaining": 5000, "reset": 1700000000, "used": 0}
                },
                "rate": {"limit": 5000, "remaining": 4999, "reset": 1700000000, "used": 1}
            }));
        });

        let overview = client_for(&server).rate_limit().await.unwrap();
        assert_eq!(overview.resources["core"].remaining, 4999);
        assert_eq!(overview.resources["search"].limit, 30);
        assert_eq!(
            overview.resources["core"].reset_at().timestamp(),
            1_700_000_000
        );
    }
}
