use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, ACCEPT, LINK, USER_AGENT};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

use patchflow_core::config::GithubConfig;
use patchflow_core::error::{PatchflowError, Result};
use patchflow_core::traits::IssueSource;
use patchflow_core::types::{IssueQuery, RawIssue};

/// Reads issues from the GitHub REST API.
pub struct GithubIssueSource {
    http: Client,
    api_url: String,
    token: Option<String>,
    per_page: u32,
}

#[derive(Deserialize)]
struct GhIssue {
    id: u64,
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    state: String,
    #[serde(default)]
    labels: Vec<GhLabel>,
    created_at: String,
    updated_at: String,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct GhLabel {
    name: String,
}

impl GithubIssueSource {
    pub fn new(config: &GithubConfig) -> Self {
        Self {
            http: Client::new(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token.clone().filter(|t| !t.is_empty()),
            per_page: config.per_page,
        }
    }

    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<reqwest::Response> {
        let mut req = self
            .http
            .get(url)
            .header(ACCEPT, "application/vnd.github.v3+json")
            .header(USER_AGENT, "patchflow")
            .query(query);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| PatchflowError::SourceHost(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(PatchflowError::SourceHost(format!("HTTP {}: {}", status, body)));
        }
        Ok(resp)
    }

    async fn fetch_one(&self, repo: &str, number: u64) -> Result<Vec<RawIssue>> {
        let url = format!("{}/repos/{}/issues/{}", self.api_url, repo, number);
        let resp = self.get(&url, &[]).await?;
        let item: GhIssue = resp
            .json()
            .await
            .map_err(|e| PatchflowError::SourceHost(e.to_string()))?;
        Ok(convert(item).into_iter().collect())
    }

    async fn fetch_all(&self, query: &IssueQuery) -> Result<Vec<RawIssue>> {
        let mut params = vec![
            ("state", query.state.clone()),
            ("per_page", self.per_page.to_string()),
        ];
        if !query.labels.is_empty() {
            params.push(("labels", query.labels.join(",")));
        }

        let mut issues = Vec::new();
        let mut next = Some(format!("{}/repos/{}/issues", self.api_url, query.repo));
        let mut page = 0u32;

        while let Some(url) = next.take() {
            page += 1;
            let resp = self.get(&url, &params).await?;
            next = next_link(resp.headers());
            let items: Vec<GhIssue> = resp
                .json()
                .await
                .map_err(|e| PatchflowError::SourceHost(e.to_string()))?;
            debug!(page, count = items.len(), "Fetched issue page");
            issues.extend(items.into_iter().filter_map(convert));
            // The next link already carries the query string
            params.clear();
        }

        Ok(issues)
    }
}

/// Pull requests come back from the issues endpoint too; drop them.
fn convert(item: GhIssue) -> Option<RawIssue> {
    if item.pull_request.is_some() {
        return None;
    }
    Some(RawIssue {
        id: item.id,
        number: item.number,
        title: item.title,
        body: item.body.unwrap_or_default(),
        state: item.state,
        labels: item.labels.into_iter().map(|l| l.name).collect(),
        created_at: item.created_at,
        updated_at: item.updated_at,
    })
}

fn next_link(headers: &HeaderMap) -> Option<String> {
    headers
        .get(LINK)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_next_link)
}

/// Extract the `rel="next"` target from a `Link` header value.
pub(crate) fn parse_next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let mut pieces = part.split(';');
        let url = pieces.next()?.trim();
        let is_next = pieces.any(|p| p.trim() == r#"rel="next""#);
        if is_next {
            Some(url.trim_start_matches('<').trim_end_matches('>').to_string())
        } else {
            None
        }
    })
}

impl IssueSource for GithubIssueSource {
    fn fetch_items(&self, query: &IssueQuery) -> BoxFuture<'_, Result<Vec<RawIssue>>> {
        let query = query.clone();
        Box::pin(async move {
            let issues = match query.number {
                Some(number) => self.fetch_one(&query.repo, number).await?,
                None => self.fetch_all(&query).await?,
            };
            info!(repo = %query.repo, count = issues.len(), "Fetched issues");
            Ok(issues)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_next_link() {
        let header = r#"<https://api.github.com/repositories/1/issues?page=2>; rel="next", <https://api.github.com/repositories/1/issues?page=5>; rel="last""#;
        assert_eq!(
            parse_next_link(header).as_deref(),
            Some("https://api.github.com/repositories/1/issues?page=2")
        );
    }

    #[test]
    fn test_parse_next_link_last_page() {
        let header = r#"<https://api.github.com/x?page=1>; rel="prev", <https://api.github.com/x?page=1>; rel="first""#;
        assert!(parse_next_link(header).is_none());
        assert!(parse_next_link("").is_none());
    }

    #[test]
    fn test_convert_skips_pull_requests() {
        let items: Vec<GhIssue> = serde_json::from_str(
            r#"[
                {"id": 10, "number": 1, "title": "Crash on start", "body": null, "state": "open",
                 "labels": [{"name": "bug"}], "created_at": "2024-01-01T00:00:00Z",
                 "updated_at": "2024-01-02T00:00:00Z"},
                {"id": 11, "number": 2, "title": "Add feature", "body": "b", "state": "open",
                 "labels": [], "created_at": "2024-01-01T00:00:00Z",
                 "updated_at": "2024-01-02T00:00:00Z", "pull_request": {"url": "x"}}
            ]"#,
        )
        .unwrap();
        let issues: Vec<RawIssue> = items.into_iter().filter_map(convert).collect();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].number, 1);
        assert_eq!(issues[0].body, "");
        assert_eq!(issues[0].labels, vec!["bug"]);
    }
}
