//! HTTP request tool.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;

use crate::tools::tool::{Tool, ToolCategory, ToolContext, ToolError, ToolOutput, require_str};

/// Response bodies longer than this are cut.
const MAX_BODY_CHARS: usize = 20_000;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound HTTPS requests to public hosts.
pub struct HttpRequestTool {
    client: Client,
}

impl HttpRequestTool {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }
}

impl Default for HttpRequestTool {
    fn default() -> Self {
        Self::new()
    }
}

/// Only https to public, non-local hosts.
pub(crate) fn validate_url(url: &str) -> Result<reqwest::Url, ToolError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| ToolError::InvalidParameters(format!("invalid URL: {}", e)))?;

    if parsed.scheme() != "https" {
        return Err(ToolError::NotAuthorized(
            "only https URLs are allowed".to_string(),
        ));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| ToolError::InvalidParameters("URL missing host".to_string()))?;

    let host_lower = host.to_lowercase();
    if host_lower == "localhost" || host_lower.ends_with(".localhost") {
        return Err(ToolError::NotAuthorized(
            "localhost is not allowed".to_string(),
        ));
    }

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>()
        && is_disallowed_ip(&ip)
    {
        return Err(ToolError::NotAuthorized(
            "private or local IPs are not allowed".to_string(),
        ));
    }

    Ok(parsed)
}

fn is_disallowed_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

#[async_trait]
impl Tool for HttpRequestTool {
    fn name(&self) -> &str {
        "http_request"
    }

    fn description(&self) -> &str {
        "Make an HTTPS request to a public API. Supports GET, POST, PUT, DELETE and PATCH."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "method": {
                    "type": "string",
                    "enum": ["GET", "POST", "PUT", "DELETE", "PATCH"],
                    "description": "HTTP method (default GET)"
                },
                "url": {"type": "string", "description": "The https URL to request"},
                "headers": {
                    "type": "object",
                    "additionalProperties": {"type": "string"}
                },
                "body": {"description": "JSON body for POST/PUT/PATCH"}
            },
            "required": ["url"]
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Web
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let method = params
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_uppercase();
        let url = validate_url(require_str(&params, "url")?)?;

        let mut request = match method.as_str() {
            "GET" => self.client.get(url.clone()),
            "POST" => self.client.post(url.clone()),
            "PUT" => self.client.put(url.clone()),
            "DELETE" => self.client.delete(url.clone()),
            "PATCH" => self.client.patch(url.clone()),
            other => {
                return Err(ToolError::InvalidParameters(format!(
                    "unsupported method: {}",
                    other
                )));
            }
        };

        let headers: HashMap<String, String> = params
            .get("headers")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        for (key, value) in &headers {
            request = request.header(key, value);
        }
        if let Some(body) = params.get("body") {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ToolError::Timeout(REQUEST_TIMEOUT)
            } else {
                ToolError::ExternalService(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if status == 429 {
            return Err(ToolError::RateLimited(None));
        }
        let body_text = response.text().await.map_err(|e| {
            ToolError::ExternalService(format!("failed to read response body: {}", e))
        })?;

        let body = serde_json::from_str::<serde_json::Value>(&body_text).unwrap_or_else(|_| {
            serde_json::Value::String(crate::agent::truncate_chars(&body_text, MAX_BODY_CHARS))
        });

        Ok(ToolOutput::success(
            serde_json::json!({
                "url": url.as_str(),
                "status": status,
                "body": body,
            }),
            start.elapsed(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url_rejects_http() {
        let err = validate_url("http://example.com").unwrap_err();
        assert!(err.to_string().contains("https"));
    }

    #[test]
    fn test_validate_url_rejects_local_hosts() {
        assert!(validate_url("https://localhost/x").is_err());
        assert!(validate_url("https://api.localhost/x").is_err());
        assert!(validate_url("https://10.0.0.4/").is_err());
        assert!(validate_url("https://169.254.169.254/latest").is_err());
        assert!(validate_url("https://[::1]/").is_err());
    }

    #[test]
    fn test_validate_url_accepts_public_https() {
        let url = validate_url("https://example.com/api?q=1").unwrap();
        assert_eq!(url.host_str(), Some("example.com"));
    }
}
