//! HTTP GET 工具：域名白名单、超时、结果大小限制
//!
//! 仅允许配置中的域名；GET 请求带超时与 User-Agent；响应超过 max_result_chars 时截断并追加 ...[truncated]。

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::{Map, Value};

use crate::tools::{Tool, ToolContext};

const USER_AGENT: &str = concat!("hive/", env!("CARGO_PKG_VERSION"));

/// http_get 工具：抓取白名单域名的 URL 内容
pub struct HttpGetTool {
    client: Client,
    allowed_domains: HashSet<String>,
    timeout: Duration,
    max_result_chars: usize,
}

/// 解析 URL：只接受 http(s)，拒绝带用户信息的 URL；返回 URL 与小写 host
fn parse_target(raw: &str) -> Result<(Url, String), String> {
    let url = Url::parse(raw.trim()).map_err(|e| format!("Invalid URL: {e}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("Unsupported scheme: {}", url.scheme()));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err("URL must not contain credentials".to_string());
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| "URL has no host".to_string())?
        .to_lowercase();
    Ok((url, host))
}

fn truncate_chars(body: String, max: usize) -> (String, bool) {
    if body.chars().count() > max {
        (body.chars().take(max).collect::<String>() + "\n...[truncated]", true)
    } else {
        (body, false)
    }
}

impl HttpGetTool {
    pub fn new(allowed_domains: Vec<String>, timeout_secs: u64, max_result_chars: usize) -> Self {
        let allowed_domains = allowed_domains
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        let timeout = Duration::from_secs(timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            allowed_domains,
            timeout,
            max_result_chars,
        }
    }

    /// 白名单匹配：完全相同或为其子域名
    fn check_allowed(&self, raw: &str) -> Result<Url, String> {
        let (url, domain) = parse_target(raw)?;
        let allowed = self
            .allowed_domains
            .iter()
            .any(|d| domain == *d || domain.ends_with(&format!(".{d}")));
        if allowed {
            Ok(url)
        } else {
            Err(format!("Domain not in allowlist: {domain}"))
        }
    }

    /// 单次请求超时不超过本次调用的剩余时间
    async fn fetch(&self, raw: &str, remaining: Duration) -> Result<Value, String> {
        let url = self.check_allowed(raw)?;
        let resp = self
            .client
            .get(url.clone())
            .timeout(self.timeout.min(remaining))
            .send()
            .await
            .map_err(|e| format!("Request failed: {e}"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("HTTP {status}"));
        }
        let body = resp.text().await.map_err(|e| format!("Read body: {e}"))?;
        let body = body.strip_prefix('\u{FEFF}').map(str::to_string).unwrap_or(body);
        let (body, truncated) = truncate_chars(body, self.max_result_chars);
        Ok(serde_json::json!({
            "url": url.as_str(),
            "status": status.as_u16(),
            "body": body,
            "truncated": truncated,
        }))
    }
}

#[async_trait]
impl Tool for HttpGetTool {
    fn name(&self) -> &str {
        "http_get"
    }

    fn description(&self) -> &str {
        "Fetch a URL with HTTP GET (domain allowlist applies). Args: {\"url\": \"https://...\"}."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "minLength": 1, "description": "http(s) URL to fetch"}
            },
            "required": ["url"],
            "additionalProperties": false
        })
    }

    async fn invoke(&self, ctx: ToolContext, args: Map<String, Value>) -> Result<Value, String> {
        let url = args.get("url").and_then(|v| v.as_str()).unwrap_or("").trim();
        tracing::info!(url = %url, execution_id = %ctx.execution_id, "http_get fetch");
        tokio::select! {
            _ = ctx.cancelled() => Err("Request interrupted".to_string()),
            res = self.fetch(url, ctx.remaining()) => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        assert_eq!(parse_target("https://docs.rs/tokio").unwrap().1, "docs.rs");
        assert_eq!(parse_target("http://Example.COM:8080?q=1").unwrap().1, "example.com");
        assert!(parse_target("ftp://x.org").is_err());
        assert!(parse_target("not a url").is_err());
    }

    #[test]
    fn test_userinfo_cannot_spoof_allowed_host() {
        let tool = HttpGetTool::new(vec!["github.com".into()], 5, 100);
        let err = tool
            .check_allowed("https://github.com:x@evil.example/steal")
            .unwrap_err();
        assert!(err.contains("credentials"), "{err}");
        assert!(tool.check_allowed("https://user@github.com/").is_err());
        assert!(tool.check_allowed("https://evil.example/?github.com").is_err());
        assert!(tool.check_allowed("https://evil.example#@github.com").is_err());
        assert_eq!(
            tool.check_allowed("https://github.com/rust-lang").unwrap().host_str(),
            Some("github.com")
        );
    }

    #[test]
    fn test_allowlist_with_subdomains() {
        let tool = HttpGetTool::new(vec!["wikipedia.org".into()], 5, 100);
        assert!(tool.check_allowed("https://en.wikipedia.org/wiki/Rust").is_ok());
        assert!(tool.check_allowed("https://wikipedia.org").is_ok());
        assert!(tool.check_allowed("https://notwikipedia.org").is_err());
    }

    #[test]
    fn test_truncate() {
        let (body, truncated) = truncate_chars("天地玄黄宇宙洪荒".to_string(), 4);
        assert!(truncated);
        assert!(body.starts_with("天地玄黄"));
        assert!(body.ends_with("...[truncated]"));
    }
}
