//! read_webpage：抓取网页正文，域名白名单、超时、结果大小限制
//!
//! GET 请求带超时与 User-Agent；HTML 响应经 html2text 提取可读文本；
//! 超过 max_result_chars 时截断并追加 ...[truncated]。

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use html2text::from_read;
use reqwest::Client;
use serde_json::Value;

use crate::tools::schema::{ParamSpec, ParamTable, ParamType};
use crate::tools::Tool;

const USER_AGENT: &str = concat!("tool-agent/", env!("CARGO_PKG_VERSION"));

/// html2text 失败时的回退：去标签并压缩空白
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    let head: String = s.chars().take(512).collect::<String>().to_lowercase();
    head.starts_with("<!doctype") || head.starts_with("<html") || head.contains("<head") || head.contains("<body")
}

/// 从 URL 中提取 host（小写，去端口）
fn extract_domain(url: &str) -> Option<String> {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.rsplit('@').next()?;
    let host = host.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

/// 抓取网页内容，仅允许白名单域名（含其子域名）
pub struct WebPageReaderTool {
    client: Client,
    allowed_domains: HashSet<String>,
    max_result_chars: usize,
}

impl WebPageReaderTool {
    pub fn new(allowed_domains: Vec<String>, timeout_secs: u64, max_result_chars: usize) -> Self {
        let allowed_domains = allowed_domains
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            allowed_domains,
            max_result_chars,
        }
    }

    fn check_allowed(&self, url: &str) -> Result<(), String> {
        let domain = extract_domain(url).ok_or_else(|| "Invalid or missing URL".to_string())?;
        let allowed = self.allowed_domains.iter().any(|d| {
            domain == *d
                || domain
                    .strip_suffix(d.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        });
        if allowed {
            Ok(())
        } else {
            Err(format!("Domain not in allowlist: {}", domain))
        }
    }

    fn html_to_text(html: &str) -> String {
        match from_read(html.as_bytes(), 120) {
            Ok(text) if !text.trim().is_empty() => text,
            _ => strip_html_tags(html),
        }
    }

    fn truncate(&self, body: String) -> String {
        if body.chars().count() > self.max_result_chars {
            body.chars().take(self.max_result_chars).collect::<String>() + "\n...[truncated]"
        } else {
            body
        }
    }
}

#[async_trait]
impl Tool for WebPageReaderTool {
    fn name(&self) -> &str {
        "read_webpage"
    }

    fn description(&self) -> &str {
        "Fetch and read the content of a web page (allow-listed domains only)."
    }

    fn parameters(&self) -> ParamTable {
        let mut p = ParamTable::new();
        p.insert(
            "url".into(),
            ParamSpec::required(ParamType::String, "URL of the web page to read."),
        );
        p
    }

    fn output_description(&self) -> &str {
        "The text content of the web page."
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let url = args.get("url").and_then(|v| v.as_str()).unwrap_or("").trim();
        self.check_allowed(url)?;
        tracing::info!(url = %url, "read_webpage fetch");

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let body = resp.text().await.map_err(|e| format!("Read body: {}", e))?;
        let body = body.trim_start_matches('\u{FEFF}');
        let text = if looks_like_html(body) {
            Self::html_to_text(body)
        } else {
            body.to_string()
        };
        Ok(self.truncate(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain() {
        assert_eq!(extract_domain("https://Docs.rs/tokio"), Some("docs.rs".to_string()));
        assert_eq!(extract_domain("http://a.b:8080/x?y"), Some("a.b".to_string()));
        assert_eq!(extract_domain("ftp://a.b"), None);
        assert_eq!(extract_domain("https://"), None);
    }

    #[test]
    fn test_allowlist_includes_subdomains_only() {
        let tool = WebPageReaderTool::new(vec!["wikipedia.org".into()], 5, 100);
        assert!(tool.check_allowed("https://en.wikipedia.org/wiki/Rust").is_ok());
        assert!(tool.check_allowed("https://wikipedia.org/").is_ok());
        assert!(tool.check_allowed("https://evilwikipedia.org/").is_err());
        assert!(tool.check_allowed("not a url").is_err());
    }

    #[test]
    fn test_truncate_and_strip() {
        let tool = WebPageReaderTool::new(vec![], 5, 5);
        assert_eq!(tool.truncate("abcdefgh".into()), "abcde\n...[truncated]");
        assert_eq!(strip_html_tags("<p>Hello <b>world</b></p>"), "Hello world");
    }
}
