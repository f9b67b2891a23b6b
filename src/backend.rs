//! Backend routing rules.
//!
//! A [`BackendRule`] maps a `(domain, basepath)` prefix to an external
//! backend base URL. Rules are kept in insertion order and matched
//! first-match-wins against both the plain and the TLS-intercepted request
//! paths.

use std::str::FromStr;

use http::uri::{Scheme, Uri};
use n0_error::{Result, StackResultExt, StdResultExt};
use serde::{Deserialize, Serialize};

/// Domain value matching every hostname. An empty domain is equivalent.
pub const ALL_DOMAINS: &str = "*";

/// A `(domain, basepath, backend base URL)` routing rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendRule {
    /// Short domain without the TLD; `""` and `"*"` match all domains.
    #[serde(default)]
    pub domain: String,
    /// Absolute URL path prefix mounted in the proxy.
    pub basepath: String,
    /// Absolute URL prefix replacing `basepath` when rewriting.
    #[serde(rename = "backend")]
    pub backend_base_url: String,
}

impl BackendRule {
    pub fn new(
        domain: impl Into<String>,
        basepath: impl Into<String>,
        backend_base_url: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            basepath: basepath.into(),
            backend_base_url: backend_base_url.into(),
        }
    }

    fn normalized_domain(&self) -> &str {
        if self.domain.is_empty() {
            ALL_DOMAINS
        } else {
            &self.domain
        }
    }

    /// The prefix this rule matches against, with the TLD injected by the
    /// caller.
    ///
    /// Rules for all domains match on the path alone; domain-scoped rules
    /// match on `host + path`.
    pub fn prefix(&self, tld: &str) -> String {
        if self.normalized_domain() == ALL_DOMAINS {
            self.basepath.clone()
        } else {
            format!("{}.{}{}", self.domain, tld, self.basepath)
        }
    }

    /// True when the request path, or host and path combined, start with
    /// this rule's prefix.
    pub fn matches(&self, host: &str, path: &str, tld: &str) -> bool {
        let prefix = self.prefix(tld);
        path.starts_with(&prefix) || format!("{host}{path}").starts_with(&prefix)
    }

    /// Rewrites a matched request path against the backend base URL.
    pub fn rewrite(&self, path: &str) -> Result<RewriteTarget> {
        let tail = path.strip_prefix(&self.basepath).unwrap_or(path);
        let url = format!("{}{}", self.backend_base_url, tail);
        let uri = Uri::from_str(&url).std_context("rewritten URL is not valid")?;
        RewriteTarget::from_uri(&uri)
    }
}

/// Structural equality with `""` and `"*"` treated as the same domain.
impl PartialEq for BackendRule {
    fn eq(&self, other: &Self) -> bool {
        self.normalized_domain() == other.normalized_domain()
            && self.basepath == other.basepath
            && self.backend_base_url == other.backend_base_url
    }
}

impl Eq for BackendRule {}

/// The resolved destination of a rewritten request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteTarget {
    /// `http` or `https`.
    pub scheme: String,
    /// Backend hostname without port.
    pub host: String,
    /// Backend port, defaulted from the scheme when absent.
    pub port: u16,
    /// `Host` header value, keeping an explicit port if the backend URL
    /// carried one.
    pub host_header: String,
    /// Origin-form request target.
    pub path_and_query: String,
}

impl RewriteTarget {
    fn from_uri(uri: &Uri) -> Result<Self> {
        let scheme = uri.scheme().cloned().unwrap_or(Scheme::HTTP);
        let authority = uri.authority().context("rewritten URL has no host")?;
        let port = match authority.port_u16() {
            Some(port) => port,
            None if scheme == Scheme::HTTPS => 443,
            None => 80,
        };
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        Ok(Self {
            scheme: scheme.to_string(),
            host: authority.host().to_string(),
            port,
            host_header: authority.as_str().to_string(),
            path_and_query,
        })
    }

    /// Full URL for client-library forwarding.
    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host_header, self.path_and_query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_structural_over_normalized_fields() {
        let cases = [
            ("equals", true, ("a", "b", "c"), ("a", "b", "c")),
            ("domain not equal", false, ("a", "b", "c"), ("x", "b", "c")),
            ("basepath not equal", false, ("a", "b", "c"), ("a", "", "c")),
            ("backend not equal", false, ("a", "b", "c"), ("a", "b", "cc")),
            ("star equals empty", true, ("", "b", "c"), ("*", "b", "c")),
            ("empty equals star", true, ("*", "b", "c"), ("", "b", "c")),
        ];
        for (desc, want, a, b) in cases {
            let a = BackendRule::new(a.0, a.1, a.2);
            let b = BackendRule::new(b.0, b.1, b.2);
            assert_eq!(a == b, want, "{desc}");
        }
    }

    #[test]
    fn prefix_injects_tld_for_scoped_domains() {
        assert_eq!(BackendRule::new("", "/", "x").prefix("wip"), "/");
        assert_eq!(BackendRule::new("*", "/", "x").prefix("wip"), "/");
        assert_eq!(BackendRule::new("domain", "/", "x").prefix("wip"), "domain.wip/");
    }

    #[test]
    fn match_checks_path_and_host_plus_path() {
        let cases = [
            ("all domains, path matches", "example.wip", "/starts/with/whatever", "", true),
            ("domain and path match", "example.wip", "/starts/with/whatever", "example", true),
            ("all domains, path differs", "example.wip", "/some/other/path", "", false),
            ("domain matches, path differs", "example.wip", "/some/other/path", "example", false),
        ];
        for (desc, host, path, domain, want) in cases {
            let rule = BackendRule::new(domain, "/starts/with", "ignored");
            assert_eq!(rule.matches(host, path, "wip"), want, "{desc}");
        }
    }

    #[test]
    fn rewrite_replaces_basepath_with_backend() {
        let rule = BackendRule::new("*", "/star", "http://127.0.0.1:9999");
        let target = rule.rewrite("/star/deep/path?q=1").unwrap();
        assert_eq!(target.scheme, "http");
        assert_eq!(target.host, "127.0.0.1");
        assert_eq!(target.port, 9999);
        assert_eq!(target.path_and_query, "/deep/path?q=1");
        assert_eq!(target.url(), "http://127.0.0.1:9999/deep/path?q=1");
    }

    #[test]
    fn rewrite_defaults_port_from_scheme() {
        let rule = BackendRule::new("*", "/s", "https://backend.example/base");
        let target = rule.rewrite("/s/x").unwrap();
        assert_eq!(target.port, 443);
        assert_eq!(target.host_header, "backend.example");
        assert_eq!(target.path_and_query, "/base/x");
    }

    #[test]
    fn rewrite_failure_on_invalid_result() {
        let rule = BackendRule::new("*", "/s", "http://exa mple/");
        assert!(rule.rewrite("/s/x").is_err());
    }
}
