//! Persistent proxy configuration.
//!
//! The configuration lives in a single JSON file (`proxy.json` inside the
//! proxy home directory) and holds the TLD, the listen address, the
//! domain-to-directory map and the ordered backend rule list. One
//! [`ConfigStore`] is shared by reference between the server, the watcher
//! and the CLI command handlers; all state sits behind a single
//! read-write lock.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::RwLock,
};

use n0_error::{e, stack_error};
use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{BackendRule, CONFIG_FILE};

/// Contents written on first load when no configuration file exists.
pub const DEFAULT_CONFIG: &[u8] = br#"{
    "tld": "wip",
    "host": "localhost",
    "port": 7080,
    "domains": {},
    "backends": []
}
"#;

/// Errors surfaced by configuration loading and mutation.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ConfigError {
    /// Reading or writing the configuration file failed.
    #[error("unable to access the proxy configuration file {path:?}")]
    Io {
        path: PathBuf,
        #[error(source, std_err)]
        source: io::Error,
    },
    /// The configuration file is not valid JSON.
    #[error("unable to parse the proxy configuration file {path:?}")]
    Parse {
        path: PathBuf,
        #[error(source, std_err)]
        source: serde_json::Error,
    },
    /// A short domain carried the TLD suffix.
    #[error("domain {domain:?} must not end with the {tld:?} TLD, please remove the TLD")]
    TldSuffix { domain: String, tld: String },
    /// No backend rule matched the detach arguments.
    #[error("no backend matched the given domain, basepath and backend")]
    BackendNotFound,
}

fn default_tld() -> String {
    "wip".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    7080
}

/// The persisted shape of the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ConfigData {
    #[serde(default = "default_tld")]
    tld: String,
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    domains: BTreeMap<String, String>,
    #[serde(default)]
    backends: Vec<BackendRule>,
}

/// The shared configuration store.
///
/// Not `Clone` on purpose: the lock and the watcher make copies unsafe, so
/// there is exactly one authoritative instance behind an `Arc`.
pub struct ConfigStore {
    path: PathBuf,
    inner: RwLock<ConfigData>,
}

impl ConfigStore {
    /// Loads `proxy.json` from the given home directory, creating the
    /// directory and a default file when absent.
    pub fn load(home_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = home_dir.as_ref().join(CONFIG_FILE);
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|source| {
                    e!(ConfigError::Io {
                        path: path.clone(),
                        source
                    })
                })?;
            }
            fs::write(&path, DEFAULT_CONFIG).map_err(|source| {
                e!(ConfigError::Io {
                    path: path.clone(),
                    source
                })
            })?;
        }
        let bytes = fs::read(&path).map_err(|source| {
            e!(ConfigError::Io {
                path: path.clone(),
                source
            })
        })?;
        let mut data: ConfigData = serde_json::from_slice(&bytes).map_err(|source| {
            e!(ConfigError::Parse {
                path: path.clone(),
                source
            })
        })?;
        if data.host.is_empty() {
            data.host = default_host();
        }
        Ok(Self {
            path,
            inner: RwLock::new(data),
        })
    }

    /// Path of the persisted configuration file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tld(&self) -> String {
        self.read().tld.clone()
    }

    pub fn host(&self) -> String {
        self.read().host.clone()
    }

    pub fn port(&self) -> u16 {
        self.read().port
    }

    /// `host:port` the proxy listens on.
    pub fn listen_addr(&self) -> String {
        let data = self.read();
        format!("{}:{}", data.host, data.port)
    }

    /// Snapshot of the short-domain to directory map.
    pub fn domains(&self) -> BTreeMap<String, String> {
        self.read().domains.clone()
    }

    /// Snapshot of the backend rules in match order.
    pub fn backends(&self) -> Vec<BackendRule> {
        self.read().backends.clone()
    }

    /// Directory to short-domains view, sorted by directory.
    pub fn dirs(&self) -> BTreeMap<String, Vec<String>> {
        let data = self.read();
        let mut dirs: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (domain, dir) in &data.domains {
            dirs.entry(dir.clone()).or_default().push(domain.clone());
        }
        dirs
    }

    /// The project directory linked to a hostname, if any.
    pub fn get_dir(&self, host: &str) -> Option<String> {
        let data = self.read();
        let fqdn = normalize_domain(&data, host);
        data.domains.get(without_tld(&fqdn, &data.tld)).cloned()
    }

    /// Fully-qualified domains linked to a directory.
    pub fn get_domains(&self, dir: &str) -> Vec<String> {
        let data = self.read();
        data.domains
            .iter()
            .filter(|(_, d)| d.as_str() == dir)
            .map(|(domain, _)| format!("{domain}.{}", data.tld))
            .collect()
    }

    /// Like [`get_domains`], excluding wildcard patterns that cannot be
    /// dialed directly.
    ///
    /// [`get_domains`]: ConfigStore::get_domains
    pub fn get_reachable_domains(&self, dir: &str) -> Vec<String> {
        let data = self.read();
        data.domains
            .iter()
            .filter(|(domain, d)| !domain.contains('*') && d.as_str() == dir)
            .map(|(domain, _)| format!("{domain}.{}", data.tld))
            .collect()
    }

    /// Resolves a hostname to the fully-qualified domain used for lookups.
    ///
    /// Strips a trailing `.tld`, tries an exact match, then the longest
    /// wildcard suffix match, and falls back to the input plus `.tld`.
    pub fn normalize_domain(&self, host: &str) -> String {
        normalize_domain(&self.read(), host)
    }

    /// True when the host (optionally `host:port`) ends in the TLD.
    pub fn tld_matches(&self, host: &str) -> bool {
        let tld = self.tld();
        let host = strip_port(host);
        host.ends_with(&format!(".{tld}"))
    }

    /// Links domains to a directory.
    pub fn add_dir_domains(&self, dir: &str, domains: &[String]) -> Result<(), ConfigError> {
        let mut data = self.write();
        reject_tld_suffix(&data, domains)?;
        for domain in domains {
            data.domains.insert(domain.clone(), dir.to_string());
        }
        self.save_locked(&data)
    }

    /// Replaces every domain linked to `dir` with the given set.
    pub fn replace_dir_domains(&self, dir: &str, domains: &[String]) -> Result<(), ConfigError> {
        let mut data = self.write();
        reject_tld_suffix(&data, domains)?;
        data.domains.retain(|_, d| d.as_str() != dir);
        for domain in domains {
            data.domains.insert(domain.clone(), dir.to_string());
        }
        self.save_locked(&data)
    }

    /// Unlinks the given domains.
    pub fn remove_dir_domains(&self, domains: &[String]) -> Result<(), ConfigError> {
        let mut data = self.write();
        reject_tld_suffix(&data, domains)?;
        for domain in domains {
            data.domains.remove(domain);
        }
        self.save_locked(&data)
    }

    /// Appends a backend rule. Unconditional; the caller persists.
    pub fn append_backend(&self, rule: BackendRule) {
        self.write().backends.push(rule);
    }

    /// Removes every backend rule equal to the argument.
    ///
    /// Returns [`ConfigError::BackendNotFound`] when nothing matched; the
    /// caller is expected to persist either way.
    pub fn remove_backend(&self, rule: &BackendRule) -> Result<(), ConfigError> {
        let mut data = self.write();
        let before = data.backends.len();
        data.backends.retain(|existing| existing != rule);
        if data.backends.len() == before {
            Err(e!(ConfigError::BackendNotFound))
        } else {
            Ok(())
        }
    }

    /// Persists the current state to disk.
    pub fn save(&self) -> Result<(), ConfigError> {
        let data = self.read();
        self.save_locked(&data)
    }

    fn save_locked(&self, data: &ConfigData) -> Result<(), ConfigError> {
        let mut bytes = serde_json::to_vec_pretty(data).map_err(|source| {
            e!(ConfigError::Parse {
                path: self.path.clone(),
                source
            })
        })?;
        bytes.push(b'\n');
        fs::write(&self.path, bytes).map_err(|source| {
            e!(ConfigError::Io {
                path: self.path.clone(),
                source
            })
        })
    }

    /// Watches the configuration file and reloads on every write.
    ///
    /// Loops until the watcher channel closes. Reload failures keep the
    /// previous state. The listen port is deliberately not reloaded; a
    /// restart is required to move the listener.
    pub fn watch(&self) {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut watcher =
            match notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                tx.send(res).ok();
            }) {
                Ok(watcher) => watcher,
                Err(err) => {
                    warn!("unable to watch proxy config file: {err}");
                    return;
                }
            };
        if let Err(err) = watcher.watch(&self.path, RecursiveMode::NonRecursive) {
            warn!("unable to watch proxy config file: {err}");
            return;
        }
        for event in rx {
            match event {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    debug!("proxy config file changed, reloading");
                    self.reload();
                }
                Ok(_) => {}
                Err(err) => warn!("proxy config watch error: {err}"),
            }
        }
    }

    /// Reloads the TLD, domains and backends from disk (not the port).
    fn reload(&self) {
        let Ok(bytes) = fs::read(&self.path) else {
            return;
        };
        let Ok(data) = serde_json::from_slice::<ConfigData>(&bytes) else {
            return;
        };
        let mut inner = self.write();
        inner.tld = data.tld;
        inner.domains = data.domains;
        inner.backends = data.backends;
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ConfigData> {
        self.inner.read().expect("config lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ConfigData> {
        self.inner.write().expect("config lock poisoned")
    }
}

fn reject_tld_suffix(data: &ConfigData, domains: &[String]) -> Result<(), ConfigError> {
    let suffix = format!(".{}", data.tld);
    for domain in domains {
        if domain.ends_with(&suffix) {
            return Err(e!(ConfigError::TldSuffix {
                domain: domain.clone(),
                tld: data.tld.clone()
            }));
        }
    }
    Ok(())
}

fn normalize_domain(data: &ConfigData, host: &str) -> String {
    let short = without_tld(host, &data.tld);
    let fqdn = format!("{short}.{}", data.tld);
    if data.domains.contains_key(short) {
        return fqdn;
    }
    let mut best = String::new();
    for pattern in data.domains.keys() {
        if !pattern.contains('*') {
            continue;
        }
        // Glob matching: "*.demo" matches anything ending in ".demo".
        if short.ends_with(&pattern.replace("*.", ".")) {
            let candidate = format!("{pattern}.{}", data.tld);
            if candidate.len() > best.len() {
                best = candidate;
            }
        }
    }
    if best.is_empty() { fqdn } else { best }
}

fn without_tld<'a>(domain: &'a str, tld: &str) -> &'a str {
    let suffix = format!(".{tld}");
    domain.strip_suffix(suffix.as_str()).unwrap_or(domain)
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    fn store_with(domains: &[(&str, &str)]) -> ConfigStore {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.keep()).unwrap();
        for (domain, project) in domains {
            store
                .add_dir_domains(project, &[domain.to_string()])
                .unwrap();
        }
        store
    }

    #[test]
    fn load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path()).unwrap();
        assert!(dir.path().join(CONFIG_FILE).exists());
        assert_eq!(store.tld(), "wip");
        assert_eq!(store.host(), "localhost");
        assert_eq!(store.port(), 7080);
        assert!(store.domains().is_empty());
        assert!(store.backends().is_empty());

        // A second load reads the same state back.
        let again = ConfigStore::load(dir.path()).unwrap();
        assert_eq!(*store.read(), *again.read());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path()).unwrap();
        store
            .add_dir_domains("/path/to/project", &["example".to_string()])
            .unwrap();
        store.append_backend(BackendRule::new("*", "/star", "http://localhost:1234/"));
        store.save().unwrap();

        let reloaded = ConfigStore::load(dir.path()).unwrap();
        assert_eq!(*store.read(), *reloaded.read());
        assert_eq!(
            reloaded.get_dir("example.wip").as_deref(),
            Some("/path/to/project")
        );
    }

    #[test]
    fn domains_must_not_carry_the_tld() {
        let store = store_with(&[]);
        let err = store
            .add_dir_domains("/dir", &["example.wip".to_string()])
            .unwrap_err();
        assert!(matches!(err, ConfigError::TldSuffix { .. }));
        assert!(store.domains().is_empty());
    }

    #[test]
    fn detach_missing_backend_reports_not_found_and_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path()).unwrap();
        let before = fs::read(store.path()).unwrap();

        let rule = BackendRule::new("*", "/star", "http://localhost:1234/");
        let err = store.remove_backend(&rule).unwrap_err();
        assert!(matches!(err, ConfigError::BackendNotFound { .. }));

        // Detach still persists afterwards; the contents are unchanged.
        store.save().unwrap();
        let after = fs::read(store.path()).unwrap();
        assert_eq!(
            serde_json::from_slice::<ConfigData>(&before).unwrap(),
            serde_json::from_slice::<ConfigData>(&after).unwrap()
        );
    }

    #[test]
    fn remove_backend_drops_all_equal_rules() {
        let store = store_with(&[]);
        store.append_backend(BackendRule::new("", "/star", "http://localhost:1/"));
        store.append_backend(BackendRule::new("*", "/star", "http://localhost:1/"));
        store.append_backend(BackendRule::new("*", "/other", "http://localhost:1/"));
        store
            .remove_backend(&BackendRule::new("*", "/star", "http://localhost:1/"))
            .unwrap();
        assert_eq!(
            store.backends(),
            vec![BackendRule::new("*", "/other", "http://localhost:1/")]
        );
    }

    #[test]
    fn normalize_domain_prefers_exact_then_longest_wildcard() {
        let store = store_with(&[
            ("example", "/a"),
            ("*.demo", "/b"),
            ("*.sub.demo", "/c"),
        ]);
        assert_eq!(store.normalize_domain("example"), "example.wip");
        assert_eq!(store.normalize_domain("example.wip"), "example.wip");
        assert_eq!(store.normalize_domain("api.demo"), "*.demo.wip");
        assert_eq!(store.normalize_domain("api.sub.demo.wip"), "*.sub.demo.wip");
        assert_eq!(store.normalize_domain("unknown"), "unknown.wip");

        assert_eq!(store.get_dir("api.demo.wip").as_deref(), Some("/b"));
        assert_eq!(store.get_dir("nothing.wip"), None);
    }

    #[test]
    fn reachable_domains_exclude_wildcards() {
        let store = store_with(&[("example", "/a"), ("*.demo", "/a")]);
        let mut all = store.get_domains("/a");
        all.sort();
        assert_eq!(all, vec!["*.demo.wip", "example.wip"]);
        assert_eq!(store.get_reachable_domains("/a"), vec!["example.wip"]);
    }

    #[test]
    fn tld_matching_allows_a_port_suffix() {
        let store = store_with(&[]);
        assert!(store.tld_matches("example.wip"));
        assert!(store.tld_matches("example.wip:8443"));
        assert!(!store.tld_matches("example.dev"));
        assert!(!store.tld_matches("wip"));
    }

    #[test]
    fn watcher_reloads_domains_and_tld_but_not_port() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConfigStore::load(dir.path()).unwrap());
        let watch_store = store.clone();
        std::thread::spawn(move || watch_store.watch());
        // Give the watcher a moment to register.
        std::thread::sleep(Duration::from_millis(200));

        fs::write(
            store.path(),
            br#"{"tld": "test", "host": "localhost", "port": 9999,
                "domains": {"example": "/dir"}, "backends": []}"#,
        )
        .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while store.tld() != "test" && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(store.tld(), "test");
        assert_eq!(store.domains().get("example").map(String::as_str), Some("/dir"));
        // The port is deliberately not reloaded.
        assert_eq!(store.port(), 7080);
    }
}
