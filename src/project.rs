//! Project lookup.
//!
//! Maps a hostname to the linked project directory (via the configuration)
//! and asks the PID registry whether a web server is running there. The
//! registry itself is an external collaborator; this module only consumes
//! its contract: project servers announce their loopback port by writing a
//! JSON record under `<home>/var/`, and remove it when they stop.

use std::{
    fs,
    hash::{Hash, Hasher},
    path::PathBuf,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::ConfigStore;

/// Contract consumed from the external PID registry.
pub trait PidRegistry: Send + Sync {
    /// Loopback port of the web server running for `dir`, if any.
    fn running_port(&self, dir: &str) -> Option<u16>;

    /// Every project currently announcing a running server.
    fn running_projects(&self) -> Vec<PidRecord>;
}

/// One registry record, as persisted by a project web server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidRecord {
    /// Project directory the server was started in.
    pub dir: String,
    /// Process id of the server.
    pub pid: u32,
    /// Loopback port the server listens on.
    pub port: u16,
    /// `http` or `https`.
    pub scheme: String,
}

/// File-backed registry reading `*.pid` records under `<home>/var/`.
#[derive(Debug, Clone)]
pub struct FilePidRegistry {
    var_dir: PathBuf,
}

impl FilePidRegistry {
    pub fn new(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            var_dir: home_dir.into().join("var"),
        }
    }

    /// Writes a record for a running server. Used by project tooling and
    /// tests; the proxy itself only reads.
    pub fn announce(&self, record: &PidRecord) -> std::io::Result<()> {
        fs::create_dir_all(&self.var_dir)?;
        let path = self.record_path(&record.dir);
        fs::write(path, serde_json::to_vec_pretty(record)?)
    }

    /// Removes the record for `dir`.
    pub fn withdraw(&self, dir: &str) -> std::io::Result<()> {
        match fs::remove_file(self.record_path(dir)) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn record_path(&self, dir: &str) -> PathBuf {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        dir.hash(&mut hasher);
        self.var_dir.join(format!("{:016x}.pid", hasher.finish()))
    }
}

impl PidRegistry for FilePidRegistry {
    fn running_port(&self, dir: &str) -> Option<u16> {
        let bytes = fs::read(self.record_path(dir)).ok()?;
        let record: PidRecord = serde_json::from_slice(&bytes).ok()?;
        Some(record.port)
    }

    fn running_projects(&self) -> Vec<PidRecord> {
        let Ok(entries) = fs::read_dir(&self.var_dir) else {
            return Vec::new();
        };
        let mut records: Vec<PidRecord> = entries
            .flatten()
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "pid"))
            .filter_map(|entry| {
                let bytes = fs::read(entry.path()).ok()?;
                serde_json::from_slice(&bytes).ok()
            })
            .collect();
        records.sort_by(|a, b| a.dir.cmp(&b.dir));
        records
    }
}

/// Outcome of resolving a hostname to a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Project {
    /// The hostname is not linked to any directory.
    NotLinked,
    /// Linked, but the registry shows no running server.
    NotRunning { dir: String },
    /// Linked with a web server on the given loopback port.
    Running { dir: String, port: u16 },
}

/// Resolves hostnames through the configuration and the PID registry.
#[derive(Clone)]
pub struct ProjectResolver {
    config: Arc<ConfigStore>,
    registry: Arc<dyn PidRegistry>,
}

impl ProjectResolver {
    pub fn new(config: Arc<ConfigStore>, registry: Arc<dyn PidRegistry>) -> Self {
        Self { config, registry }
    }

    pub fn registry(&self) -> &Arc<dyn PidRegistry> {
        &self.registry
    }

    pub fn resolve(&self, host_name: &str) -> Project {
        let Some(dir) = self.config.get_dir(host_name) else {
            return Project::NotLinked;
        };
        match self.registry.running_port(&dir) {
            Some(port) => Project::Running { dir, port },
            None => Project::NotRunning { dir },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(dir: &str, port: u16) -> PidRecord {
        PidRecord {
            dir: dir.to_string(),
            pid: 4242,
            port,
            scheme: "http".to_string(),
        }
    }

    #[test]
    fn announce_and_withdraw() {
        let home = tempfile::tempdir().unwrap();
        let registry = FilePidRegistry::new(home.path());
        assert_eq!(registry.running_port("/some/dir"), None);

        registry.announce(&record("/some/dir", 8000)).unwrap();
        assert_eq!(registry.running_port("/some/dir"), Some(8000));
        assert_eq!(registry.running_projects(), vec![record("/some/dir", 8000)]);

        registry.withdraw("/some/dir").unwrap();
        assert_eq!(registry.running_port("/some/dir"), None);
        assert!(registry.running_projects().is_empty());
    }

    #[test]
    fn resolver_distinguishes_linked_and_running() {
        let home = tempfile::tempdir().unwrap();
        let config = Arc::new(ConfigStore::load(home.path()).unwrap());
        config
            .add_dir_domains("/proj", &["example".to_string()])
            .unwrap();
        let registry = FilePidRegistry::new(home.path());
        let resolver = ProjectResolver::new(config, Arc::new(registry.clone()));

        assert_eq!(resolver.resolve("other.wip"), Project::NotLinked);
        assert_eq!(
            resolver.resolve("example.wip"),
            Project::NotRunning {
                dir: "/proj".to_string()
            }
        );

        registry.announce(&record("/proj", 8000)).unwrap();
        assert_eq!(
            resolver.resolve("example.wip"),
            Project::Running {
                dir: "/proj".to_string(),
                port: 8000
            }
        );
    }
}
