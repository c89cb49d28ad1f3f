//! Server-side configuration file.
//!
//! Every table is optional; a missing file means defaults everywhere.

use std::path::{Path, PathBuf};

use audience_segment::SegmentConfig;
use serde::Deserialize;

/// Top-level `audienced` configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub storage: StorageSection,

    #[serde(default)]
    pub segments: SegmentConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerSection {
    /// Listen address, e.g. "127.0.0.1:9000".
    #[serde(default)]
    pub listen: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageSection {
    /// Directory holding `data.sqlite`.
    #[serde(default)]
    pub data_dir: String,

    /// Explicit database file; wins over `data_dir`.
    #[serde(default)]
    pub sqlite_path: String,
}

impl ServerConfig {
    /// Resolve a context name or path to a config file path.
    ///
    /// Anything containing `/` or `.` is taken as a path; a bare name maps
    /// to `/etc/audience/<name>.toml`.
    pub fn resolve_path(name_or_path: &str) -> PathBuf {
        if name_or_path.contains('/') || name_or_path.contains('.') {
            PathBuf::from(name_or_path)
        } else {
            PathBuf::from(format!("/etc/audience/{name_or_path}.toml"))
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Build the core service config. Non-empty CLI values override the file.
    pub fn service_config(
        &self,
        listen: Option<&str>,
        data_dir: Option<&str>,
    ) -> audience_core::ServiceConfig {
        let mut cfg = audience_core::ServiceConfig::default();

        if let Some(listen) = pick(listen, &self.server.listen) {
            cfg.listen = listen.to_string();
        }
        if let Some(dir) = pick(data_dir, &self.storage.data_dir) {
            cfg.data_dir = Some(PathBuf::from(dir));
        }
        if !self.storage.sqlite_path.is_empty() {
            cfg.sqlite_path = Some(PathBuf::from(&self.storage.sqlite_path));
        }
        cfg
    }
}

fn pick<'a>(flag: Option<&'a str>, file: &'a str) -> Option<&'a str> {
    flag.filter(|s| !s.is_empty())
        .or_else(|| Some(file).filter(|s| !s.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_path() {
        assert_eq!(
            ServerConfig::resolve_path("prod"),
            PathBuf::from("/etc/audience/prod.toml")
        );
        assert_eq!(
            ServerConfig::resolve_path("./local.toml"),
            PathBuf::from("./local.toml")
        );
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = ServerConfig::parse("").unwrap();
        assert_eq!(config.segments.name_max_len, 200);
        let svc = config.service_config(None, None);
        assert_eq!(svc.listen, "0.0.0.0:8080");
        assert!(svc.data_dir.is_none());
    }

    #[test]
    fn test_parse_full() {
        let config = ServerConfig::parse(
            r#"
            [server]
            listen = "127.0.0.1:9000"

            [storage]
            data_dir = "/var/lib/audience"

            [segments]
            name_max_len = 64
            count_timeout_ms = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.segments.name_max_len, 64);
        assert!(config.segments.count_timeout().is_none());

        let svc = config.service_config(None, None);
        assert_eq!(svc.listen, "127.0.0.1:9000");
        assert_eq!(
            svc.resolve_sqlite_path(),
            PathBuf::from("/var/lib/audience/data.sqlite")
        );
    }

    #[test]
    fn test_cli_overrides_file() {
        let config = ServerConfig::parse(
            r#"
            [server]
            listen = "127.0.0.1:9000"
            [storage]
            data_dir = "/var/lib/audience"
            "#,
        )
        .unwrap();
        let svc = config.service_config(Some("0.0.0.0:7000"), Some("/tmp/aud"));
        assert_eq!(svc.listen, "0.0.0.0:7000");
        assert_eq!(svc.data_dir, Some(PathBuf::from("/tmp/aud")));

        // Empty flags fall through to the file.
        let svc = config.service_config(Some(""), None);
        assert_eq!(svc.listen, "127.0.0.1:9000");
    }

    #[test]
    fn test_load_missing_file() {
        assert!(ServerConfig::load(Path::new("/nonexistent/audience.toml")).is_err());
    }
}
