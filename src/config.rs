use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

fn default_public_host() -> String {
    "termsha.re:443".to_string()
}

fn default_tls() -> bool {
    true
}

fn default_homepage() -> String {
    "https://termsha.re".to_string()
}

fn default_download_template() -> String {
    "https://termsha.re/releases/{version}/tsh_{version}_{os}_x86_64.tgz".to_string()
}

/// Daemon configuration, loaded from TOML.
///
/// Everything here shapes only what the daemon tells clients about itself
/// (join URLs, redirects); the listen port comes from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// host:port this daemon is reachable at, used to compose join URLs.
    #[serde(default = "default_public_host")]
    pub public_host: String,
    /// Scheme selection for composed URLs. TLS termination itself is
    /// external to the daemon.
    #[serde(default = "default_tls")]
    pub tls: bool,
    /// Where `GET /` redirects.
    #[serde(default = "default_homepage")]
    pub homepage: String,
    /// Release artifact URL for `GET /download/{os}`; `{version}` and
    /// `{os}` are substituted.
    #[serde(default = "default_download_template")]
    pub download_template: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            public_host: default_public_host(),
            tls: default_tls(),
            homepage: default_homepage(),
            download_template: default_download_template(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {}", .0.display(), .1)]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config {}: {}", .0.display(), .1)]
    ParseFailed(PathBuf, #[source] toml::de::Error),
}

impl DaemonConfig {
    /// Load config from a TOML file path. Returns `Ok(None)` if the file
    /// doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// Scheme + public host, with the scheme's default port trimmed so the
    /// URLs shown to humans stay short.
    pub fn public_base(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        let default_suffix = if self.tls { ":443" } else { ":80" };
        let host = self
            .public_host
            .strip_suffix(default_suffix)
            .unwrap_or(&self.public_host);
        format!("{}://{}", scheme, host)
    }

    /// Joinable URL for a session name.
    pub fn public_url(&self, name: &str) -> String {
        format!("{}/{}", self.public_base(), name)
    }

    /// Release artifact URL for one target OS.
    pub fn download_url(&self, os: &str) -> String {
        self.download_template
            .replace("{version}", crate::VERSION)
            .replace("{os}", os)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_compose_sensible_urls() {
        let config = DaemonConfig::default();
        assert_eq!(config.public_base(), "https://termsha.re");
        assert_eq!(config.public_url("abc"), "https://termsha.re/abc");
    }

    #[test]
    fn non_default_port_is_kept_in_urls() {
        let config = DaemonConfig {
            public_host: "localhost:8080".into(),
            tls: false,
            ..Default::default()
        };
        assert_eq!(config.public_url("abc"), "http://localhost:8080/abc");
    }

    #[test]
    fn default_port_is_trimmed_per_scheme() {
        let plain = DaemonConfig {
            public_host: "example.net:80".into(),
            tls: false,
            ..Default::default()
        };
        assert_eq!(plain.public_base(), "http://example.net");

        // :80 is not the default for https, so it stays.
        let mismatched = DaemonConfig {
            public_host: "example.net:80".into(),
            tls: true,
            ..Default::default()
        };
        assert_eq!(mismatched.public_base(), "https://example.net:80");
    }

    #[test]
    fn download_url_substitutes_version_and_os() {
        let config = DaemonConfig::default();
        let url = config.download_url("linux");
        assert!(url.contains("linux"));
        assert!(url.contains(crate::VERSION));
        assert!(!url.contains("{os}"));
        assert!(!url.contains("{version}"));
    }

    #[test]
    fn parse_partial_config_fills_defaults() {
        let parsed: DaemonConfig = toml::from_str(
            r#"
            public_host = "share.corp.example:8443"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.public_host, "share.corp.example:8443");
        assert!(parsed.tls);
        assert_eq!(parsed.homepage, default_homepage());
    }

    #[test]
    fn parse_empty_config_is_all_defaults() {
        let parsed: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(parsed.public_host, default_public_host());
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(DaemonConfig::load(&path).unwrap().is_none());
    }

    #[test]
    fn load_reads_and_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tsh.toml");
        std::fs::write(&path, "tls = false\npublic_host = \"127.0.0.1:9000\"\n").unwrap();

        let config = DaemonConfig::load(&path).unwrap().unwrap();
        assert!(!config.tls);
        assert_eq!(config.public_url("n"), "http://127.0.0.1:9000/n");
    }

    #[test]
    fn load_rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "public_host = [not toml").unwrap();
        assert!(matches!(
            DaemonConfig::load(&path),
            Err(ConfigError::ParseFailed(_, _))
        ));
    }
}
