//! Server settings: an ini file plus a couple of launcher flags.
//!
//! Section `[BrowserIntegration]` carries the integration knobs; section
//! `[HostAliases]` maps a site hostname to the alternative hostnames a
//! browser may present in its `Origin` header. Hostnames are normalized on
//! load: lowercased, whitespace-stripped, scheme and port removed, empties
//! dropped.

use anyhow::{Context, Result};
use ini::Ini;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 9000;

/// Environment override for the ini location, checked after the CLI flag
/// and before the per-user config directory.
pub const CONFIG_ENV: &str = "WSB_CONFIG";

#[derive(Debug, Clone)]
pub struct Settings {
    pub enabled: bool,
    pub port: u16,
    /// Where `server.crt` / `server.key` live. `None` means the per-user
    /// default under the config directory.
    pub certificate_folder: Option<PathBuf>,
    /// Normalized hostname of the site this bridge serves.
    pub host: String,
    /// Site base URL used for REST calls; the admission check only looks at
    /// `host` and the alias table.
    pub site_url: String,
    pub host_aliases: HashMap<String, Vec<String>>,
    pub encrypt: bool,
    pub debug: bool,
    /// Authenticated user the bridge runs as; echoed in admission
    /// notifications so the UI can explain a rejected connection.
    pub user_id: i64,
    /// Optional launcher binary overriding the OS default for `open`.
    pub open_launcher: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_PORT,
            certificate_folder: None,
            host: String::new(),
            site_url: String::new(),
            host_aliases: HashMap::new(),
            encrypt: false,
            debug: false,
            user_id: 0,
            open_launcher: None,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let ini = Ini::load_from_file(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut settings = Settings::default();

        if let Some(section) = ini.section(Some("BrowserIntegration")) {
            if let Some(port) = section.get("port") {
                settings.port = port
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid port '{port}'"))?;
            }
            if let Some(enabled) = section.get("enabled") {
                settings.enabled = parse_bool(enabled);
            }
            if let Some(folder) = section.get("certificate_folder") {
                if !folder.trim().is_empty() {
                    settings.certificate_folder = Some(PathBuf::from(folder.trim()));
                }
            }
            if let Some(host) = section.get("host") {
                settings.host = normalize_hostname(host).unwrap_or_default();
            }
            if let Some(url) = section.get("site_url") {
                settings.site_url = url.trim().trim_end_matches('/').to_string();
            }
            if let Some(encrypt) = section.get("encrypt") {
                settings.encrypt = parse_bool(encrypt);
            }
            if let Some(user) = section.get("user_id") {
                settings.user_id = user
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid user_id '{user}'"))?;
            }
            if let Some(launcher) = section.get("open_launcher") {
                if !launcher.trim().is_empty() {
                    settings.open_launcher = Some(PathBuf::from(launcher.trim()));
                }
            }
        }

        if let Some(section) = ini.section(Some("HostAliases")) {
            for (main, aliases) in section.iter() {
                let Some(main) = normalize_hostname(main) else {
                    continue;
                };
                let aliases: Vec<String> = aliases
                    .split(',')
                    .filter_map(normalize_hostname)
                    .collect();
                settings.host_aliases.insert(main, aliases);
            }
        }

        Ok(settings)
    }

    /// Resolves the config file: explicit flag, then `WSB_CONFIG`, then the
    /// per-user config directory. Only existing files are returned.
    pub fn discover(cli_path: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = cli_path {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.trim().is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        let candidate = dirs_next::config_dir()?.join("wsb").join("config.ini");
        candidate.exists().then_some(candidate)
    }

    /// Admission predicate: the origin's hostname must equal the configured
    /// host or one of its declared aliases.
    pub fn origin_allowed(&self, origin: &str) -> bool {
        let Some(origin_host) = normalize_hostname(origin) else {
            return false;
        };
        if origin_host == self.host {
            return true;
        }
        self.host_aliases
            .get(&self.host)
            .map(|aliases| aliases.iter().any(|a| a == &origin_host))
            .unwrap_or(false)
    }

    /// Directory the TLS key pair is read from.
    pub fn keys_path(&self) -> PathBuf {
        match &self.certificate_folder {
            Some(folder) => folder.clone(),
            None => dirs_next::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("wsb")
                .join("keys"),
        }
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Lowercases, strips whitespace, drops a scheme, path and port. Returns
/// `None` for entries that normalize to nothing.
pub fn normalize_hostname(raw: &str) -> Option<String> {
    let mut host = raw.trim().to_ascii_lowercase();
    if let Some(idx) = host.find("://") {
        host = host[idx + 3..].to_string();
    }
    if let Some(idx) = host.find('/') {
        host.truncate(idx);
    }
    if let Some(idx) = host.find(':') {
        host.truncate(idx);
    }
    let host: String = host.chars().filter(|c| !c.is_whitespace()).collect();
    (!host.is_empty()).then_some(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_config(body: &str) -> (tempfile::TempDir, PathBuf) {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("config.ini");
        std::fs::write(&path, body).unwrap();
        (tmp, path)
    }

    #[test]
    fn loads_browser_integration_section() {
        let (_tmp, path) = write_config(
            "[BrowserIntegration]\n\
             port = 9100\n\
             enabled = true\n\
             certificate_folder = /var/keys\n\
             host = https://Studio.Example.com\n\
             site_url = https://studio.example.com/\n\
             encrypt = yes\n\
             user_id = 42\n",
        );
        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.port, 9100);
        assert!(settings.enabled);
        assert_eq!(settings.certificate_folder, Some(PathBuf::from("/var/keys")));
        assert_eq!(settings.host, "studio.example.com");
        assert_eq!(settings.site_url, "https://studio.example.com");
        assert!(settings.encrypt);
        assert_eq!(settings.user_id, 42);
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let (_tmp, path) = write_config("[BrowserIntegration]\n");
        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.port, DEFAULT_PORT);
        assert!(settings.enabled);
        assert!(!settings.encrypt);
    }

    #[test]
    fn host_aliases_are_normalized() {
        let (_tmp, path) = write_config(
            "[HostAliases]\n\
             studio.example.com = Staging.Example.com , https://alt.example.com:8888, , \n",
        );
        let settings = Settings::load(&path).unwrap();
        assert_eq!(
            settings.host_aliases["studio.example.com"],
            vec!["staging.example.com".to_string(), "alt.example.com".to_string()]
        );
    }

    #[test]
    fn hostname_normalization() {
        assert_eq!(
            normalize_hostname(" https://Studio.Example.com:9000/path "),
            Some("studio.example.com".into())
        );
        assert_eq!(normalize_hostname("plain-host"), Some("plain-host".into()));
        assert_eq!(normalize_hostname("  "), None);
        assert_eq!(normalize_hostname("https://"), None);
    }

    #[test]
    fn origin_admission() {
        let mut settings = Settings {
            host: "studio.example.com".into(),
            ..Settings::default()
        };
        settings.host_aliases.insert(
            "studio.example.com".into(),
            vec!["staging.example.com".into()],
        );
        assert!(settings.origin_allowed("https://studio.example.com"));
        assert!(settings.origin_allowed("https://STUDIO.example.com:443"));
        assert!(settings.origin_allowed("https://staging.example.com"));
        assert!(!settings.origin_allowed("https://other.example.com"));
        assert!(!settings.origin_allowed(""));
    }

    #[test]
    fn explicit_config_path_wins() {
        let explicit = PathBuf::from("/etc/wsb.ini");
        assert_eq!(
            Settings::discover(Some(&explicit)),
            Some(explicit)
        );
    }
}
