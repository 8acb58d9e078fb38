//! Configuration Manager

use super::{AppConfig, RegionDescriptor, RegionTable};
use crate::Result;
use anyhow::{bail, Context};
use std::path::{Path, PathBuf};

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<AppConfig> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = AppConfig::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<AppConfig> {
        let mut config = AppConfig::default();

        if let Ok(region) = std::env::var("SLSRELAY_REGION") {
            config.proxy.region = region;
        }

        if let Ok(dir) = std::env::var("SLSRELAY_MODULES_DIR") {
            config.proxy.modules_dir = PathBuf::from(dir);
        }

        if let Ok(hosts) = std::env::var("SLSRELAY_HOSTS_FILE") {
            config.proxy.hosts_file = Some(PathBuf::from(hosts));
        }

        if let Ok(grace) = std::env::var("SLSRELAY_SHUTDOWN_GRACE") {
            config.proxy.shutdown_grace = humantime::parse_duration(&grace)
                .with_context(|| format!("Invalid SLSRELAY_SHUTDOWN_GRACE: {}", grace))?;
        }

        if let Ok(log_level) = std::env::var("SLSRELAY_LOG_LEVEL") {
            config.proxy.log_level = log_level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load the region table
    pub fn load_regions(path: &Path) -> Result<RegionTable> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read region table: {}", path.display()))?;
        Self::parse_regions(&content)
            .with_context(|| format!("Invalid region table: {}", path.display()))
    }

    /// Parse and validate a region table from TOML text
    pub fn parse_regions(content: &str) -> Result<RegionTable> {
        let table: RegionTable = toml::from_str(content).context("Failed to parse region table")?;
        for (code, region) in &table.regions {
            region
                .validate()
                .with_context(|| format!("Region {} is invalid", code))?;
        }
        Ok(table)
    }
}

impl AppConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.proxy.region.trim().is_empty() {
            bail!("proxy.region must not be empty");
        }

        if self.proxy.buffer_size < 1024 {
            bail!("proxy.buffer_size must be at least 1024 bytes");
        }

        if self.proxy.buffer_size > 1048576 {
            bail!("proxy.buffer_size cannot exceed 1MB");
        }

        if self.proxy.connect_timeout.is_zero() {
            bail!("proxy.connect_timeout must be greater than 0");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.proxy.log_level.as_str()) {
            bail!(
                "proxy.log_level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        region: Option<&str>,
        modules_dir: Option<&Path>,
        hosts_file: Option<&Path>,
        log_level: Option<&str>,
    ) {
        if let Some(region) = region {
            self.proxy.region = region.to_string();
            tracing::info!("CLI override: region set to {}", region);
        }

        if let Some(dir) = modules_dir {
            self.proxy.modules_dir = dir.to_path_buf();
            tracing::info!("CLI override: modules directory set to {}", dir.display());
        }

        if let Some(hosts) = hosts_file {
            self.proxy.hosts_file = Some(hosts.to_path_buf());
            tracing::info!("CLI override: hosts file set to {}", hosts.display());
        }

        if let Some(level) = log_level {
            self.proxy.log_level = level.to_string();
        }
    }
}

impl RegionDescriptor {
    /// Validate a single region entry
    pub fn validate(&self) -> Result<()> {
        if self.hostname.trim().is_empty() {
            bail!("hostname must not be empty");
        }

        if self.port == 0 {
            bail!("port must be greater than 0");
        }

        match (&self.url, self.paths.is_empty()) {
            (Some(_), false) => bail!("url and paths are mutually exclusive"),
            (None, true) => bail!("either url or paths must be set"),
            (Some(url), true) => {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    bail!("url must be an http(s) URL: {}", url);
                }
            }
            (None, false) => {
                for path in &self.paths {
                    if !path.starts_with('/') {
                        bail!("path must start with '/': {}", path);
                    }
                }
            }
        }

        for (id, server) in &self.custom_servers {
            if id.trim().is_empty() {
                bail!("custom server identifiers must not be empty");
            }
            if server.port == 0 {
                bail!("custom server {} has invalid port 0", id);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const NA_EU: &str = r#"
        [regions.NA]
        url = "http://sls.service.enmasse.com:8080/servers/list.en"
        hostname = "sls.service.enmasse.com"
        port = 8080
        listen_hostname = "127.0.0.10"

        [regions.NA.custom_servers."1"]
        port = 9250

        [regions.EU]
        hostname = "web-sls.tera.gameforge.com"
        port = 4566
        paths = ["/servers/list.uk", "/servers/list.de", "/servers/list.fr"]
        listen_hostname = "127.0.0.11"

        [regions.EU.custom_servers."27"]
        ip = "127.0.0.2"
        port = 9250
    "#;

    #[test]
    fn test_parse_regions() {
        let table = ConfigManager::parse_regions(NA_EU).unwrap();
        assert_eq!(table.codes(), vec!["EU", "NA"]);

        let eu = table.get("EU").unwrap();
        assert_eq!(eu.paths.len(), 3);
        assert_eq!(
            eu.custom_servers["27"].listen_addr(),
            "127.0.0.2:9250".parse().unwrap()
        );
    }

    #[test]
    fn test_region_requires_one_source() {
        let both = r#"
            [regions.NA]
            url = "http://a/servers"
            paths = ["/servers"]
            hostname = "a"
            port = 80
            listen_hostname = "127.0.0.10"
        "#;
        assert!(ConfigManager::parse_regions(both).is_err());

        let neither = r#"
            [regions.NA]
            hostname = "a"
            port = 80
            listen_hostname = "127.0.0.10"
        "#;
        assert!(ConfigManager::parse_regions(neither).is_err());
    }

    #[test]
    fn test_rejects_zero_custom_port() {
        let content = r#"
            [regions.NA]
            url = "http://a/servers"
            hostname = "a"
            port = 80
            listen_hostname = "127.0.0.10"

            [regions.NA.custom_servers."1"]
            port = 0
        "#;
        assert!(ConfigManager::parse_regions(content).is_err());
    }

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [proxy]
            region = "EU"
            shutdown_grace = "2s"
            log_level = "debug"
            "#
        )
        .unwrap();

        let config = ConfigManager::load_from_file(file.path()).unwrap();
        assert_eq!(config.proxy.region, "EU");
        assert_eq!(config.proxy.shutdown_grace, std::time::Duration::from_secs(2));
        assert_eq!(config.proxy.buffer_size, 16 * 1024);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::default();
        config.proxy.log_level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = AppConfig::default();
        config.merge_with_cli_args(Some("KR"), None, Some(Path::new("/tmp/hosts")), None);
        assert_eq!(config.proxy.region, "KR");
        assert_eq!(config.proxy.hosts_path(), PathBuf::from("/tmp/hosts"));
    }
}
