use amiitag_lib::SessionConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Optional `--config` file. Command line flags win over anything set here.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CliConfig {
    pub keys: KeysConfig,
    /// Device session tunables; durations in milliseconds
    pub session: SessionConfig,
    /// Figure catalog JSON
    pub catalog: Option<PathBuf>,
    /// Concatenated uid/signature records
    pub signatures: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeysConfig {
    pub path: Option<PathBuf>,
    /// Expected SHA-256 of the key file, hex
    pub sha256: Option<String>,
}

impl CliConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read config {:?}", path))?;
        toml::from_str(&text).with_context(|| format!("Invalid config {:?}", path))
    }
}

/// Parse a hex SHA-256 digest.
pub fn parse_digest(hex: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex.trim()).context("Key digest is not valid hex")?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("Key digest must be 32 bytes, got {}", b.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_table() {
        let config: CliConfig = toml::from_str(
            r#"
            catalog = "amiibo.json"

            [keys]
            path = "key_retail.bin"
            sha256 = "aa"
            "#,
        )
        .unwrap();
        assert_eq!(config.keys.path.as_deref(), Some(Path::new("key_retail.bin")));
        assert_eq!(config.keys.sha256.as_deref(), Some("aa"));
        assert_eq!(config.catalog.as_deref(), Some(Path::new("amiibo.json")));
        assert!(config.signatures.is_none());
    }

    #[test]
    fn test_session_table() {
        let config: CliConfig = toml::from_str(
            r#"
            [session]
            response_timeout_ms = 500
            max_pages_per_read = 16
            "#,
        )
        .unwrap();
        assert_eq!(config.session.response_timeout, std::time::Duration::from_millis(500));
        assert_eq!(config.session.max_pages_per_read, 16);
        assert_eq!(config.session.marker, "FAST");
    }

    #[test]
    fn test_empty_config() {
        let config: CliConfig = toml::from_str("").unwrap();
        assert!(config.keys.path.is_none());
    }

    #[test]
    fn test_digest_length() {
        assert!(parse_digest(&"ab".repeat(32)).is_ok());
        assert!(parse_digest("abcd").is_err());
        assert!(parse_digest("zz").is_err());
    }
}
