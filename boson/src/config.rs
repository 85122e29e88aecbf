//! Node configuration: TOML file plus CLI overrides.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::info;

use lib_core::Id;
use lib_dht::{BootstrapNode, DhtConfig};

/// Top-level configuration file. The `[dht]` table maps directly onto the
/// engine options; everything is optional.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub dht: Option<DhtConfig>,
}

/// Load `path` when it exists; a missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<DhtConfig> {
    if !path.exists() {
        info!(path = %path.display(), "no configuration file, using defaults");
        return Ok(DhtConfig::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file: ConfigFile =
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(file.dht.unwrap_or_default())
}

/// CLI overrides applied on top of the file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub host4: Option<String>,
    pub host6: Option<String>,
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub bootstrap: Vec<String>,
    pub developer_mode: bool,
    pub metrics: bool,
}

impl Overrides {
    pub fn apply(self, mut config: DhtConfig) -> Result<DhtConfig> {
        if self.host4.is_some() {
            config.host4 = self.host4;
        }
        if self.host6.is_some() {
            config.host6 = self.host6;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        for text in self.bootstrap {
            config.bootstrap_nodes.push(parse_bootstrap(&text)?);
        }
        if self.developer_mode {
            config.enable_developer_mode = true;
        }
        if self.metrics {
            config.enable_metrics = true;
        }
        Ok(config)
    }
}

/// Parse an `id@host:port` bootstrap argument.
pub fn parse_bootstrap(text: &str) -> Result<BootstrapNode> {
    let Some((id_text, addr_text)) = text.split_once('@') else {
        bail!("bootstrap node must look like <id>@<host>:<port>, got '{}'", text);
    };
    let id: Id = id_text
        .parse()
        .map_err(|_| anyhow::anyhow!("bad bootstrap id '{}'", id_text))?;
    let addr: SocketAddr = addr_text
        .parse()
        .with_context(|| format!("bad bootstrap address '{}'", addr_text))?;
    Ok(BootstrapNode {
        id: id.to_hex(),
        host: addr.ip().to_string(),
        port: addr.port(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = load_config(Path::new("/nonexistent/boson.toml")).unwrap();
        assert_eq!(config.port, DhtConfig::default().port);
    }

    #[test]
    fn test_file_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boson.toml");
        std::fs::write(
            &path,
            r#"
[dht]
port = 40001
host4 = "0.0.0.0"
enable_metrics = true
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.port, 40001);
        assert!(config.enable_metrics);

        let overridden = Overrides {
            port: Some(40002),
            developer_mode: true,
            ..Overrides::default()
        }
        .apply(config)
        .unwrap();
        assert_eq!(overridden.port, 40002);
        assert!(overridden.enable_developer_mode);
    }

    #[test]
    fn test_parse_bootstrap() {
        let id = Id::random();
        let parsed = parse_bootstrap(&format!("{}@203.0.113.7:39001", id)).unwrap();
        assert_eq!(parsed.host, "203.0.113.7");
        assert_eq!(parsed.port, 39001);
        assert_eq!(parsed.id, id.to_hex());

        assert!(parse_bootstrap("not-a-node").is_err());
        assert!(parse_bootstrap("beef@nowhere").is_err());
    }
}
