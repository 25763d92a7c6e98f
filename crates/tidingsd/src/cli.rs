//! Command line arguments for the Tidings server

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Tidings - clustered topic routing for real-time messaging
#[derive(Parser, Debug)]
#[command(name = "tidingsd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "TIDINGS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Name of this node in the cluster node list
    #[arg(long, env = "TIDINGS_CLUSTER_SELF")]
    pub cluster_self: Option<String>,

    /// Address for inter-node traffic; defaults to this node's configured address
    #[arg(long, env = "TIDINGS_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Prometheus listener address
    #[arg(long, env = "TIDINGS_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,
}

impl Cli {
    /// Load the configuration file, if any, and apply command line overrides
    pub fn load_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(name) = &self.cluster_self {
            config.cluster.this_name = name.clone();
        }
        if self.metrics_addr.is_some() {
            config.metrics_addr = self.metrics_addr;
        }
        config.validate()?;
        Ok(config)
    }

    /// Address to accept peer connections on; a standalone node has none
    /// unless one is given explicitly
    pub fn listen_addr(&self, config: &ServerConfig) -> Result<Option<SocketAddr>> {
        if let Some(addr) = self.listen {
            return Ok(Some(addr));
        }
        if !config.cluster.is_cluster() {
            return Ok(None);
        }
        config
            .cluster
            .this_addr()
            .map(|addr| {
                addr.parse()
                    .map_err(|e| Error::Config(format!("invalid address '{}' for this node: {}", addr, e)))
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let cli = Cli::parse_from(["tidingsd"]);
        let config = cli.load_config().unwrap();
        assert!(!config.cluster.is_cluster());
        assert_eq!(cli.listen_addr(&config).unwrap(), None);
    }

    #[test]
    fn test_cluster_self_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
cluster:
  self: one
  nodes:
    - name: one
      addr: "127.0.0.1:12001"
    - name: two
      addr: "127.0.0.1:12002"
"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let cli = Cli::parse_from(["tidingsd", "--config", &path, "--cluster-self", "two"]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.cluster.this_name, "two");
        assert_eq!(
            cli.listen_addr(&config).unwrap(),
            Some("127.0.0.1:12002".parse().unwrap())
        );
    }

    #[test]
    fn test_unknown_self_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
cluster:
  self: one
  nodes:
    - name: one
      addr: "127.0.0.1:12001"
"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let cli = Cli::parse_from(["tidingsd", "--config", &path, "--cluster-self", "three"]);
        assert!(matches!(cli.load_config(), Err(Error::Config(_))));
    }
}
