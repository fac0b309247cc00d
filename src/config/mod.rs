//! Declarative rule configuration.
//!
//! A configuration file holds a version string and a list of egress rules.
//! Both YAML and JSON are accepted; the format is picked from the file
//! extension, and files without a known extension are tried as YAML first.
//!
//! ```yaml
//! version: "1.0"
//! rules:
//!   - name: block-metadata
//!     action: deny
//!     order: 50
//!     egress:
//!       ips: ["169.254.169.254"]
//!   - name: allow-github
//!     action: allow
//!     order: 100
//!     egress:
//!       domains: ["github.com"]
//!       protocols: [tcp]
//!       ports: ["443"]
//! ```

mod settings;

pub use settings::Settings;

use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::{Action, Protocol};

/// A validated, priority-sorted rule configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Configuration version, must be non-empty
    #[serde(default)]
    pub version: String,
    /// Rules in ascending `order`
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// A single egress rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub action: Action,
    /// Lower values are evaluated first
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub egress: Egress,
}

/// Egress match criteria. An empty list matches anything on that field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Egress {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protocols: Vec<Protocol>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,
    /// IPv4 addresses or CIDR ranges
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,
    /// Single ports (`443`) or inclusive ranges (`8000-9000`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
}

/// Serialization format of a configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    /// Detect the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "yaml" | "yml" => Some(ConfigFormat::Yaml),
            "json" => Some(ConfigFormat::Json),
            _ => None,
        }
    }
}

impl Config {
    /// Read, parse, validate and sort a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        Self::parse(&content, ConfigFormat::from_path(path))
    }

    /// Parse, validate and sort configuration content.
    ///
    /// With no format given, YAML is tried first and JSON second.
    pub fn parse(content: &str, format: Option<ConfigFormat>) -> Result<Self> {
        let mut config: Config = match format {
            Some(ConfigFormat::Yaml) => serde_yaml::from_str(content)?,
            Some(ConfigFormat::Json) => serde_json::from_str(content)?,
            None => match serde_yaml::from_str(content) {
                Ok(config) => config,
                Err(yaml_err) => serde_json::from_str(content).map_err(|_| yaml_err)?,
            },
        };

        config.validate()?;
        config.sort();
        Ok(config)
    }

    /// Check the structural invariants of the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(Error::Config("version is required".to_string()));
        }

        if self.rules.is_empty() {
            return Err(Error::Config("at least one rule is required".to_string()));
        }

        let mut names = AHashSet::new();
        for (i, rule) in self.rules.iter().enumerate() {
            if rule.name.trim().is_empty() {
                return Err(Error::Config(format!("rule {}: name is required", i)));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(Error::Config(format!(
                    "rule {} ({}): duplicate rule name",
                    i, rule.name
                )));
            }
        }

        Ok(())
    }

    /// Sort rules by ascending order. Rules sharing an order keep their input order.
    pub fn sort(&mut self) {
        self.rules.sort_by_key(|rule| rule.order);
    }
}

impl Rule {
    /// Create a rule with empty egress criteria.
    pub fn new(name: impl Into<String>, action: Action, order: i64) -> Self {
        Self {
            name: name.into(),
            action,
            order,
            egress: Egress::default(),
        }
    }

    pub fn with_protocols(mut self, protocols: &[Protocol]) -> Self {
        self.egress.protocols = protocols.to_vec();
        self
    }

    pub fn with_domains(mut self, domains: &[&str]) -> Self {
        self.egress.domains = domains.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_ips(mut self, ips: &[&str]) -> Self {
        self.egress.ips = ips.iter().map(|ip| ip.to_string()).collect();
        self
    }

    pub fn with_ports(mut self, ports: &[&str]) -> Self {
        self.egress.ports = ports.iter().map(|p| p.to_string()).collect();
        self
    }
}
