//! Service configuration.
//!
//! Settings come from an optional TOML file plus the environment. The
//! deployment-level variables `MODULE_NAME`, `CONFIGURATION_HOST` and
//! `REST_PORT` are honored directly; everything else can be set with a
//! `SPYGLASS_`-prefixed variable (e.g. `SPYGLASS_HIJACK_OUTDATED_SECS`).

use anyhow::{anyhow, Result};
use config::Config;
use std::collections::HashMap;
use std::path::Path;

const EMPTY_CONFIG: &str = r#"### spyglass configuration file

### service identity used in logs and command routing
# module_name = "pipeline"

### configuration service queried once on startup
# configuration_host = "configuration"

### HTTP control plane bind address and port
# host = "0.0.0.0"
# rest_port = 3000

### seconds without observation before an open hijack event is outdated
# hijack_outdated_secs = 3600
"#;

/// Runtime settings of one pipeline service instance.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Service identity, used in logs and configuration error messages.
    pub module_name: String,

    /// Host of the configuration service to pull from on startup.
    pub configuration_host: String,

    /// Control plane bind address.
    pub host: String,

    /// Control plane port.
    pub rest_port: u16,

    /// Horizon after which unobserved open hijack events become outdated.
    pub hijack_outdated_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            module_name: "pipeline".to_string(),
            configuration_host: "configuration".to_string(),
            host: "0.0.0.0".to_string(),
            rest_port: 3000,
            hijack_outdated_secs: 3600,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a TOML file (created with a commented
    /// template when missing) and the environment.
    pub fn new(path: &Option<String>) -> Result<ServiceConfig> {
        let mut builder = Config::builder();

        match path {
            Some(p) => {
                let path = Path::new(p.as_str());
                if path.exists() {
                    let path_str = path
                        .to_str()
                        .ok_or_else(|| anyhow!("Could not convert path to string"))?;
                    builder = builder.add_source(config::File::with_name(path_str));
                } else {
                    std::fs::write(p.as_str(), EMPTY_CONFIG)
                        .map_err(|e| anyhow!("Unable to create config file: {}", e))?;
                }
            }
            None => {
                let home_dir = dirs::home_dir()
                    .ok_or_else(|| anyhow!("Could not find home directory"))?;
                let home_str = home_dir
                    .to_str()
                    .ok_or_else(|| anyhow!("Could not convert home directory path to string"))?;
                let spyglass_dir = format!("{}/.spyglass", home_str);
                std::fs::create_dir_all(spyglass_dir.as_str())
                    .map_err(|e| anyhow!("Unable to create spyglass directory: {}", e))?;
                let p = format!("{}/spyglass.toml", spyglass_dir.as_str());
                if Path::new(p.as_str()).exists() {
                    builder = builder.add_source(config::File::with_name(p.as_str()));
                } else {
                    std::fs::write(p.as_str(), EMPTY_CONFIG).map_err(|e| {
                        anyhow!("Unable to create config file {}: {}", p.as_str(), e)
                    })?;
                }
            }
        }

        // settings from the environment, e.g. SPYGLASS_REST_PORT=3001
        builder = builder.add_source(config::Environment::with_prefix("SPYGLASS"));

        let settings = builder
            .build()
            .map_err(|e| anyhow!("Failed to build configuration: {}", e))?;
        let mut values = settings
            .try_deserialize::<HashMap<String, String>>()
            .map_err(|e| anyhow!("Failed to deserialize configuration: {}", e))?;

        // deployment-level variables win over file and prefixed settings
        for (env, key) in [
            ("MODULE_NAME", "module_name"),
            ("CONFIGURATION_HOST", "configuration_host"),
            ("REST_PORT", "rest_port"),
        ] {
            if let Ok(value) = std::env::var(env) {
                values.insert(key.to_string(), value);
            }
        }

        let defaults = ServiceConfig::default();
        let rest_port = match values.get("rest_port") {
            Some(value) => value
                .parse::<u16>()
                .map_err(|_| anyhow!("Invalid rest_port '{}'", value))?,
            None => defaults.rest_port,
        };
        let hijack_outdated_secs = match values.get("hijack_outdated_secs") {
            Some(value) => value
                .parse::<u64>()
                .map_err(|_| anyhow!("Invalid hijack_outdated_secs '{}'", value))?,
            None => defaults.hijack_outdated_secs,
        };

        Ok(ServiceConfig {
            module_name: values
                .remove("module_name")
                .unwrap_or(defaults.module_name),
            configuration_host: values
                .remove("configuration_host")
                .unwrap_or(defaults.configuration_host),
            host: values.remove("host").unwrap_or(defaults.host),
            rest_port,
            hijack_outdated_secs,
        })
    }

    /// Control plane bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.rest_port)
    }

    /// URL of the configuration service's config endpoint.
    pub fn configuration_url(&self) -> String {
        format!(
            "http://{}:{}/config",
            self.configuration_host, self.rest_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.module_name, "pipeline");
        assert_eq!(config.rest_port, 3000);
        assert_eq!(config.bind_address(), "0.0.0.0:3000");
        assert_eq!(
            config.configuration_url(),
            "http://configuration:3000/config"
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(file, "module_name = \"edge\"").unwrap();
        writeln!(file, "rest_port = 3100").unwrap();
        file.flush().unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = ServiceConfig::new(&Some(path)).unwrap();
        assert_eq!(config.module_name, "edge");
        assert_eq!(config.rest_port, 3100);
        // untouched fields keep their defaults
        assert_eq!(config.configuration_host, "configuration");
    }

    #[test]
    fn test_missing_file_is_created_with_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir
            .path()
            .join("spyglass.toml")
            .to_str()
            .unwrap()
            .to_string();
        let config = ServiceConfig::new(&Some(path.clone())).unwrap();
        assert_eq!(config.rest_port, 3000);
        assert!(std::fs::read_to_string(path)
            .unwrap()
            .contains("spyglass configuration file"));
    }
}
