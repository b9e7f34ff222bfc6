use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigInputDelivery {
    #[default]
    StdIn,
    File {
        template: String,
    },
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExecutorSettings {
    pub command: Vec<String>,
    #[serde(default)]
    pub input_delivery: ConfigInputDelivery,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub working_dir: Option<PathBuf>,
}

pub fn default_timeout_ms() -> u64 {
    1000
}

/// Knobs forwarded to the runtime inside the target through its environment.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RuntimeSettings {
    pub inst_ratio: Option<u32>,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ShowmapConfig {
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub runtime: RuntimeSettings,
}

impl ShowmapConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: ShowmapConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        config.validate()?;
        Ok(config)
    }

    /// A config that runs `command` with every other setting at its default.
    pub fn for_command(command: Vec<String>) -> Self {
        Self {
            executor: ExecutorSettings {
                command,
                timeout_ms: default_timeout_ms(),
                ..Default::default()
            },
            runtime: RuntimeSettings::default(),
        }
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.executor.command.is_empty() {
            anyhow::bail!("No target command configured");
        }
        if let Some(ratio) = self.runtime.inst_ratio {
            if !(1..=100).contains(&ratio) {
                anyhow::bail!("inst-ratio must be within 1-100, got {ratio}");
            }
        }
        if self.executor.timeout_ms == 0 {
            anyhow::bail!("timeout-ms must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn parses_full_config() {
        let file = write_config(
            r#"
            [executor]
            command = ["./target", "--flag"]
            input-delivery = { file = { template = "--input={}" } }
            timeout-ms = 250
            working-dir = "/tmp"

            [runtime]
            inst-ratio = 30
            persistent = true
            extra-env = { ASAN_OPTIONS = "abort_on_error=1" }
            "#,
        );
        let config = ShowmapConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.executor.command, vec!["./target", "--flag"]);
        assert_eq!(
            config.executor.input_delivery,
            ConfigInputDelivery::File {
                template: "--input={}".to_string()
            }
        );
        assert_eq!(config.executor.timeout_ms, 250);
        assert_eq!(config.runtime.inst_ratio, Some(30));
        assert!(config.runtime.persistent);
        assert_eq!(
            config.runtime.extra_env.get("ASAN_OPTIONS").map(String::as_str),
            Some("abort_on_error=1")
        );
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let file = write_config("[executor]\ncommand = [\"./t\"]\n");
        let config = ShowmapConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.executor.input_delivery, ConfigInputDelivery::StdIn);
        assert_eq!(config.executor.timeout_ms, default_timeout_ms());
        assert!(!config.runtime.persistent);
        assert!(config.runtime.extra_env.is_empty());
    }

    #[test]
    fn rejects_unknown_fields_and_bad_values() {
        let unknown = write_config("[executor]\ncommand = [\"./t\"]\nbogus = 1\n");
        assert!(ShowmapConfig::load_from_file(unknown.path()).is_err());

        let ratio = write_config("[executor]\ncommand = [\"./t\"]\n[runtime]\ninst-ratio = 0\n");
        let err = ShowmapConfig::load_from_file(ratio.path()).unwrap_err();
        assert!(err.to_string().contains("inst-ratio"), "got: {err}");

        let empty = write_config("[executor]\ncommand = []\n");
        assert!(ShowmapConfig::load_from_file(empty.path()).is_err());
    }
}
