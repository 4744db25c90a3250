use anyhow::{anyhow, Context, Result};
use std::path::Path;
use tracing::info;

use super::runtime::EngineConfig;

/// Environment variables with this prefix override file values,
/// e.g. `RDC_HMM__EM_RESTARTS=8`.
pub const ENV_PREFIX: &str = "RDC";

impl EngineConfig {
    /// Load from a TOML file (missing keys fall back to defaults), apply
    /// environment overrides, then validate.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: EngineConfig = settings
            .try_deserialize()
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        config.validate().map_err(|errors| anyhow!(errors.join(", ")))?;

        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load `path` if given, otherwise start from defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[dc]\ntheta = 0.002\nwindow = 30\n\n[hmm]\nem_restarts = 2").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.dc.theta, 0.002);
        assert_eq!(config.dc.window, 30);
        assert_eq!(config.hmm.em_restarts, 2);
        assert_eq!(config.hmm.num_states, 3);
        assert_eq!(config.signal.danger_threshold, 0.65);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[signal]\nsell_state_threshold = 0.9").unwrap();

        let err = EngineConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("sell_state_threshold"));
    }

    #[test]
    fn test_default_toml_loads_back() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(file, "{}", EngineConfig::default().to_toml().unwrap()).unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_load_or_default_without_path() {
        assert_eq!(EngineConfig::load_or_default(None).unwrap(), EngineConfig::default());
    }
}
