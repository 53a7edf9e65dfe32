use super::toml::ConfigToml;
use anyhow::{Context as _, bail};
use config::{ConfigBuilder, Environment, File, FileFormat, builder::AsyncState};
use std::path::{Path, PathBuf};
use tracing::info;

pub(crate) const DEFAULT_CONFIG_FILE: &str = "spindle.toml";
const ENV_PREFIX: &str = "spindle";

/// Locates the configuration file and (re)loads it on demand.
#[derive(Debug, Clone)]
pub(crate) struct ConfigHolder {
    spindle_toml: PathBuf,
    /// Relative function directories are resolved against this one.
    toml_dir: PathBuf,
}

impl ConfigHolder {
    pub(crate) fn new(config: Option<PathBuf>) -> Result<Self, anyhow::Error> {
        let spindle_toml = if let Some(config) = config {
            config
        } else {
            let local = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !local.try_exists().unwrap_or_default() {
                bail!("cannot find `{DEFAULT_CONFIG_FILE}` in current directory");
            }
            info!("Using configuration file {local:?}");
            local
        };
        let toml_dir = spindle_toml
            .canonicalize()
            .with_context(|| format!("cannot canonicalize {spindle_toml:?}"))?
            .parent()
            .with_context(|| format!("error getting parent path of {spindle_toml:?}"))?
            .to_path_buf();
        Ok(Self {
            spindle_toml,
            toml_dir,
        })
    }

    pub(crate) fn toml_dir(&self) -> &Path {
        &self.toml_dir
    }

    pub(crate) async fn load_config(&self) -> Result<ConfigToml, anyhow::Error> {
        let settings = ConfigBuilder::<AsyncState>::default()
            .add_source(
                File::from(self.spindle_toml.as_path())
                    .required(true)
                    .format(FileFormat::Toml),
            )
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .await
            .with_context(|| format!("cannot read {:?}", self.spindle_toml))?;
        settings
            .try_deserialize()
            .with_context(|| format!("cannot parse {:?}", self.spindle_toml))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_from_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            r#"
[scheduler]
pool_size = 7

[[function]]
id = "fn1"
cwd = "fn1"

[function.triggers.on_ready]
type = "system"
name = "READY"
"#,
        )
        .unwrap();
        let holder = ConfigHolder::new(Some(path)).unwrap();
        assert_eq!(dir.path().canonicalize().unwrap(), holder.toml_dir());
        let config = holder.load_config().await.unwrap();
        assert_eq!(7, config.scheduler.pool_size);
        assert_eq!(1, config.functions.len());
        assert!(config.functions[0].triggers.contains_key("on_ready"));
    }

    #[tokio::test]
    async fn invalid_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spindle.toml");
        std::fs::write(&path, "[unknown]\nkey = 1\n").unwrap();
        let err = ConfigHolder::new(Some(path))
            .unwrap()
            .load_config()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot parse"), "{err:?}");
    }

    #[test]
    fn missing_file_is_an_error() {
        ConfigHolder::new(Some(PathBuf::from("/nonexistent/spindle.toml"))).unwrap_err();
    }
}
