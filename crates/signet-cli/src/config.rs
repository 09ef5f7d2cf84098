use anyhow::{bail, Context, Result};
use serde::Deserialize;
use signet_core::pairs::{DEFAULT_FORGED_SUFFIX, DEFAULT_PAIR_SEED};
use signet_core::DEFAULT_THRESHOLD;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Shape of the configured signature model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Two inputs, one similarity output.
    Pair,
    /// One input, one embedding vector output.
    Embedding,
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pair" => Ok(ModelKind::Pair),
            "embedding" => Ok(ModelKind::Embedding),
            other => Err(format!("unknown model kind '{other}'")),
        }
    }
}

/// CLI configuration: defaults, then TOML file, then `SIGNET_*` environment.
/// Command-line flags are applied on top by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Path to the SQLite gallery database.
    pub db_path: PathBuf,
    /// ONNX signature model used by `verify`.
    pub model_path: Option<PathBuf>,
    pub model_kind: ModelKind,
    /// Scores strictly above this are accepted.
    pub similarity_threshold: f32,
    /// Wall-clock budget for one verification; 0 disables it.
    pub verify_timeout_secs: u64,
    /// Retry a transient scorer failure once.
    pub retry_transient: bool,
    pub forged_suffix: String,
    pub pair_seed: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    db_path: Option<PathBuf>,
    model_path: Option<PathBuf>,
    model_kind: Option<ModelKind>,
    similarity_threshold: Option<f32>,
    verify_timeout_secs: Option<u64>,
    retry_transient: Option<bool>,
    forged_suffix: Option<String>,
    pair_seed: Option<u64>,
}

impl Config {
    /// Built-in defaults, with the database under the XDG data directory.
    fn defaults(env: &dyn Fn(&str) -> Option<String>) -> Self {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("signet");

        Self {
            db_path: data_dir.join("signatures.db"),
            model_path: None,
            model_kind: ModelKind::Pair,
            similarity_threshold: DEFAULT_THRESHOLD,
            verify_timeout_secs: 0,
            retry_transient: false,
            forged_suffix: DEFAULT_FORGED_SUFFIX.to_string(),
            pair_seed: DEFAULT_PAIR_SEED,
        }
    }

    /// Load from the process environment. `config_path` wins over `SIGNET_CONFIG`.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        Self::load_with(config_path, &|key: &str| std::env::var(key).ok())
    }

    fn load_with(config_path: Option<&Path>, env: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::defaults(env);

        let file_path = config_path
            .map(Path::to_path_buf)
            .or_else(|| env("SIGNET_CONFIG").map(PathBuf::from));
        if let Some(path) = file_path {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            let file: ConfigFile = toml::from_str(&contents)
                .with_context(|| format!("failed to parse config file {}", path.display()))?;
            config.apply_file(file);
            tracing::debug!(path = %path.display(), "loaded config file");
        }

        config.apply_env(env);
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(v) = file.db_path {
            self.db_path = v;
        }
        if let Some(v) = file.model_path {
            self.model_path = Some(v);
        }
        if let Some(v) = file.model_kind {
            self.model_kind = v;
        }
        if let Some(v) = file.similarity_threshold {
            self.similarity_threshold = v;
        }
        if let Some(v) = file.verify_timeout_secs {
            self.verify_timeout_secs = v;
        }
        if let Some(v) = file.retry_transient {
            self.retry_transient = v;
        }
        if let Some(v) = file.forged_suffix {
            self.forged_suffix = v;
        }
        if let Some(v) = file.pair_seed {
            self.pair_seed = v;
        }
    }

    fn apply_env(&mut self, env: &dyn Fn(&str) -> Option<String>) {
        if let Some(v) = env("SIGNET_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = env("SIGNET_MODEL_PATH") {
            self.model_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env("SIGNET_FORGED_SUFFIX") {
            self.forged_suffix = v;
        }
        self.model_kind = env_parse(env, "SIGNET_MODEL_KIND", self.model_kind);
        self.similarity_threshold =
            env_parse(env, "SIGNET_SIMILARITY_THRESHOLD", self.similarity_threshold);
        self.verify_timeout_secs =
            env_parse(env, "SIGNET_VERIFY_TIMEOUT_SECS", self.verify_timeout_secs);
        self.pair_seed = env_parse(env, "SIGNET_PAIR_SEED", self.pair_seed);
        self.retry_transient = env("SIGNET_RETRY_TRANSIENT")
            .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
            .unwrap_or(self.retry_transient);
    }

    fn validate(&self) -> Result<()> {
        let t = self.similarity_threshold;
        if !t.is_finite() || !(0.0..=1.0).contains(&t) {
            bail!("similarity_threshold {t} is outside [0, 1]");
        }
        if self.forged_suffix.is_empty() {
            bail!("forged_suffix must not be empty");
        }
        Ok(())
    }

    pub fn verify_timeout(&self) -> Option<Duration> {
        (self.verify_timeout_secs > 0).then(|| Duration::from_secs(self.verify_timeout_secs))
    }
}

fn env_parse<T: FromStr>(env: &dyn Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    env(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::tempdir;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_use_xdg_data_home() {
        let config = Config::load_with(None, &env_from(&[("XDG_DATA_HOME", "/data")])).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/data/signet/signatures.db"));
        assert_eq!(config.model_kind, ModelKind::Pair);
        assert!((config.similarity_threshold - 0.5).abs() < f32::EPSILON);
        assert_eq!(config.forged_suffix, "_forged");
        assert_eq!(config.pair_seed, 42);
        assert!(config.verify_timeout().is_none());
    }

    #[test]
    fn test_defaults_fall_back_to_home() {
        let config = Config::load_with(None, &env_from(&[("HOME", "/home/ann")])).unwrap();
        assert_eq!(
            config.db_path,
            PathBuf::from("/home/ann/.local/share/signet/signatures.db")
        );
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("signet.toml");
        fs::write(
            &path,
            "similarity_threshold = 0.7\nmodel_kind = \"embedding\"\nverify_timeout_secs = 5\n",
        )
        .unwrap();

        let config = Config::load_with(Some(&path), &env_from(&[])).unwrap();
        assert!((config.similarity_threshold - 0.7).abs() < 1e-6);
        assert_eq!(config.model_kind, ModelKind::Embedding);
        assert_eq!(config.verify_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("signet.toml");
        fs::write(&path, "pair_seed = 7\ndb_path = \"/srv/file.db\"\n").unwrap();

        let env = env_from(&[
            ("SIGNET_CONFIG", path.to_str().unwrap()),
            ("SIGNET_PAIR_SEED", "99"),
            ("SIGNET_RETRY_TRANSIENT", "1"),
        ]);
        let config = Config::load_with(None, &env).unwrap();
        assert_eq!(config.pair_seed, 99);
        assert_eq!(config.db_path, PathBuf::from("/srv/file.db"));
        assert!(config.retry_transient);
    }

    #[test]
    fn test_unparsable_env_keeps_lower_layer() {
        let env = env_from(&[
            ("SIGNET_SIMILARITY_THRESHOLD", "high"),
            ("SIGNET_MODEL_KIND", "mystery"),
        ]);
        let config = Config::load_with(None, &env).unwrap();
        assert!((config.similarity_threshold - 0.5).abs() < f32::EPSILON);
        assert_eq!(config.model_kind, ModelKind::Pair);
    }

    #[test]
    fn test_unknown_key_in_file_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("signet.toml");
        fs::write(&path, "treshold = 0.5\n").unwrap();
        let err = Config::load_with(Some(&path), &env_from(&[])).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse config file"));
    }

    #[test]
    fn test_out_of_range_threshold_is_error() {
        let env = env_from(&[("SIGNET_SIMILARITY_THRESHOLD", "1.5")]);
        assert!(Config::load_with(None, &env).is_err());
    }

    #[test]
    fn test_missing_config_file_is_error() {
        let err = Config::load_with(Some(Path::new("/nonexistent/signet.toml")), &env_from(&[]))
            .unwrap_err();
        assert!(format!("{err:#}").contains("failed to read config file"));
    }
}
