use rollcall_core::index::DEFAULT_SIMILARITY_THRESHOLD;
use rollcall_core::ModelPaths;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Which D-Bus bus the service registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(Self::Session),
            "system" => Ok(Self::System),
            other => Err(format!("expected \"session\" or \"system\", got {other:?}")),
        }
    }
}

/// Optional TOML file; every key may be overridden from the environment.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    similarity_threshold: Option<f32>,
    detection_threshold: Option<f32>,
    engine_queue: Option<usize>,
    bus: Option<BusKind>,
}

/// Daemon configuration, validated once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Minimum cosine similarity for a face to count as a registered student.
    pub similarity_threshold: f32,
    /// Minimum SCRFD score for a detection to count as a face.
    pub detection_threshold: f32,
    /// Capacity of the inference request queue.
    pub engine_queue: usize,
    pub bus: BusKind,
}

impl Config {
    /// Load from `$ROLLCALL_CONFIG` (if set) overlaid with `ROLLCALL_*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var_os("ROLLCALL_CONFIG") {
            Some(path) => Some(read_file(Path::new(&path))?),
            None => None,
        };
        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    fn from_sources(
        file: Option<FileConfig>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let file = file.unwrap_or_default();

        let model_dir = env("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(rollcall_core::default_model_dir);

        let db_path = env("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| default_data_dir(&env).join("attendance.db"));

        let similarity_threshold = parse_env(&env, "ROLLCALL_SIMILARITY_THRESHOLD")?
            .or(file.similarity_threshold)
            .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD);
        let detection_threshold = parse_env(&env, "ROLLCALL_DETECTION_THRESHOLD")?
            .or(file.detection_threshold)
            .unwrap_or(rollcall_core::detector::DEFAULT_CONFIDENCE_THRESHOLD);
        let engine_queue = parse_env(&env, "ROLLCALL_ENGINE_QUEUE")?
            .or(file.engine_queue)
            .unwrap_or(4);
        let bus = parse_env(&env, "ROLLCALL_BUS")?
            .or(file.bus)
            .unwrap_or(BusKind::Session);

        unit_interval("similarity_threshold", similarity_threshold)?;
        unit_interval("detection_threshold", detection_threshold)?;
        if engine_queue == 0 {
            return Err(ConfigError::Invalid {
                key: "engine_queue",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        Ok(Self {
            model_dir,
            db_path,
            similarity_threshold,
            detection_threshold,
            engine_queue,
            bus,
        })
    }

    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths {
            detector: self.scrfd_model_path(),
            recognizer: self.arcface_model_path(),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn parse_env<T>(env: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env(key) {
        None => Ok(None),
        Some(value) => value.trim().parse().map(Some).map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}

fn unit_interval(key: &'static str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must lie in [0, 1]".into(),
        })
    }
}
