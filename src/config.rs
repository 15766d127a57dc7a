use crate::error::{FlowError, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Runtime settings for compilation and execution.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Directory of persisted kernels. `None` keeps kernels in memory only.
    pub cache_dir: Option<PathBuf>,
    /// Record whether each `compile` call had to generate a kernel.
    pub track_compilation: bool,
    /// Split the row loop across the rayon pool.
    pub parallel: bool,
    /// Rows per parallel task; smaller batches run on the calling thread.
    pub min_rows_per_task: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            track_compilation: false,
            parallel: true,
            min_rows_per_task: 4096,
        }
    }
}

impl FlowConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(text).map_err(|e| FlowError::Compile {
            index: None,
            expr: String::new(),
            msg: format!("invalid configuration: {}", e),
        })?;
        cfg.validated()
    }

    /// Reads `SHARROW_CACHE_DIR`, `SHARROW_TRACK_COMPILATION`, `SHARROW_PARALLEL` and
    /// `SHARROW_MIN_ROWS_PER_TASK`; unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(dir) = get("SHARROW_CACHE_DIR").filter(|d| !d.is_empty()) {
            cfg.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(v) = get("SHARROW_TRACK_COMPILATION") {
            cfg.track_compilation = parse_flag("SHARROW_TRACK_COMPILATION", &v)?;
        }
        if let Some(v) = get("SHARROW_PARALLEL") {
            cfg.parallel = parse_flag("SHARROW_PARALLEL", &v)?;
        }
        if let Some(v) = get("SHARROW_MIN_ROWS_PER_TASK") {
            cfg.min_rows_per_task =
                v.trim().parse().map_err(|_| invalid("SHARROW_MIN_ROWS_PER_TASK", &v))?;
        }
        cfg.validated()
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn with_tracking(mut self, on: bool) -> Self {
        self.track_compilation = on;
        self
    }

    pub fn with_parallel(mut self, on: bool) -> Self {
        self.parallel = on;
        self
    }

    fn validated(self) -> Result<Self> {
        if self.min_rows_per_task == 0 {
            return Err(invalid("min_rows_per_task", "0"));
        }
        Ok(self)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn invalid(key: &str, value: &str) -> FlowError {
    FlowError::Compile {
        index: None,
        expr: String::new(),
        msg: format!("invalid configuration {}={:?}", key, value),
    }
}
