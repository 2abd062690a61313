use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// 指向配置文件的环境变量。
pub const CONFIG_ENV_VAR: &str = "SLIDEMARK_CONFIG";

/// 应用配置的根结构。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub editing: EditingConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl AppConfig {
    /// 从显式路径加载配置。
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// 自动发现配置文件：优先读取环境变量 `SLIDEMARK_CONFIG`，否则寻找 `./config/default.toml`。
    /// 若文件缺失，则返回默认配置。
    pub fn discover() -> Result<Self, ConfigError> {
        if let Some(path) = env::var_os(CONFIG_ENV_VAR) {
            return Self::from_file(PathBuf::from(path));
        }

        let default_path = env::current_dir()
            .map(|dir| dir.join("config").join("default.toml"))
            .map_err(|source| ConfigError::Context {
                message: "获取当前工作目录失败".to_string(),
                source,
            })?;

        if default_path.exists() {
            Self::from_file(default_path)
        } else {
            Ok(Self::default())
        }
    }
}

/// 日志配置，支持设置默认等级。
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

/// 编辑交互参数，距离均为世界坐标单位（微米）。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EditingConfig {
    /// 手绘两次采样之间的最小距离。
    pub freeform_spacing: f64,
    /// 手绘闭合距离，也用作拾取坐标的容差。
    pub hover_tolerance: f64,
    pub selection_bias: f64,
    pub bounds_tolerance: f64,
    pub split_enabled: bool,
}

impl Default for EditingConfig {
    fn default() -> Self {
        Self {
            freeform_spacing: 5.0,
            hover_tolerance: 8.0,
            selection_bias: 4.0,
            bounds_tolerance: 10.0,
            split_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub autosave_interval_secs: u64,
    /// 最后一次修改后需要空闲多久才允许自动保存。
    pub autosave_idle_secs: u64,
    /// 首次覆盖源文件前备份为 `<name>.orig`。
    pub create_backup: bool,
    /// 未通过命令行指定时使用的 mpp。
    pub default_mpp: [f64; 2],
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            autosave_interval_secs: 60,
            autosave_idle_secs: 2,
            create_backup: true,
            default_mpp: [0.25, 0.25],
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件 {path:?} 失败: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("解析配置文件 {path:?} 失败: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{message}")]
    Context {
        message: String,
        #[source]
        source: std::io::Error,
    },
}
