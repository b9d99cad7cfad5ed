//! Console configuration

use std::fs;
use std::path::{Path, PathBuf};
use anyhow::Context;
use serde::Deserialize;
use crate::upload::{UploadPolicy, UploadTimings};

/// 配置文件路径的环境变量
pub const CONFIG_PATH_ENV: &str = "UPLOADER_CONFIG";

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// Backend base url, e.g. `http://localhost:3000`
    pub endpoint: String,
    #[serde(default)]
    pub token: String,
    /// 启动时加入队列的文件
    #[serde(default)]
    pub files: Vec<PathBuf>,
    #[serde(default)]
    pub policy: UploadPolicy,
    #[serde(default)]
    pub timings: UploadTimings,
}

impl Config {
    pub fn load_config(path: &Path) -> anyhow::Result<Config> {
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Can't read config file {:?}", path))?;
        Self::from_toml(&config_str)
            .with_context(|| format!("Can't load config file {:?}", path))
    }

    pub fn from_toml(config_str: &str) -> anyhow::Result<Config> {
        let config: Config = toml::from_str(config_str)?;
        if !config.endpoint.starts_with("http") {
            anyhow::bail!("endpoint must be an http(s) url, got '{}'", config.endpoint);
        }
        if let Err(reason) = config.timings.validate() {
            anyhow::bail!("invalid [timings]: {}", reason);
        }
        Ok(config)
    }
}

/// `$UPLOADER_CONFIG`, falling back to `config.toml`
pub fn config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"))
}
