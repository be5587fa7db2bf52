use serde::Deserialize;
use std::{fs, path::Path};

use crate::core::error::ConfigError;
use crate::core::flow::Watermarks;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Directory the RPC server writes received files under.
    pub store_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5005".to_string(),
            store_dir: "./received".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    /// Watermarks between a source and its first queue.
    pub source_high: usize,
    pub source_low: usize,
    /// Watermarks between two queues.
    pub stage_high: usize,
    pub stage_low: usize,
    pub chunk_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_high: 10,
            source_low: 5,
            stage_high: 5,
            stage_low: 3,
            chunk_size: 64 * 1024,
        }
    }
}

impl PipelineConfig {
    pub fn source_watermarks(&self) -> Result<Watermarks, ConfigError> {
        Watermarks::new(self.source_high, self.source_low)
    }

    pub fn stage_watermarks(&self) -> Result<Watermarks, ConfigError> {
        Watermarks::new(self.stage_high, self.stage_low)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TransportConfig {
    /// Bounds on concurrently outstanding requests.
    pub inflight_high: usize,
    pub inflight_low: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            inflight_high: 20,
            inflight_low: 10,
        }
    }
}

impl TransportConfig {
    pub fn watermarks(&self) -> Result<Watermarks, ConfigError> {
        Watermarks::new(self.inflight_high, self.inflight_low)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub pipeline: PipelineConfig,
    pub transport: TransportConfig,
}

impl Config {
    /// Checks every watermark pair and the chunk size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pipeline.source_watermarks()?;
        self.pipeline.stage_watermarks()?;
        self.transport.watermarks()?;
        if self.pipeline.chunk_size == 0 {
            return Err(ConfigError::InvalidChunkSize(0));
        }
        Ok(())
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, anyhow::Error> {
    let raw: String = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&raw)?;
    config.validate()?;
    Ok(config)
}
