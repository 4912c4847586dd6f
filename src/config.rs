use std::{io, path::PathBuf};

use eyre::Result;
use serde::{Deserialize, Serialize};
use tokio::fs;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sensor: SensorConfig,
    pub fans: FanConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub url: String,
    pub building_id: String,
    pub cache_secs: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FanConfig {
    /// Fixed pool of BCM pin numbers available for fan relays.
    pub pins: Vec<u8>,
    /// Relay boards that energize on a low output level.
    pub active_low: bool,
    pub cycle_secs: u64,
    pub co2_threshold: u32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub assignments: PathBuf,
    pub runtime_log: PathBuf,
}

impl Config {
    pub async fn load(path: &str) -> Result<Config> {
        let data = match fs::read(path).await {
            Ok(data) => data,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path, "No configuration file found, using defaults");
                return Ok(Config::default());
            }
            Err(error) => return Err(error.into()),
        };

        Ok(serde_yaml::from_slice(&data)?)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig { port: 5002 }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        SensorConfig {
            url: "https://co2.mesh.lv/api/device/list".to_owned(),
            building_id: "512".to_owned(),
            cache_secs: 10,
            timeout_secs: 5,
        }
    }
}

impl Default for FanConfig {
    fn default() -> Self {
        FanConfig {
            pins: vec![17, 18, 23, 24, 25],
            active_low: true,
            cycle_secs: 10,
            co2_threshold: 1000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            assignments: PathBuf::from("fan_assignments.csv"),
            runtime_log: PathBuf::from("fan_runtime_log.csv"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config() {
        let config: Config = serde_yaml::from_str(
            "server:\n  port: 8080\nfans:\n  pins: [23, 24, 25]\n",
        )
        .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.fans.pins, vec![23, 24, 25]);
        assert_eq!(config.fans.co2_threshold, 1000);
        assert_eq!(config.sensor.building_id, "512");
    }
}
