use std::time::Duration;

use async_trait::async_trait;
use eyre::{Result, bail};
use serde::Deserialize;
use tokio::{sync::Mutex, time::Instant};

use crate::config::SensorConfig;

/// One room as reported by the CO2 sensor mesh. Rooms without a reading
/// default to 0 ppm.
#[derive(Clone, Debug, Deserialize)]
pub struct RoomReading {
    #[serde(rename = "roomGroupName")]
    pub room: String,
    #[serde(default)]
    pub co2: u32,
}

#[async_trait]
pub trait SensorFeed: Send + Sync {
    async fn fetch(&self) -> Result<Vec<RoomReading>>;
}

/* == Upstream client == */

/// Client for the mesh.lv device-list endpoint. Carries a request timeout
/// so a hung upstream cannot stall the automation loop.
pub struct MeshFeed {
    client: reqwest::Client,
    url: String,
    building_id: String,
}

impl MeshFeed {
    pub fn new(config: &SensorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(MeshFeed {
            client,
            url: config.url.clone(),
            building_id: config.building_id.clone(),
        })
    }
}

#[async_trait]
impl SensorFeed for MeshFeed {
    async fn fetch(&self) -> Result<Vec<RoomReading>> {
        let payload = serde_json::json!({
            "buildingId": self.building_id,
            "captchaToken": null,
        });

        let response = self.client.post(&self.url).json(&payload).send().await?;
        let status = response.status();

        if !status.is_success() {
            bail!("Sensor API returned {status}");
        }

        Ok(response.json().await?)
    }
}

/* == Gateway == */

struct CacheEntry {
    at: Instant,
    readings: Vec<RoomReading>,
}

/// Process-wide sensor access point. Successful results are cached for a
/// bounded window to decouple the poll cadence from upstream rate limits;
/// a failed refresh degrades to the last known readings.
pub struct SensorGateway {
    feed: Box<dyn SensorFeed>,
    ttl: Duration,
    cache: Mutex<Option<CacheEntry>>,
}

impl SensorGateway {
    pub fn new(feed: Box<dyn SensorFeed>, ttl: Duration) -> Self {
        SensorGateway {
            feed,
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// Never errors: callers always get the freshest readings available,
    /// possibly empty when the upstream has never answered.
    pub async fn latest(&self) -> Vec<RoomReading> {
        let mut cache = self.cache.lock().await;

        if let Some(entry) = cache.as_ref() {
            if entry.at.elapsed() < self.ttl {
                return entry.readings.clone();
            }
        }

        match self.feed.fetch().await {
            Ok(readings) => {
                tracing::debug!(rooms = readings.len(), "Sensor readings refreshed");

                *cache = Some(CacheEntry {
                    at: Instant::now(),
                    readings: readings.clone(),
                });

                readings
            }

            Err(error) => {
                tracing::warn!(%error, "Sensor fetch failed, serving last known readings");

                cache
                    .as_ref()
                    .map(|entry| entry.readings.clone())
                    .unwrap_or_default()
            }
        }
    }
}
