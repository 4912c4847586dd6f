use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::time::{MissedTickBehavior, interval};

use crate::{
    config::FanConfig,
    control::{Controller, DrivenMap},
    sensors::SensorGateway,
    store::StoreError,
};

/// The background control loop: polls the sensor gateway, reconciles every
/// assigned fan against the threshold policy, and persists the result,
/// once per cycle, forever.
pub struct Automation {
    controller: Arc<Controller>,
    sensors: Arc<SensorGateway>,
    cycle: Duration,
    threshold: u32,
}

impl Automation {
    pub fn new(
        controller: Arc<Controller>,
        sensors: Arc<SensorGateway>,
        config: &FanConfig,
    ) -> Self {
        Automation {
            controller,
            sensors,
            cycle: Duration::from_secs(config.cycle_secs),
            threshold: config.co2_threshold,
        }
    }

    /// Runs until the process exits. A failed cycle is logged and retried
    /// on the next tick, never propagated.
    pub async fn run(self) {
        let mut driven = DrivenMap::new();
        let mut timer = interval(self.cycle);

        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(cycle_secs = self.cycle.as_secs(), "Automation loop started");

        loop {
            timer.tick().await;

            if let Err(error) = self.cycle_once(&mut driven).await {
                tracing::warn!(%error, "Automation cycle failed, retrying next cycle");
            }
        }
    }

    async fn cycle_once(&self, driven: &mut DrivenMap) -> Result<(), StoreError> {
        let readings = self.sensors.latest().await;

        let co2: HashMap<String, u32> = readings
            .into_iter()
            .map(|reading| (reading.room, reading.co2))
            .collect();

        self.controller.apply_cycle(&co2, self.threshold, driven).await
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use eyre::Result;
    use tempfile::TempDir;

    use crate::{
        defs::FanStatus,
        hardware::{RelayBank, testing::RecordingBackend},
        sensors::{RoomReading, SensorFeed},
        store::{AssignmentStore, RuntimeLog},
    };

    use super::*;

    struct StubFeed(Vec<(&'static str, u32)>);

    #[async_trait]
    impl SensorFeed for StubFeed {
        async fn fetch(&self) -> Result<Vec<RoomReading>> {
            Ok(self
                .0
                .iter()
                .map(|(room, co2)| RoomReading {
                    room: room.to_string(),
                    co2: *co2,
                })
                .collect())
        }
    }

    fn automation(
        dir: &TempDir,
        backend: RecordingBackend,
        readings: Vec<(&'static str, u32)>,
    ) -> Automation {
        let controller = Arc::new(Controller::new(
            vec![23, 24, 25],
            AssignmentStore::new(dir.path().join("fans.csv")),
            RuntimeLog::new(dir.path().join("log.csv")),
            RelayBank::new(Box::new(backend)),
            Vec::new(),
        ));

        let sensors = Arc::new(SensorGateway::new(
            Box::new(StubFeed(readings)),
            Duration::from_secs(10),
        ));

        Automation::new(controller, sensors, &FanConfig::default())
    }

    #[tokio::test]
    async fn test_cycle_applies_threshold_policy() {
        let dir = TempDir::new().unwrap();
        let backend = RecordingBackend::default();

        let automation = automation(
            &dir,
            backend.clone(),
            vec![("Kitchen", 1200), ("Hall", 600)],
        );

        automation.controller.assign("Kitchen").await.unwrap();
        automation.controller.assign("Hall").await.unwrap();

        let mut driven = DrivenMap::new();
        automation.cycle_once(&mut driven).await.unwrap();

        let fans = automation.controller.list().await;
        assert_eq!(fans[0].status, FanStatus::On);
        assert_eq!(fans[1].status, FanStatus::Off);
        assert_eq!(backend.last_state(23), Some(true));
        assert_eq!(backend.last_state(24), Some(false));
    }

    #[tokio::test]
    async fn test_unassigned_rooms_are_ignored() {
        let dir = TempDir::new().unwrap();
        let backend = RecordingBackend::default();

        let automation = automation(&dir, backend.clone(), vec![("Kitchen", 2000)]);

        let mut driven = DrivenMap::new();
        automation.cycle_once(&mut driven).await.unwrap();

        assert!(driven.is_empty());
        assert!(backend.events().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_cycles_do_not_reactuate() {
        let dir = TempDir::new().unwrap();
        let backend = RecordingBackend::default();

        let automation = automation(&dir, backend.clone(), vec![("Kitchen", 1500)]);
        automation.controller.assign("Kitchen").await.unwrap();

        let mut driven = DrivenMap::new();

        for _ in 0..3 {
            automation.cycle_once(&mut driven).await.unwrap();
        }

        // Initialization parks the relay OFF, then a single ON command
        assert_eq!(backend.events(), vec![(23, false), (23, true)]);
    }
}
