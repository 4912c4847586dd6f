use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tokio::sync::Mutex;

use crate::{
    defs::{FanAssignment, FanStatus},
    hardware::RelayBank,
    store::{AssignmentStore, RuntimeLog, StoreError},
};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("All fan pins are in use")]
    NoFreePins,

    #[error("A fan is already assigned to {0}")]
    AlreadyAssigned(String),

    #[error("No fan is assigned to {0}")]
    UnknownRoom(String),

    #[error("Failed to persist fan assignments: {0}")]
    Storage(#[from] StoreError),
}

/// Returns the lowest pin from the fixed pool that is not currently in
/// use, or `None` when the pool is exhausted.
pub fn allocate_pin(pool: &[u8], in_use: &HashSet<u8>) -> Option<u8> {
    pool.iter().copied().filter(|pin| !in_use.contains(pin)).min()
}

/* == Manual overrides == */

/// Rooms a human has explicitly taken control of. In-memory only: a
/// process restart returns every room to automatic control.
#[derive(Default)]
pub struct OverrideStore(std::sync::Mutex<HashSet<String>>);

impl OverrideStore {
    pub fn set(&self, room: &str) {
        self.0.lock().unwrap().insert(room.to_owned());
    }

    pub fn clear(&self, room: &str) {
        self.0.lock().unwrap().remove(room);
    }

    pub fn is_set(&self, room: &str) -> bool {
        self.0.lock().unwrap().contains(room)
    }
}

/* == Automation bookkeeping == */

/// Rooms currently driven by the automatic cycle, keyed by room name. The
/// pin is remembered so a fan removed mid-cycle can still be forced off.
pub type DrivenMap = HashMap<String, Driven>;

#[derive(Copy, Clone, Debug)]
pub struct Driven {
    pub pin: u8,
    pub status: FanStatus,
}

/* == Controller == */

/// Shared core mutated by both the HTTP surface and the automation loop.
///
/// One mutex spans the assignment mirror and the relay bank; it is never
/// released between actuating hardware and recording the resulting state.
/// Mutations persist a computed next-state before committing it to the
/// mirror, so a storage failure rejects the operation outright.
pub struct Controller {
    inner: Mutex<Inner>,
    overrides: OverrideStore,
    store: AssignmentStore,
    log: RuntimeLog,
    pool: Vec<u8>,
}

struct Inner {
    assignments: Vec<FanAssignment>,
    relays: RelayBank,
}

impl Controller {
    pub fn new(
        pool: Vec<u8>,
        store: AssignmentStore,
        log: RuntimeLog,
        relays: RelayBank,
        assignments: Vec<FanAssignment>,
    ) -> Self {
        Controller {
            inner: Mutex::new(Inner {
                assignments,
                relays,
            }),
            overrides: OverrideStore::default(),
            store,
            log,
            pool,
        }
    }

    pub fn overrides(&self) -> &OverrideStore {
        &self.overrides
    }

    pub async fn list(&self) -> Vec<FanAssignment> {
        self.inner.lock().await.assignments.clone()
    }

    /// Assigns a fan to `room`, drawing the lowest free pin from the pool.
    pub async fn assign(&self, room: &str) -> Result<FanAssignment, ControlError> {
        let mut inner = self.inner.lock().await;

        if inner.assignments.iter().any(|fan| fan.room == room) {
            return Err(ControlError::AlreadyAssigned(room.to_owned()));
        }

        let in_use: HashSet<u8> = inner.assignments.iter().map(|fan| fan.pin).collect();
        let pin = allocate_pin(&self.pool, &in_use).ok_or(ControlError::NoFreePins)?;

        let fan = FanAssignment::new(room, pin);
        let mut next = inner.assignments.clone();
        next.push(fan.clone());

        self.store.save(&next).await?;

        inner.assignments = next;
        inner.relays.initialize(pin);

        tracing::info!(room, pin, "Fan assigned");
        Ok(fan)
    }

    /// Manually drives a fan. Turning a fan ON flags the room as
    /// human-controlled until it is manually turned OFF again.
    pub async fn control(&self, room: &str, status: FanStatus) -> Result<(), ControlError> {
        let mut inner = self.inner.lock().await;
        let Inner {
            assignments,
            relays,
        } = &mut *inner;

        let index = assignments
            .iter()
            .position(|fan| fan.room == room)
            .ok_or_else(|| ControlError::UnknownRoom(room.to_owned()))?;

        let mut next = assignments.clone();
        let changed = next[index].status != status;
        let pin = next[index].pin;
        next[index].status = status;

        self.store.save(&next).await?;

        match status {
            FanStatus::On => {
                relays.turn_on(pin);
                self.overrides.set(room);
            }
            FanStatus::Off => {
                relays.turn_off(pin);
                self.overrides.clear(room);
            }
        }

        *assignments = next;

        if changed {
            self.log.append(room, status).await;
        }

        tracing::info!(room, %status, "Manual fan control applied");
        Ok(())
    }

    /// Removes a room's fan: the pin returns to the free pool, the relay
    /// is forced OFF, and any manual override is discarded.
    pub async fn remove(&self, room: &str) -> Result<(), ControlError> {
        let mut inner = self.inner.lock().await;

        let index = inner
            .assignments
            .iter()
            .position(|fan| fan.room == room)
            .ok_or_else(|| ControlError::UnknownRoom(room.to_owned()))?;

        let mut next = inner.assignments.clone();
        let fan = next.remove(index);

        self.store.save(&next).await?;
        inner.assignments = next;

        let was_on = inner.relays.is_on(fan.pin);
        inner.relays.release(fan.pin);
        self.overrides.clear(room);

        if was_on {
            self.log.append(room, FanStatus::Off).await;
        }

        tracing::info!(room, pin = fan.pin, "Fan removed");
        Ok(())
    }

    /// One automation pass over the authoritative assignment mirror:
    /// reconcile bookkeeping against removals, apply the threshold policy
    /// to every non-overridden room, then persist the full list once.
    ///
    /// The threshold is a plain level comparison with no hysteresis band; a
    /// reading sitting exactly at the threshold may toggle every cycle.
    pub async fn apply_cycle(
        &self,
        co2: &HashMap<String, u32>,
        threshold: u32,
        driven: &mut DrivenMap,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let Inner {
            assignments,
            relays,
        } = &mut *inner;

        // Drop bookkeeping for rooms removed since the last cycle. A pin
        // that is still energized and not reclaimed by another assignment
        // is forced off.
        driven.retain(|room, entry| {
            if assignments.iter().any(|fan| fan.room == *room) {
                return true;
            }

            let reclaimed = assignments.iter().any(|fan| fan.pin == entry.pin);

            if !reclaimed && relays.is_on(entry.pin) {
                tracing::warn!(%room, pin = entry.pin, "Removed fan still energized, forcing off");
                relays.release(entry.pin);
            }

            false
        });

        for fan in assignments.iter_mut() {
            let reading = co2.get(&fan.room).copied().unwrap_or(0);
            fan.last_co2 = Some(reading);

            if self.overrides.is_set(&fan.room) {
                continue;
            }

            let desired = if reading >= threshold {
                FanStatus::On
            } else {
                FanStatus::Off
            };

            let tracked = driven.get(&fan.room).map(|entry| entry.status);

            if tracked != Some(desired) {
                match desired {
                    FanStatus::On => {
                        tracing::info!(room = %fan.room, co2 = reading, "CO2 above threshold, fan on");
                        relays.turn_on(fan.pin);
                    }
                    FanStatus::Off => {
                        tracing::info!(room = %fan.room, co2 = reading, "CO2 below threshold, fan off");
                        relays.turn_off(fan.pin);
                    }
                }

                if fan.status != desired {
                    self.log.append(&fan.room, desired).await;
                }

                fan.status = desired;

                driven.insert(
                    fan.room.clone(),
                    Driven {
                        pin: fan.pin,
                        status: desired,
                    },
                );
            }
        }

        // One batched write per cycle
        self.store.save(assignments).await
    }

    /// Best-effort hardware shutdown at process exit.
    pub async fn shutdown(&self) {
        self.inner.lock().await.relays.shutdown_all();
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::hardware::testing::RecordingBackend;

    use super::*;

    struct Fixture {
        controller: Controller,
        backend: RecordingBackend,
        dir: TempDir,
    }

    fn fixture(pool: &[u8]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let backend = RecordingBackend::default();

        let controller = Controller::new(
            pool.to_vec(),
            AssignmentStore::new(dir.path().join("fans.csv")),
            RuntimeLog::new(dir.path().join("log.csv")),
            RelayBank::new(Box::new(backend.clone())),
            Vec::new(),
        );

        Fixture {
            controller,
            backend,
            dir,
        }
    }

    fn co2(pairs: &[(&str, u32)]) -> HashMap<String, u32> {
        pairs
            .iter()
            .map(|(room, ppm)| (room.to_string(), *ppm))
            .collect()
    }

    #[test]
    fn test_allocate_pin_picks_lowest_free() {
        let pool = [23, 24, 25];

        assert_eq!(allocate_pin(&pool, &HashSet::new()), Some(23));
        assert_eq!(allocate_pin(&pool, &HashSet::from([23])), Some(24));
        assert_eq!(allocate_pin(&pool, &HashSet::from([23, 24, 25])), None);
    }

    #[tokio::test]
    async fn test_assign_is_injective() {
        let fx = fixture(&[17, 18, 23]);

        let a = fx.controller.assign("Kitchen").await.unwrap();
        let b = fx.controller.assign("Hall").await.unwrap();
        let c = fx.controller.assign("Office").await.unwrap();

        let pins = HashSet::from([a.pin, b.pin, c.pin]);
        assert_eq!(pins.len(), 3);
        assert_eq!(a.pin, 17);
        assert_eq!(a.status, FanStatus::Off);
    }

    #[tokio::test]
    async fn test_duplicate_room_is_rejected() {
        let fx = fixture(&[23, 24]);

        fx.controller.assign("Kitchen").await.unwrap();
        let result = fx.controller.assign("Kitchen").await;

        assert!(matches!(result, Err(ControlError::AlreadyAssigned(_))));
        assert_eq!(fx.controller.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_leaves_state_untouched() {
        let fx = fixture(&[23, 24, 25]);

        for room in ["Kitchen", "Hall", "Office"] {
            fx.controller.assign(room).await.unwrap();
        }

        let result = fx.controller.assign("Attic").await;

        assert!(matches!(result, Err(ControlError::NoFreePins)));
        assert_eq!(fx.controller.list().await.len(), 3);
    }

    #[tokio::test]
    async fn test_storage_failure_rejects_the_mutation() {
        let dir = TempDir::new().unwrap();
        let backend = RecordingBackend::default();

        // Point the store at a directory that does not exist
        let controller = Controller::new(
            vec![23],
            AssignmentStore::new(dir.path().join("missing").join("fans.csv")),
            RuntimeLog::new(dir.path().join("log.csv")),
            RelayBank::new(Box::new(backend.clone())),
            Vec::new(),
        );

        let result = controller.assign("Kitchen").await;

        assert!(matches!(result, Err(ControlError::Storage(_))));
        assert!(controller.list().await.is_empty());
        assert!(backend.events().is_empty());
    }

    #[tokio::test]
    async fn test_manual_control_drives_relay_and_override() {
        let fx = fixture(&[23]);

        fx.controller.assign("Kitchen").await.unwrap();
        fx.controller.control("Kitchen", FanStatus::On).await.unwrap();

        assert_eq!(fx.backend.last_state(23), Some(true));
        assert!(fx.controller.overrides().is_set("Kitchen"));
        assert_eq!(fx.controller.list().await[0].status, FanStatus::On);

        fx.controller.control("Kitchen", FanStatus::Off).await.unwrap();

        assert_eq!(fx.backend.last_state(23), Some(false));
        assert!(!fx.controller.overrides().is_set("Kitchen"));
    }

    #[tokio::test]
    async fn test_control_unknown_room() {
        let fx = fixture(&[23]);

        let result = fx.controller.control("Basement", FanStatus::On).await;
        assert!(matches!(result, Err(ControlError::UnknownRoom(_))));
    }

    #[tokio::test]
    async fn test_threshold_decides_fan_state() {
        let fx = fixture(&[23, 24]);
        let mut driven = DrivenMap::new();

        fx.controller.assign("Kitchen").await.unwrap();
        fx.controller.assign("Hall").await.unwrap();

        let readings = co2(&[("Kitchen", 1200), ("Hall", 600)]);
        fx.controller
            .apply_cycle(&readings, 1000, &mut driven)
            .await
            .unwrap();

        let fans = fx.controller.list().await;
        assert_eq!(fans[0].status, FanStatus::On);
        assert_eq!(fans[0].last_co2, Some(1200));
        assert_eq!(fans[1].status, FanStatus::Off);
        assert_eq!(fx.backend.last_state(23), Some(true));
        assert_eq!(fx.backend.last_state(24), Some(false));

        // Exactly at the threshold counts as ON
        let readings = co2(&[("Kitchen", 999), ("Hall", 1000)]);
        fx.controller
            .apply_cycle(&readings, 1000, &mut driven)
            .await
            .unwrap();

        let fans = fx.controller.list().await;
        assert_eq!(fans[0].status, FanStatus::Off);
        assert_eq!(fans[1].status, FanStatus::On);
    }

    #[tokio::test]
    async fn test_missing_reading_fails_toward_off() {
        let fx = fixture(&[23]);
        let mut driven = DrivenMap::new();

        fx.controller.assign("Kitchen").await.unwrap();
        fx.controller
            .apply_cycle(&co2(&[]), 1000, &mut driven)
            .await
            .unwrap();

        let fans = fx.controller.list().await;
        assert_eq!(fans[0].status, FanStatus::Off);
        assert_eq!(fans[0].last_co2, Some(0));
    }

    #[tokio::test]
    async fn test_override_suppresses_automation() {
        let fx = fixture(&[23]);
        let mut driven = DrivenMap::new();

        fx.controller.assign("Kitchen").await.unwrap();
        fx.controller.control("Kitchen", FanStatus::On).await.unwrap();

        // Three cycles of low readings leave the overridden room alone
        for _ in 0..3 {
            fx.controller
                .apply_cycle(&co2(&[("Kitchen", 400)]), 1000, &mut driven)
                .await
                .unwrap();

            assert_eq!(fx.controller.list().await[0].status, FanStatus::On);
            assert_eq!(fx.backend.last_state(23), Some(true));
        }

        // Clearing the override hands the room back to automation
        fx.controller.control("Kitchen", FanStatus::Off).await.unwrap();
        fx.controller
            .apply_cycle(&co2(&[("Kitchen", 1500)]), 1000, &mut driven)
            .await
            .unwrap();

        assert_eq!(fx.controller.list().await[0].status, FanStatus::On);
    }

    #[tokio::test]
    async fn test_remove_forces_off_and_frees_pin() {
        let fx = fixture(&[23, 24, 25]);
        let mut driven = DrivenMap::new();

        fx.controller.assign("Kitchen").await.unwrap();

        fx.controller
            .apply_cycle(&co2(&[("Kitchen", 1200)]), 1000, &mut driven)
            .await
            .unwrap();
        assert_eq!(fx.backend.last_state(23), Some(true));

        fx.controller.assign("Hall").await.unwrap();
        fx.controller.remove("Kitchen").await.unwrap();

        // The relay received an OFF command and the bookkeeping clears on
        // the next cycle
        assert_eq!(fx.backend.last_state(23), Some(false));

        fx.controller
            .apply_cycle(&co2(&[("Hall", 500)]), 1000, &mut driven)
            .await
            .unwrap();
        assert!(!driven.contains_key("Kitchen"));

        // Hall is unaffected, pin 23 is free for the next assignment
        let fans = fx.controller.list().await;
        assert_eq!(fans.len(), 1);
        assert_eq!(fans[0].room, "Hall");
        assert_eq!(fans[0].pin, 24);

        let office = fx.controller.assign("Office").await.unwrap();
        assert_eq!(office.pin, 23);
    }

    #[tokio::test]
    async fn test_remove_clears_override() {
        let fx = fixture(&[23]);

        fx.controller.assign("Kitchen").await.unwrap();
        fx.controller.control("Kitchen", FanStatus::On).await.unwrap();
        fx.controller.remove("Kitchen").await.unwrap();

        assert!(!fx.controller.overrides().is_set("Kitchen"));
    }

    #[tokio::test]
    async fn test_cycle_persists_the_batch() {
        let fx = fixture(&[23]);
        let mut driven = DrivenMap::new();

        fx.controller.assign("Kitchen").await.unwrap();
        fx.controller
            .apply_cycle(&co2(&[("Kitchen", 1300)]), 1000, &mut driven)
            .await
            .unwrap();

        let store = AssignmentStore::new(fx.dir.path().join("fans.csv"));
        let persisted = store.load().await.unwrap();

        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].status, FanStatus::On);
        assert_eq!(persisted[0].pin, 23);
    }
}
