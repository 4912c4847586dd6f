use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Commanded state of a fan relay, stored as `ON`/`OFF` in durable rows.
#[derive(Copy, Clone, Debug, Deserialize, Display, EnumString, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum FanStatus {
    On,
    Off,
}

impl FanStatus {
    pub fn is_on(self) -> bool {
        matches!(self, FanStatus::On)
    }
}

/// One room's fan: which hardware pin drives it and what state it was last
/// commanded into. `last_co2` is runtime-only display data and is never
/// persisted.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FanAssignment {
    pub room: String,
    pub status: FanStatus,
    pub pin: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_co2: Option<u32>,
}

impl FanAssignment {
    pub fn new(room: impl Into<String>, pin: u8) -> Self {
        FanAssignment {
            room: room.into(),
            status: FanStatus::Off,
            pin,
            last_co2: None,
        }
    }
}
