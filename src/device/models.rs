use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

use crate::profile::ProfileStore;

/// Where the coordinator is in its connect/sync/serve cycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Syncing,
    Steady,
}

/// Device link status reported by the health endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub port: String,
    pub sensor_count: Option<usize>,
    pub connected_since: Option<DateTime<Utc>>,
}

impl LinkStatus {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            port: port.into(),
            sensor_count: None,
            connected_since: None,
        }
    }

    pub fn is_steady(&self) -> bool {
        self.state == ConnectionState::Steady
    }

    /// Move to `state`. Leaving steady clears the connection details.
    pub fn transition(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Steady => {
                if self.connected_since.is_none() {
                    self.connected_since = Some(Utc::now());
                }
            }
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                self.sensor_count = None;
                self.connected_since = None;
            }
            ConnectionState::Syncing => {}
        }
        self.state = state;
    }
}

/// What a freshly loaded UI needs: the profile list, the current profile
/// and its thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Defaults {
    pub profiles: Vec<String>,
    pub cur_profile: String,
    pub thresholds: Vec<i32>,
}

impl Defaults {
    pub fn from_store(store: &ProfileStore) -> Self {
        Self {
            profiles: store.profile_names(),
            cur_profile: store.current_profile().to_string(),
            thresholds: store.current_thresholds().to_vec(),
        }
    }
}
