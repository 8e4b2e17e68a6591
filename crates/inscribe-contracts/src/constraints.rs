use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    Wifi,
    Cellular,
    Ethernet,
    Other,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BatteryStatus {
    /// `None` when the host cannot report a level.
    pub level_percent: Option<u8>,
    pub is_charging: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub is_connected: bool,
    pub kind: Option<NetworkKind>,
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self {
            is_connected: true,
            kind: None,
        }
    }
}

/// Live power/network queries. Implementations may fail on hosts without
/// the relevant APIs; the scheduler treats a failed query as "ok" rather
/// than blocking work on missing data.
pub trait PlatformMonitor: Send + Sync {
    fn battery(&self) -> anyhow::Result<BatteryStatus>;
    fn network(&self) -> anyhow::Result<NetworkStatus>;
}

/// Fixed-answer monitor for hosts without platform power APIs and for
/// tests. The default reports nothing known, which never blocks a run.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticMonitor {
    pub battery: BatteryStatus,
    pub network: NetworkStatus,
}

impl PlatformMonitor for StaticMonitor {
    fn battery(&self) -> anyhow::Result<BatteryStatus> {
        Ok(self.battery)
    }

    fn network(&self) -> anyhow::Result<NetworkStatus> {
        Ok(self.network)
    }
}

/// Point-in-time constraint evaluation. Recomputed on every check and
/// mid-run; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSnapshot {
    pub battery_ok: bool,
    pub battery_level: Option<u8>,
    pub is_charging: Option<bool>,
    pub network_ok: bool,
    pub is_connected: Option<bool>,
    pub network_kind: Option<NetworkKind>,
    pub can_run: bool,
    pub reason: Option<String>,
}

impl ConstraintSnapshot {
    pub fn allowed(battery: BatteryStatus, network: NetworkStatus) -> Self {
        Self {
            battery_ok: true,
            battery_level: battery.level_percent,
            is_charging: battery.is_charging,
            network_ok: true,
            is_connected: Some(network.is_connected),
            network_kind: network.kind,
            can_run: true,
            reason: None,
        }
    }

    pub fn block(mut self, battery_side: bool, reason: impl Into<String>) -> Self {
        if battery_side {
            self.battery_ok = false;
        } else {
            self.network_ok = false;
        }
        self.can_run = false;
        self.reason = Some(reason.into());
        self
    }
}
