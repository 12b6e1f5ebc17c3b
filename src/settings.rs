use anyhow::{Context, Result, ensure};
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TrackerCfg {
    /// Pin/unpin calls allowed in flight at once, across all CIDs.
    pub concurrent_pins: usize,
    /// How often `run` reconciles against the daemon; 0 disables it.
    pub sync_interval_secs: u64,
}

impl Default for TrackerCfg {
    fn default() -> Self {
        Self {
            concurrent_pins: 10,
            sync_interval_secs: 0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IpfsCfg {
    pub api_url: String,
    /// Per-request timeout; 0 means none.
    pub request_timeout_secs: u64,
}

impl Default for IpfsCfg {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:5001".into(),
            request_timeout_secs: 0,
        }
    }
}

impl IpfsCfg {
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Settings {
    pub tracker: TrackerCfg,
    pub ipfs: IpfsCfg,
}

pub fn load(path: Option<&str>) -> Result<Settings> {
    let mut fig = Figment::from(Serialized::defaults(Settings::default()))
        .merge(Env::prefixed("PIN_TRACKER_").split("__")); // e.g. PIN_TRACKER_TRACKER__CONCURRENT_PINS

    if let Some(p) = path {
        if p.ends_with(".json") {
            fig = fig.merge(Json::file(p));
        } else {
            fig = fig.merge(Toml::file(p));
        }
    } else {
        // best-effort defaults
        fig = fig.merge(Toml::file("./config.toml"));
    }

    let settings: Settings = fig.extract().context("invalid_config")?;
    ensure!(
        settings.tracker.concurrent_pins > 0,
        "tracker.concurrent_pins must be at least 1"
    );
    Ok(settings)
}
