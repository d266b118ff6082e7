use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use tracing::{debug, warn};
use url::Url;

use crate::{error::ClientError, simulator::FixtureShape};

pub const SETTINGS_FILE: &str = "polyview.toml";

const KEYS: &[&str] = &[
    "api_base_url",
    "ws_base_url",
    "mode",
    "idle_timeout_secs",
    "request_timeout_secs",
    "simulation_tick_ms",
    "simulation_fixture",
    "simulation_shape",
];

/// Which producer the session initiator hands sessions to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProducerMode {
    #[default]
    Live,
    Simulated,
}

impl FromStr for ProducerMode {
    type Err = ClientError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "simulated" | "simulation" | "mock" => Ok(Self::Simulated),
            other => Err(ClientError::Config(format!(
                "unknown mode {other:?}; expected live or simulated"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationSettings {
    pub tick: Duration,
    pub fixture_path: Option<PathBuf>,
    pub shape: FixtureShape,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(1000),
            fixture_path: None,
            shape: FixtureShape::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub ws_base_url: String,
    pub mode: ProducerMode,
    pub idle_timeout: Duration,
    pub request_timeout: Duration,
    pub simulation: SimulationSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000/api/v1".into(),
            ws_base_url: "ws://localhost:8000/api/v1/ws".into(),
            mode: ProducerMode::Live,
            idle_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(30),
            simulation: SimulationSettings::default(),
        }
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// Defaults, then `path` (if readable), then `POLYVIEW_*` and `APP__*` variables.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> ClientSettings {
    let mut values = read_settings_file(path);

    for key in KEYS {
        let upper = key.to_ascii_uppercase();
        if let Some(v) = env(&format!("POLYVIEW_{upper}")) {
            values.insert(key.to_string(), v);
        }
        if let Some(v) = env(&format!("APP__{upper}")) {
            values.insert(key.to_string(), v);
        }
    }

    let mut settings = ClientSettings::default();

    if let Some(v) = values.get("api_base_url") {
        settings.api_base_url = v.trim_end_matches('/').to_string();
    }
    match values.get("ws_base_url") {
        Some(v) => settings.ws_base_url = v.trim_end_matches('/').to_string(),
        None if values.contains_key("api_base_url") => {
            match derive_ws_base_url(&settings.api_base_url) {
                Some(derived) => settings.ws_base_url = derived,
                None => warn!(
                    api_base_url = %settings.api_base_url,
                    "config: cannot derive ws_base_url; keeping default"
                ),
            }
        }
        None => {}
    }
    if let Some(mode) = parse_value(&values, "mode") {
        settings.mode = mode;
    }
    if let Some(secs) = parse_value::<u64>(&values, "idle_timeout_secs") {
        settings.idle_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = parse_value::<u64>(&values, "request_timeout_secs") {
        settings.request_timeout = Duration::from_secs(secs);
    }
    if let Some(ms) = parse_value::<u64>(&values, "simulation_tick_ms") {
        settings.simulation.tick = Duration::from_millis(ms);
    }
    if let Some(v) = values.get("simulation_fixture") {
        if !v.trim().is_empty() {
            settings.simulation.fixture_path = Some(PathBuf::from(v.trim()));
        }
    }
    if let Some(shape) = parse_value(&values, "simulation_shape") {
        settings.simulation.shape = shape;
    }

    settings
}

fn read_settings_file(path: &Path) -> HashMap<String, String> {
    let Ok(raw) = fs::read_to_string(path) else {
        debug!(path = %path.display(), "config: no settings file");
        return HashMap::new();
    };
    match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
        Ok(file_cfg) => file_cfg
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    toml::Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "config: ignoring unreadable settings file");
            HashMap::new()
        }
    }
}

fn parse_value<T>(values: &HashMap<String, String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = values.get(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(key, value = %raw, error = %err, "config: invalid value; keeping default");
            None
        }
    }
}

/// `http://host/api/v1` becomes `ws://host/api/v1/ws`.
pub fn derive_ws_base_url(api_base_url: &str) -> Option<String> {
    let mut url = Url::parse(api_base_url).ok()?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        _ => return None,
    };
    url.set_scheme(scheme).ok()?;
    url.path_segments_mut().ok()?.pop_if_empty().push("ws");
    Some(url.to_string())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
