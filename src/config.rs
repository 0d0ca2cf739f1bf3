use serde::{Deserialize, Serialize};
use std::fs;
use tracing::{info, warn};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub backend: BackendConfig,
    pub location: LocationConfig,
    pub feed: FeedConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    pub user_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LocationConfig {
    pub min_update_interval_ms: u64, // Rate limit between accepted fixes
    pub min_distance_m: f64,         // Jitter gate while stationary
    pub poll_interval_seconds: u64,  // Watchdog one-shot interval
    pub ip_hint: String,             // IP the geolocation services resolve
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FeedConfig {
    pub radius_km: f64,
    pub max_results: u32,
    pub auto_refresh_seconds: u64,
    pub filter_debounce_ms: u64,
    pub position_debounce_ms: u64,
    pub refresh_throttle_ms: u64,
    pub movement_gate_m: f64,
}

impl Config {
    /// Loads config.toml from the working directory.
    /// If it doesn't exist, creates a default one for the user to edit.
    pub fn load() -> Self {
        let config_path = "config.toml";

        if let Ok(content) = fs::read_to_string(config_path) {
            match toml::from_str(&content) {
                Ok(config) => return config,
                Err(e) => warn!("Failed to parse config.toml: {}. Using defaults.", e),
            }
        }

        let default_config = Config::default();

        match toml::to_string_pretty(&default_config) {
            Ok(toml_string) => {
                if fs::write(config_path, toml_string).is_err() {
                    warn!("Could not write default config.toml to disk.");
                }
            }
            Err(e) => warn!("Could not serialize default config: {}", e),
        }

        info!("Loaded default configuration.");
        default_config
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backend: BackendConfig {
                base_url: "http://localhost:8000".to_string(),
                user_id: "demo-user".to_string(),
            },
            location: LocationConfig {
                min_update_interval_ms: 1000,
                min_distance_m: 25.0,
                poll_interval_seconds: 30,
                ip_hint: "1.1.1.1".to_string(),
            },
            feed: FeedConfig {
                radius_km: 15.0,
                max_results: 50,
                auto_refresh_seconds: 60,
                filter_debounce_ms: 1000,
                position_debounce_ms: 1500,
                refresh_throttle_ms: 2000,
                movement_gate_m: 50.0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let toml_string = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&toml_string).unwrap();
        assert_eq!(parsed.feed.radius_km, 15.0);
        assert_eq!(parsed.location.min_update_interval_ms, 1000);
    }

    #[test]
    fn partial_config_fails_parse_rather_than_guessing() {
        // Missing sections are a parse error; load() then falls back to the
        // documented defaults instead of half-applying the file.
        assert!(toml::from_str::<Config>("[backend]\nbase_url = \"x\"").is_err());
    }
}
