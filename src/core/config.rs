use crate::errors::{Result, SweepError};
use crate::types::Viewport;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub browser: BrowserConfig,
    pub timing: TimingConfig,
    pub run: RunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,
    pub viewport: Viewport,
    pub user_agent: Option<String>,
    /// Profile directory, so a logged-in session survives between launches.
    pub user_data_dir: Option<PathBuf>,
    /// Attach to an already running browser instead of launching one.
    pub debugger_ws_url: Option<String>,
    pub args: Vec<String>,
    pub navigation_timeout_ms: u64,
    /// How often the in-page mutation counter is sampled.
    pub feed_poll_interval_ms: u64,
}

/// Every bound the engine puts on waiting for the external tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Hover affordances show up near-instantly or not at all.
    pub reveal_timeout_ms: u64,
    pub step_timeout_ms: u64,
    pub min_action_interval_ms: u64,
    pub loader_grace_ms: u64,
    pub new_content_timeout_ms: u64,
    pub scroll_settle_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Backward scroll distance of one stepping move.
    pub scroll_step_px: f64,
    /// Rows whose top edge is above this offset sit under the header band.
    pub in_view_offset_px: f64,
    /// Language used when the document does not report one.
    pub fallback_language: String,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: false,
            viewport: Viewport::default(),
            user_agent: None,
            user_data_dir: None,
            debugger_ws_url: None,
            args: vec![],
            navigation_timeout_ms: 30000,
            feed_poll_interval_ms: 50,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            reveal_timeout_ms: 200,
            step_timeout_ms: 5000,
            min_action_interval_ms: 1000,
            loader_grace_ms: 10000,
            new_content_timeout_ms: 10000,
            scroll_settle_ms: 20,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            scroll_step_px: 30.0,
            in_view_offset_px: 100.0,
            fallback_language: "en".to_string(),
        }
    }
}

impl TimingConfig {
    pub fn reveal_timeout(&self) -> Duration {
        Duration::from_millis(self.reveal_timeout_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn min_action_interval(&self) -> Duration {
        Duration::from_millis(self.min_action_interval_ms)
    }

    pub fn loader_grace(&self) -> Duration {
        Duration::from_millis(self.loader_grace_ms)
    }

    pub fn new_content_timeout(&self) -> Duration {
        Duration::from_millis(self.new_content_timeout_ms)
    }

    pub fn scroll_settle(&self) -> Duration {
        Duration::from_millis(self.scroll_settle_ms)
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let bounds = [
            ("timing.reveal_timeout_ms", self.timing.reveal_timeout_ms),
            ("timing.step_timeout_ms", self.timing.step_timeout_ms),
            ("timing.loader_grace_ms", self.timing.loader_grace_ms),
            (
                "timing.new_content_timeout_ms",
                self.timing.new_content_timeout_ms,
            ),
            (
                "browser.feed_poll_interval_ms",
                self.browser.feed_poll_interval_ms,
            ),
        ];
        if let Some((name, _)) = bounds.iter().find(|(_, value)| *value == 0) {
            return Err(SweepError::ConfigurationError(format!(
                "{} must be greater than zero",
                name
            )));
        }
        if self.run.scroll_step_px.is_nan() || self.run.scroll_step_px <= 0.0 {
            return Err(SweepError::ConfigurationError(
                "run.scroll_step_px must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timing.reveal_timeout(), Duration::from_millis(200));
        assert_eq!(config.run.scroll_step_px, 30.0);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: Config =
            serde_json::from_str(r#"{ "timing": { "step_timeout_ms": 750 } }"#).unwrap();
        assert_eq!(config.timing.step_timeout_ms, 750);
        assert_eq!(config.timing.min_action_interval_ms, 1000);
        assert_eq!(config.run.fallback_language, "en");
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let mut config = Config::default();
        config.timing.step_timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("timing.step_timeout_ms"));

        let mut config = Config::default();
        config.run.scroll_step_px = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_from_file() {
        let path = std::env::temp_dir().join(format!("dm-sweeper-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{ "browser": { "headless": true } }"#).unwrap();
        let config = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(config.browser.headless);
    }
}
