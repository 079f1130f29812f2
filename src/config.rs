use std::fs;
use std::time::Duration;

use crate::errors::{ErrorKind, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Peers unchoked at once per torrent
    pub upload_slots: usize,
    /// Minimum seconds between full choke reviews
    pub review_interval: u64,
    /// A due review is skipped while the transfer rate is at least this
    /// percentage of its cap
    pub skip_review_percent: u8,
    /// Bytes per second, 0 is unlimited
    pub max_upload_rate: u64,
    pub max_download_rate: u64,
    /// Outstanding block requests kept per peer
    pub request_queue: usize,
    pub endgame: bool,
    pub sequential: bool,
    pub tick_ms: u64,
}

#[derive(Serialize, Deserialize, Default)]
pub struct ConfigFile {
    pub upload_slots: Option<usize>,
    pub review_interval: Option<u64>,
    pub skip_review_percent: Option<u8>,
    pub max_upload_rate: Option<u64>,
    pub max_download_rate: Option<u64>,
    pub request_queue: Option<usize>,
    pub endgame: Option<bool>,
    pub sequential: Option<bool>,
    pub tick_ms: Option<u64>,
}

impl Config {
    /// Reads, merges and validates a TOML config file.
    pub fn load(path: &str) -> Result<Config> {
        let path = shellexpand::tilde(path).into_owned();
        let data = fs::read_to_string(&path)?;
        let file: ConfigFile = toml::from_str(&data)?;
        let config = Config::from_file(file);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(file: ConfigFile) -> Config {
        let mut base: Config = Default::default();
        if let Some(s) = file.upload_slots {
            base.upload_slots = s;
        }
        if let Some(i) = file.review_interval {
            base.review_interval = i;
        }
        if let Some(p) = file.skip_review_percent {
            base.skip_review_percent = p;
        }
        if let Some(r) = file.max_upload_rate {
            base.max_upload_rate = r;
        }
        if let Some(r) = file.max_download_rate {
            base.max_download_rate = r;
        }
        if let Some(q) = file.request_queue {
            base.request_queue = q;
        }
        if let Some(e) = file.endgame {
            base.endgame = e;
        }
        if let Some(s) = file.sequential {
            base.sequential = s;
        }
        if let Some(t) = file.tick_ms {
            base.tick_ms = t;
        }
        base
    }

    pub fn validate(&self) -> Result<()> {
        if self.upload_slots == 0 {
            bail!(ErrorKind::InvalidConfig("upload_slots must be at least 1".to_owned()));
        }
        if self.request_queue == 0 {
            bail!(ErrorKind::InvalidConfig("request_queue must be at least 1".to_owned()));
        }
        if self.skip_review_percent > 100 {
            bail!(ErrorKind::InvalidConfig(format!(
                "skip_review_percent {} is above 100",
                self.skip_review_percent
            )));
        }
        if self.tick_ms < 10 {
            bail!(ErrorKind::InvalidConfig(format!(
                "tick_ms {} is below 10",
                self.tick_ms
            )));
        }
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn review_interval(&self) -> Duration {
        Duration::from_secs(self.review_interval)
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            upload_slots: 4,
            review_interval: 30,
            skip_review_percent: 90,
            max_upload_rate: 0,
            max_download_rate: 0,
            request_queue: 5,
            endgame: true,
            sequential: false,
            tick_ms: 500,
        }
    }
}
