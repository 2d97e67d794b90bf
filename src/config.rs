/*
src/config.rs

settings are read once from settings/setting.json and handed to every component that needs them.
nothing in the crate re-reads the file after startup.
*/

use crate::locale::Locale;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// port announced to trackers
    pub port: u16,
    /// number of peers one sampling run tries to collect
    pub max_list_size: usize,
    /// upload cap in KB/s for the main download
    pub max_upload_limit: u64,
    /// save collected pieces as .bin files
    pub piece_download: bool,
    /// accept every seeding peer regardless of the configured ip ranges
    pub add_all_peers: bool,

    pub sample_rounds: usize,
    pub sample_round_interval_secs: u64,
    /// sampling stops once our own progress reaches this ratio
    pub self_seed_abort_ratio: f64,
    /// peers uploading at or below this many bytes/s are not sampled; unset samples them all
    pub min_peer_up_speed: Option<u64>,
    /// upload cap in bytes/s while sampling
    pub sample_upload_limit: u64,
    pub piece_read_retries: usize,
    pub piece_read_interval_secs: u64,
    pub stall_window_secs: u64,
    pub download_poll_interval_secs: u64,
    /// overall ceiling for one evidence folder run
    pub run_deadline_secs: Option<u64>,

    pub whois_server: String,
    /// pause after each whois query so the registry does not throttle us
    pub whois_pause_secs: u64,
    pub public_ipv4_url: String,
    pub public_ipv6_url: String,

    pub locale: Locale,
    pub version: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            port: 6881,
            max_list_size: 50,
            max_upload_limit: 100,
            piece_download: false,
            add_all_peers: false,
            sample_rounds: 10,
            sample_round_interval_secs: 3,
            self_seed_abort_ratio: 0.5,
            min_peer_up_speed: None,
            sample_upload_limit: 100_000,
            piece_read_retries: 10,
            piece_read_interval_secs: 1,
            stall_window_secs: 30,
            download_poll_interval_secs: 1,
            run_deadline_secs: None,
            whois_server: "whois.nic.ad.jp:43".to_string(),
            whois_pause_secs: 5,
            public_ipv4_url: "https://api.ipify.org?format=json".to_string(),
            public_ipv6_url: "https://api6.ipify.org?format=json".to_string(),
            locale: Locale::Ja,
            version: "ver.1.0".to_string(),
        }
    }
}

impl Settings {
    /// a missing file gives the defaults, a malformed one is an error
    pub fn load(path: &Path) -> Result<Settings> {
        if !path.exists() {
            log::info!("{} not found, using default settings", path.display());
            return Ok(Settings::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let settings = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(settings)
    }

    pub fn sample_round_interval(&self) -> Duration {
        Duration::from_secs(self.sample_round_interval_secs)
    }

    pub fn piece_read_interval(&self) -> Duration {
        Duration::from_secs(self.piece_read_interval_secs)
    }

    pub fn stall_window(&self) -> Duration {
        Duration::from_secs(self.stall_window_secs)
    }

    pub fn download_poll_interval(&self) -> Duration {
        Duration::from_secs(self.download_poll_interval_secs)
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline_secs.map(Duration::from_secs)
    }

    pub fn whois_pause(&self) -> Duration {
        Duration::from_secs(self.whois_pause_secs)
    }
}

/// Folder layout of the application, everything hangs off one root.
#[derive(Debug, Clone)]
pub struct Paths {
    pub root: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Paths {
        Paths { root: root.into() }
    }

    /// evidence root
    pub fn evi(&self) -> PathBuf {
        self.root.join("evi")
    }

    /// evidence folders created by registration live here
    pub fn torrent_folder(&self) -> PathBuf {
        self.evi().join("tor")
    }

    /// scratch area for sampling, orphans are swept from here
    pub fn scratch(&self) -> PathBuf {
        self.evi().join("tmp")
    }

    pub fn settings_folder(&self) -> PathBuf {
        self.root.join("settings")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.settings_folder().join("setting.json")
    }

    /// newline separated CIDR list for ip version 4 or 6
    pub fn ip_ranges(&self, version: u8) -> PathBuf {
        let name = if version == 4 { "ipv4.txt" } else { "ipv6.txt" };
        self.settings_folder().join(name)
    }

    pub fn ensure(&self) -> Result<()> {
        for dir in [self.evi(), self.torrent_folder(), self.settings_folder()] {
            std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }
}
