pub mod bitfield;
pub mod clock;
pub mod collector;
pub mod config;
pub mod downloader;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod ip_filter;
pub mod ip_range;
pub mod locale;
pub mod matcher;
pub mod peer_log;
pub mod pipeline;
pub mod poll;
pub mod public_ip;
pub mod roster;
pub mod sampler;
pub mod session;
pub mod storage;
pub mod torrent;
pub mod utils;
pub mod whois;

pub mod tracker {
    pub mod http;
    pub mod udp;
}

pub mod peer {
    pub mod connection;
    pub mod message;
}

#[cfg(test)]
pub(crate) mod fixtures;

/// name of the torrent file inside every evidence folder
pub const SOURCE_TORRENT: &str = "source.torrent";
