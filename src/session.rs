/*
src/session.rs

per folder session setup: load the torrent, then give the engine a filter that blocks every peer and lets
only the trackers through. collection and sampling open it up from there.
*/

use crate::engine::Session;
use crate::ip_filter::{build_filter, FilterRules};
use crate::torrent::TorrentDescriptor;
use anyhow::{Context, Result};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use url::Url;

fn tracker_addresses(announce: &str) -> Result<Vec<SocketAddr>> {
    let url = Url::parse(announce).with_context(|| format!("bad tracker url {}", announce))?;
    let host = url
        .host_str()
        .with_context(|| format!("tracker url {} has no host", announce))?;
    let port = url.port_or_known_default().unwrap_or(80);
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let addrs = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolving {}", host))?;
    Ok(addrs.collect())
}

/// Deny everything, then allow each tracker address. Trackers that cannot be
/// parsed or resolved are skipped.
pub fn tracker_rules(torrent: &TorrentDescriptor) -> FilterRules {
    let mut rules = FilterRules::deny_all();
    for announce in torrent.trackers() {
        match tracker_addresses(announce) {
            Ok(addrs) => {
                for addr in addrs {
                    log::debug!("allowing tracker {} ({})", announce, addr.ip());
                    rules = rules.allow_address(addr.ip());
                }
            }
            Err(err) => log::warn!("skipping tracker: {:#}", err),
        }
    }
    rules
}

/// Loads `torrent_path` and installs its tracker-only filter on `session`.
/// Returns the session, the torrent and the rules every later filter starts from.
pub fn build_session<S: Session>(
    session: S,
    torrent_path: &Path,
) -> Result<(S, Arc<TorrentDescriptor>, FilterRules)> {
    let torrent = TorrentDescriptor::from_file(torrent_path)
        .with_context(|| format!("loading {}", torrent_path.display()))?;
    let rules = tracker_rules(&torrent);
    session.set_ip_filter(build_filter(&rules, None));
    Ok((session, Arc::new(torrent), rules))
}
