/*
src/sampler.rs

peer sampling: which peers of the swarm hold the whole content right now.

the torrent is attached in memory mode inside a throwaway folder under evi/tmp, with uploads capped, and the
peer list is polled for a few rounds. a peer qualifies when it is a seed, is not us (our public addresses and
our IPv6 /64), was active in the last second and sits in the configured ranges, unless sampling is
unrestricted. one port per ip per run. sampling stops early when the sample is full or when our own progress
says we are about to become a seed ourselves.
*/

use crate::clock::Clock;
use crate::config::{Paths, Settings};
use crate::engine::{AddTorrentParams, Alert, PeerInfo, Session, StorageMode, TorrentHandle};
use crate::error::EvidenceError;
use crate::ip_filter::{build_filter, FilterRules};
use crate::ip_range::IpRangeSet;
use crate::locale::Text;
use crate::peer_log::LogContext;
use crate::poll::{BoundedPoll, Budget, Pacer};
use crate::public_ip::SelfAddresses;
use crate::roster::{Roster, Sighting};
use crate::torrent::TorrentDescriptor;
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;

/// One sighting of a qualifying peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerObservation {
    pub peer: SocketAddr,
    pub client: String,
    /// bytes per second we received from the peer
    pub down_speed: u64,
    pub up_speed: u64,
    pub last_active: u64,
    pub seed: bool,
    pub seen_at: String,
    /// false once a piece from this peer failed its hash check during the run
    pub intact: bool,
}

/// Which addresses sampling may collect.
#[derive(Debug, Clone, Default)]
pub struct SampleScope {
    pub v4: IpRangeSet,
    pub v6: IpRangeSet,
    pub add_all_peers: bool,
}

impl SampleScope {
    pub fn load(paths: &Paths, add_all_peers: bool) -> Result<SampleScope> {
        Ok(SampleScope {
            v4: IpRangeSet::load(&paths.ip_ranges(4), 4)?,
            v6: IpRangeSet::load(&paths.ip_ranges(6), 6)?,
            add_all_peers,
        })
    }

    /// no range files, or told to take everyone
    pub fn unrestricted(&self) -> bool {
        self.add_all_peers || (self.v4.is_empty() && self.v6.is_empty())
    }

    pub fn admits(&self, ip: IpAddr) -> bool {
        if self.unrestricted() {
            return true;
        }
        match ip {
            IpAddr::V4(_) => self.v4.contains(ip),
            IpAddr::V6(_) => self.v6.contains(ip),
        }
    }

    /// `base` opened up to the sampled ranges, with our own addresses shut again
    pub fn rules(&self, base: &FilterRules, me: &SelfAddresses) -> FilterRules {
        let mut rules = base.clone();
        if self.unrestricted() {
            rules = rules.allow_any();
        } else {
            for net in self.v4.iter().chain(self.v6.iter()) {
                rules = rules.allow_network(net);
            }
        }
        if let Some(v4) = me.v4 {
            rules = rules.deny_address(IpAddr::V4(v4));
        }
        if let Some(net) = me.v6_network() {
            rules = rules.deny_network(&net);
        }
        rules
    }
}

/// The torrent and folders a sampling run works with.
#[derive(Debug, Clone, Copy)]
pub struct SampleTarget<'a> {
    pub torrent: &'a Arc<TorrentDescriptor>,
    pub base: &'a FilterRules,
    pub folder: &'a Path,
    /// shared scratch area; each run makes and removes its own folder in it
    pub scratch: &'a Path,
}

/// every distinct peer of `observations`, first sighting first
pub fn distinct_peers(observations: &[PeerObservation]) -> Vec<SocketAddr> {
    let mut seen = HashSet::new();
    observations
        .iter()
        .map(|o| o.peer)
        .filter(|peer| seen.insert(*peer))
        .collect()
}

pub struct PeerSampler<'a> {
    settings: &'a Settings,
    pacer: &'a dyn Pacer,
    clock: &'a dyn Clock,
}

impl<'a> PeerSampler<'a> {
    pub fn new(settings: &'a Settings, pacer: &'a dyn Pacer, clock: &'a dyn Clock) -> PeerSampler<'a> {
        PeerSampler {
            settings,
            pacer,
            clock,
        }
    }

    fn qualifies(&self, peer: &PeerInfo, scope: &SampleScope, me: &SelfAddresses) -> bool {
        let ip = peer.addr.ip();
        peer.seed
            && !me.is_self(ip)
            && !me.in_self_network(ip)
            && peer.last_active == 0
            && self
                .settings
                .min_peer_up_speed
                .map_or(true, |min| peer.up_speed > min)
            && scope.admits(ip)
    }

    pub fn sample<S: Session>(
        &self,
        session: &S,
        target: &SampleTarget,
        scope: &SampleScope,
        me: &SelfAddresses,
        budget: &Budget,
    ) -> Result<Vec<PeerObservation>> {
        let locale = self.settings.locale;
        let torrent = target.torrent;
        let started_at = self.clock.timestamp();
        if scope.unrestricted() {
            log::info!("{}", locale.text(Text::SamplingUnrestricted));
        }

        session.set_ip_filter(build_filter(&scope.rules(target.base, me), None));
        std::fs::create_dir_all(target.scratch)
            .with_context(|| format!("creating {}", target.scratch.display()))?;
        let scratch = tempfile::Builder::new()
            .prefix("sample-")
            .tempdir_in(target.scratch)
            .context("creating the sampling scratch folder")?;
        let handle = session
            .add_torrent(AddTorrentParams::new(
                torrent.clone(),
                scratch.path(),
                StorageMode::Memory,
            ))
            .with_context(|| format!("attaching {} for sampling", torrent.name()))?;
        handle.set_upload_limit(self.settings.sample_upload_limit);

        let mut observations: Vec<PeerObservation> = Vec::new();
        let mut ports: HashMap<IpAddr, u16> = HashMap::new();
        let mut corrupt: HashSet<SocketAddr> = HashSet::new();
        let poll = BoundedPoll::new(self.settings.sample_round_interval(), self.settings.sample_rounds);
        poll.run(self.pacer, budget, |round| {
            for alert in session.pop_alerts() {
                if let Alert::HashFailed { peer, .. } = alert {
                    corrupt.insert(peer);
                }
            }
            let status = match handle.status() {
                Ok(status) => status,
                Err(err) => {
                    log::warn!("{}: {:#}", locale.text(Text::SamplingRoundFailed), err);
                    return ControlFlow::Break(());
                }
            };
            if status.progress >= self.settings.self_seed_abort_ratio {
                log::info!(
                    "{} ({:.0}%)",
                    locale.text(Text::SamplingProgressAbort),
                    status.progress * 100.0
                );
                return ControlFlow::Break(());
            }
            let peers = match handle.peer_info() {
                Ok(peers) => peers,
                Err(err) => {
                    log::warn!("{}: {:#}", locale.text(Text::SamplingRoundFailed), err);
                    return ControlFlow::Break(());
                }
            };

            let seen_at = self.clock.timestamp();
            for peer in peers.iter().filter(|p| self.qualifies(p, scope, me)) {
                let ip = peer.addr.ip();
                if ports.get(&ip).is_some_and(|port| *port != peer.addr.port()) {
                    continue;
                }
                ports.insert(ip, peer.addr.port());
                observations.push(PeerObservation {
                    peer: peer.addr,
                    client: peer.client.clone(),
                    down_speed: peer.down_speed,
                    up_speed: peer.up_speed,
                    last_active: peer.last_active,
                    seed: peer.seed,
                    seen_at: seen_at.clone(),
                    intact: !corrupt.contains(&peer.addr),
                });
            }
            log::debug!(
                "round {}: {} peers listed, {} collected",
                round + 1,
                peers.len(),
                ports.len()
            );
            if ports.len() >= self.settings.max_list_size {
                log::info!("{}", locale.text(Text::SamplingLimitReached));
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        });

        session.remove_torrent(&handle);
        session.set_ip_filter(build_filter(target.base, None));
        log::info!("{}", locale.text(Text::SamplingScratchCleanup));
        if let Err(err) = scratch.close() {
            log::warn!("{}: {}", locale.text(Text::SamplingScratchCleanupFailed), err);
        }
        log::info!("{}: {}", locale.text(Text::SamplingPeerCount), ports.len());
        if observations.is_empty() {
            log::info!("{}", locale.text(Text::NoPeers));
            return Ok(observations);
        }

        log::info!("{}", locale.text(Text::SamplingWritingLogs));
        self.record(target, &started_at, &observations)?;
        Ok(observations)
    }

    /// roster rows and sampling log lines for every observation
    fn record(&self, target: &SampleTarget, started_at: &str, observations: &[PeerObservation]) -> Result<()> {
        let locale = self.settings.locale;
        let info_hash = target.torrent.info_hash_hex();
        let roster = Roster::for_torrent(target.folder, &info_hash, locale);
        let ctx = LogContext {
            file_name: target.torrent.name(),
            info_hash_hex: &info_hash,
            started_at,
            version: &self.settings.version,
            locale,
        };
        for observation in observations {
            let sighting = Sighting {
                peer: observation.peer,
                provider: None,
                valid_piece: false,
                seen_at: &observation.seen_at,
            };
            match roster.record(&sighting) {
                Ok(()) => {}
                Err(EvidenceError::PermissionDenied(path)) => {
                    log::warn!("{} ({})", locale.text(Text::RosterPermission), path.display());
                }
                Err(err) => return Err(err).context("updating the peer roster"),
            }
            let log = ctx.sampling_log(target.folder, observation.peer);
            log.append(
                || ctx.sampling_header(observation.peer, &observation.client),
                &ctx.sampling_line(
                    &observation.seen_at,
                    &observation.client,
                    observation.down_speed,
                    observation.intact,
                ),
            )
            .with_context(|| format!("writing {}", log.path().display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::engine::fake::{allowed, peer, status, FakeSession};
    use crate::fixtures::{content, single_file_torrent};
    use crate::locale::Locale;
    use crate::poll::ManualPacer;

    struct Run {
        evi: tempfile::TempDir,
        torrent: Arc<TorrentDescriptor>,
        base: FilterRules,
        settings: Settings,
    }

    impl Run {
        fn new() -> Run {
            let bytes = single_file_torrent("movie.mp4", &content(500), 64, &[]);
            Run {
                evi: tempfile::tempdir().unwrap(),
                torrent: Arc::new(TorrentDescriptor::from_bytes(&bytes).unwrap()),
                base: FilterRules::deny_all().allow_address("192.0.2.80".parse().unwrap()),
                settings: Settings {
                    locale: Locale::En,
                    ..Settings::default()
                },
            }
        }

        fn scratch(&self) -> std::path::PathBuf {
            self.evi.path().join("tmp")
        }

        fn sample(&self, session: &FakeSession, scope: &SampleScope, me: &SelfAddresses) -> Vec<PeerObservation> {
            let pacer = ManualPacer::new();
            let clock = FixedClock::from_rfc3339("2024-05-01T13:45:10.123+09:00").unwrap();
            let scratch = self.scratch();
            let target = SampleTarget {
                torrent: &self.torrent,
                base: &self.base,
                folder: self.evi.path(),
                scratch: &scratch,
            };
            PeerSampler::new(&self.settings, &pacer, &clock)
                .sample(session, &target, scope, me, &Budget::unlimited())
                .unwrap()
        }
    }

    fn me() -> SelfAddresses {
        SelfAddresses {
            v4: Some("198.51.100.7".parse().unwrap()),
            v6: Some("2001:db8:ffff::1".parse().unwrap()),
        }
    }

    fn ranged() -> SampleScope {
        SampleScope {
            v4: IpRangeSet::parse("203.0.113.0/24\n198.51.100.0/24\n", 4),
            v6: IpRangeSet::parse("2001:db8::/32\n", 6),
            add_all_peers: false,
        }
    }

    fn swarm() -> Vec<PeerInfo> {
        vec![
            peer("198.51.100.7:6881", true, 0),      // us
            peer("[2001:db8:ffff::1]:6881", true, 0), // us over v6
            peer("[2001:db8:ffff::2]:6881", true, 0), // our other device
            peer("203.0.113.10:6881", false, 0),      // not a seed
            peer("203.0.113.11:6881", true, 4),       // idle
            peer("8.8.8.8:6881", true, 0),            // outside the ranges
            peer("203.0.113.12:6881", true, 0),
            peer("[2001:db8:1::5]:51413", true, 0),
        ]
    }

    fn peers_of(observations: &[PeerObservation]) -> Vec<String> {
        distinct_peers(observations).iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn self_and_out_of_range_peers_are_never_sampled() {
        let run = Run::new();
        let session = FakeSession::new()
            .with_statuses(vec![status(0.0)])
            .with_peer_rounds(vec![swarm()]);
        let observations = run.sample(&session, &ranged(), &me());

        assert_eq!(peers_of(&observations), vec!["203.0.113.12:6881", "[2001:db8:1::5]:51413"]);
        // every round re-observes them
        assert_eq!(observations.len(), 2 * run.settings.sample_rounds);
        assert_eq!(session.added()[0].storage, StorageMode::Memory);
        assert_eq!(session.upload_limits(), vec![run.settings.sample_upload_limit]);

        let filter = &session.filters()[0];
        let candidates = [
            "192.0.2.80:80",
            "203.0.113.12:1",
            "198.51.100.7:1",
            "198.51.100.8:1",
            "8.8.8.8:1",
            "[2001:db8:ffff::9]:1",
        ];
        let expected: Vec<SocketAddr> = ["192.0.2.80:80", "203.0.113.12:1", "198.51.100.8:1"]
            .iter()
            .map(|a| a.parse().unwrap())
            .collect();
        assert_eq!(allowed(filter, &candidates), expected);
    }

    #[test]
    fn slow_uploaders_are_skipped_only_when_configured() {
        let mut run = Run::new();
        let busy = PeerInfo {
            up_speed: 4096,
            ..peer("203.0.113.13:6881", true, 0)
        };
        let edge = PeerInfo {
            up_speed: 20,
            ..peer("203.0.113.14:6881", true, 0)
        };
        let rounds = vec![vec![peer("203.0.113.12:6881", true, 0), edge, busy]];

        let session = FakeSession::new()
            .with_statuses(vec![status(0.0)])
            .with_peer_rounds(rounds.clone());
        assert_eq!(peers_of(&run.sample(&session, &ranged(), &me())).len(), 3);

        run.settings.min_peer_up_speed = Some(20);
        let session = FakeSession::new()
            .with_statuses(vec![status(0.0)])
            .with_peer_rounds(rounds);
        assert_eq!(peers_of(&run.sample(&session, &ranged(), &me())), vec!["203.0.113.13:6881"]);
    }

    #[test]
    fn empty_ranges_accept_any_seed_but_not_us() {
        let run = Run::new();
        let session = FakeSession::new()
            .with_statuses(vec![status(0.0)])
            .with_peer_rounds(vec![swarm()]);
        let scope = SampleScope::default();
        assert!(scope.unrestricted());
        let observations = run.sample(&session, &scope, &me());
        assert_eq!(
            peers_of(&observations),
            vec!["8.8.8.8:6881", "203.0.113.12:6881", "[2001:db8:1::5]:51413"]
        );
    }

    #[test]
    fn one_port_per_ip_and_one_roster_row_per_peer() {
        let run = Run::new();
        let session = FakeSession::new()
            .with_statuses(vec![status(0.0)])
            .with_peer_rounds(vec![
                vec![peer("203.0.113.12:6881", true, 0)],
                vec![peer("203.0.113.12:7000", true, 0), peer("203.0.113.12:6881", true, 0)],
            ]);
        let observations = run.sample(&session, &ranged(), &SelfAddresses::none());
        assert_eq!(peers_of(&observations), vec!["203.0.113.12:6881"]);
        assert_eq!(observations.len(), run.settings.sample_rounds);

        let roster = Roster::for_torrent(run.evi.path(), &run.torrent.info_hash_hex(), Locale::En);
        let rows = roster.rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].valid_count, "0");
        let log = std::fs::read_to_string(
            run.evi
                .path()
                .join("peers")
                .join(format!("203.0.113.12_6881_{}.log", run.torrent.info_hash_hex())),
        )
        .unwrap();
        assert_eq!(log.matches("KB/s").count(), run.settings.sample_rounds);
    }

    #[test]
    fn stops_when_we_are_about_to_seed() {
        let run = Run::new();
        let session = FakeSession::new()
            .with_statuses(vec![status(0.1), status(0.7)])
            .with_peer_rounds(vec![swarm()]);
        let observations = run.sample(&session, &ranged(), &me());
        assert_eq!(session.peer_calls(), 1);
        assert_eq!(observations.len(), 2);
    }

    #[test]
    fn stops_when_the_sample_is_full() {
        let mut run = Run::new();
        run.settings.max_list_size = 1;
        let session = FakeSession::new()
            .with_statuses(vec![status(0.0)])
            .with_peer_rounds(vec![swarm()]);
        let observations = run.sample(&session, &ranged(), &me());
        assert_eq!(session.peer_calls(), 1);
        // the round that filled the sample is kept whole
        assert_eq!(observations.len(), 2);
    }

    #[test]
    fn failure_keeps_partial_results_and_cleans_scratch() {
        let run = Run::new();
        let session = FakeSession::new()
            .with_statuses(vec![status(0.0)])
            .with_peer_rounds(vec![vec![peer("203.0.113.12:6881", true, 0)]])
            .failing_peers_after(2);
        let observations = run.sample(&session, &ranged(), &me());
        assert_eq!(observations.len(), 2);
        assert_eq!(session.removed(), 1);
        assert_eq!(std::fs::read_dir(run.scratch()).unwrap().count(), 0);
        assert!(!session.filters().last().unwrap().is_allowed("203.0.113.12".parse().unwrap()));
    }

    #[test]
    fn hash_failures_mark_the_peer() {
        let run = Run::new();
        let session = FakeSession::new()
            .with_statuses(vec![status(0.0)])
            .with_peer_rounds(vec![vec![peer("203.0.113.12:6881", true, 0)]])
            .with_alerts(vec![Alert::HashFailed {
                index: 0,
                peer: "203.0.113.12:6881".parse().unwrap(),
            }]);
        let observations = run.sample(&session, &ranged(), &me());
        assert!(observations.iter().all(|o| !o.intact));
    }
}
