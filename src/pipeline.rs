/*
src/pipeline.rs

one evidence folder end to end: tracker-only session, main download, peer sampling, then one piece from each
sampled peer. the cancel token and the run deadline are checked between every step.
*/

use crate::clock::Clock;
use crate::collector::{CollectOutcome, CollectTarget, PieceCollector};
use crate::config::{Paths, Settings};
use crate::downloader::{DownloadOutcome, Downloader};
use crate::engine::Session;
use crate::evidence::{pending_folders, sweep_scratch};
use crate::locale::Text;
use crate::matcher::BinaryMatcher;
use crate::poll::{Budget, CancelToken, Pacer};
use crate::public_ip::SelfAddresses;
use crate::sampler::{distinct_peers, PeerSampler, SampleScope, SampleTarget};
use crate::session::build_session;
use crate::whois::ProviderLookup;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Everything a run needs besides the engine session.
pub struct RunContext<'a> {
    pub settings: &'a Settings,
    pub paths: &'a Paths,
    pub clock: &'a dyn Clock,
    pub pacer: &'a dyn Pacer,
    pub lookup: &'a dyn ProviderLookup,
    pub me: SelfAddresses,
    pub scope: &'a SampleScope,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FolderReport {
    pub download: DownloadOutcome,
    pub peers: Vec<SocketAddr>,
    pub collected: Vec<(SocketAddr, CollectOutcome)>,
}

impl FolderReport {
    fn new(download: DownloadOutcome) -> FolderReport {
        FolderReport {
            download,
            peers: Vec::new(),
            collected: Vec::new(),
        }
    }

    pub fn valid_pieces(&self) -> usize {
        self.collected
            .iter()
            .filter(|(_, outcome)| {
                matches!(outcome, CollectOutcome::Recorded { verdict, .. } if verdict.is_valid())
            })
            .count()
    }
}

pub fn run_folder<S: Session>(
    session: S,
    folder: &Path,
    ctx: &RunContext,
    budget: &Budget,
) -> Result<FolderReport> {
    let locale = ctx.settings.locale;
    let source = folder.join(crate::SOURCE_TORRENT);
    let (session, torrent, base) = build_session(session, &source)?;
    log::info!("{} ({})", folder.display(), torrent.name());

    let download =
        Downloader::new(ctx.settings, ctx.pacer, ctx.clock).run(&session, &torrent, folder, budget)?;
    let mut report = FolderReport::new(download);
    if !download.succeeded() || budget.interrupted::<()>(ctx.pacer).is_some() {
        return Ok(report);
    }

    let matcher = BinaryMatcher::open(&source)
        .with_context(|| format!("opening the content of {}", folder.display()))?;
    let scratch = ctx.paths.scratch();
    sweep_scratch(&scratch);
    let observations = PeerSampler::new(ctx.settings, ctx.pacer, ctx.clock).sample(
        &session,
        &SampleTarget {
            torrent: &torrent,
            base: &base,
            folder,
            scratch: &scratch,
        },
        ctx.scope,
        &ctx.me,
        budget,
    )?;
    report.peers = distinct_peers(&observations);
    if report.peers.is_empty() {
        return Ok(report);
    }

    let collector = PieceCollector::new(ctx.settings, ctx.pacer, ctx.clock, ctx.lookup);
    let target = CollectTarget {
        torrent: &torrent,
        base: &base,
        folder,
        matcher: &matcher,
    };
    for peer in report.peers.clone() {
        if budget.interrupted::<()>(ctx.pacer).is_some() {
            log::info!("collection of {} interrupted", folder.display());
            return Ok(report);
        }
        let outcome = match collector.collect(&session, &target, peer, budget) {
            Ok(outcome) => outcome,
            Err(err) => {
                log::warn!("collecting from {}: {:#}", peer, err);
                CollectOutcome::Failed(format!("{:#}", err))
            }
        };
        let interrupted = outcome == CollectOutcome::Interrupted;
        report.collected.push((peer, outcome));
        if interrupted {
            return Ok(report);
        }
    }
    log::info!(
        "{} ({}/{})",
        locale.text(Text::CollectionDone),
        report.valid_pieces(),
        report.peers.len()
    );
    Ok(report)
}

/// Runs every folder carrying a `.process` marker, each with a fresh session
/// and its own run deadline. A failing folder is logged and the next one is tried.
pub fn run_pending<S: Session>(
    mut new_session: impl FnMut() -> Result<S>,
    ctx: &RunContext,
    cancel: &CancelToken,
) -> Result<Vec<(PathBuf, FolderReport)>> {
    let mut reports = Vec::new();
    for folder in pending_folders(&ctx.paths.evi())? {
        if cancel.is_cancelled() {
            break;
        }
        let budget = Budget::with_deadline(cancel.clone(), ctx.pacer, ctx.settings.run_deadline());
        match run_folder(new_session()?, &folder, ctx, &budget) {
            Ok(report) => reports.push((folder, report)),
            Err(err) => log::error!("{}: {:#}", folder.display(), err),
        }
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::collector::PieceVerdict;
    use crate::engine::fake::{peer, status, status_done, FakeSession};
    use crate::evidence::PROCESS_MARKER;
    use crate::fixtures::{content, evidence_folder};
    use crate::locale::Locale;
    use crate::poll::ManualPacer;
    use crate::roster::Roster;
    use crate::torrent::TorrentDescriptor;
    use crate::whois::StaticLookup;

    const PIECE: usize = 64;

    struct Env {
        root: tempfile::TempDir,
        paths: Paths,
        settings: Settings,
        clock: FixedClock,
        pacer: ManualPacer,
        lookup: StaticLookup,
        scope: SampleScope,
    }

    impl Env {
        fn new() -> Env {
            let root = tempfile::tempdir().unwrap();
            let paths = Paths::new(root.path());
            paths.ensure().unwrap();
            Env {
                root,
                paths,
                settings: Settings {
                    locale: Locale::En,
                    sample_rounds: 2,
                    ..Settings::default()
                },
                clock: FixedClock::from_rfc3339("2024-05-01T13:45:10.123+09:00").unwrap(),
                pacer: ManualPacer::new(),
                lookup: StaticLookup("Example ISP".to_string()),
                scope: SampleScope::default(),
            }
        }

        fn ctx(&self) -> RunContext<'_> {
            RunContext {
                settings: &self.settings,
                paths: &self.paths,
                clock: &self.clock,
                pacer: &self.pacer,
                lookup: &self.lookup,
                me: SelfAddresses::none(),
                scope: &self.scope,
            }
        }

        fn folder(&self, name: &str, data: &[u8]) -> PathBuf {
            let folder = self.paths.evi().join("tor").join(name);
            std::fs::create_dir_all(&folder).unwrap();
            evidence_folder(&folder, "movie.mp4", data, PIECE);
            std::fs::write(folder.join(PROCESS_MARKER), b"").unwrap();
            folder
        }
    }

    fn honest_swarm(data: Vec<u8>) -> FakeSession {
        FakeSession::new()
            .with_statuses(vec![status(0.0)])
            .with_peer_rounds(vec![vec![
                peer("203.0.113.5:6881", true, 0),
                peer("203.0.113.6:51413", true, 0),
            ]])
            .answering(move |index| {
                let start = index * PIECE;
                data[start..(start + PIECE).min(data.len())].to_vec()
            })
    }

    #[test]
    fn samples_then_collects_from_each_peer() {
        let env = Env::new();
        let data = content(PIECE * 5);
        let folder = env.folder("a", &data);
        let session = honest_swarm(data);

        let report = run_folder(session.clone(), &folder, &env.ctx(), &Budget::unlimited()).unwrap();
        assert_eq!(report.download, DownloadOutcome::AlreadyComplete);
        assert_eq!(report.peers.len(), 2);
        assert_eq!(report.valid_pieces(), 2);
        assert!(report
            .collected
            .iter()
            .all(|(_, o)| matches!(o, CollectOutcome::Recorded { verdict: PieceVerdict::Valid, .. })));

        let torrent = TorrentDescriptor::from_file(folder.join(crate::SOURCE_TORRENT)).unwrap();
        let rows = Roster::for_torrent(&folder, &torrent.info_hash_hex(), Locale::En)
            .rows()
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.valid_count == "1" && row.provider == "Example ISP"));
        // sampling attached once, then one attach per peer
        assert_eq!(session.added().len(), 3);
    }

    #[test]
    fn one_peer_failing_does_not_stop_the_others() {
        let env = Env::new();
        let data = content(PIECE * 5);
        let folder = env.folder("a", &data);
        // the first peer's evidence directory cannot be created
        std::fs::write(folder.join("203.0.113.5_6881"), b"").unwrap();
        let session = honest_swarm(data);

        let report = run_folder(session.clone(), &folder, &env.ctx(), &Budget::unlimited()).unwrap();
        assert_eq!(report.collected.len(), 2);
        let outcome = |addr: &str| {
            let addr: SocketAddr = addr.parse().unwrap();
            report
                .collected
                .iter()
                .find(|(peer, _)| *peer == addr)
                .map(|(_, outcome)| outcome.clone())
                .unwrap()
        };
        assert!(matches!(outcome("203.0.113.5:6881"), CollectOutcome::Failed(_)));
        assert!(matches!(
            outcome("203.0.113.6:51413"),
            CollectOutcome::Recorded { verdict: PieceVerdict::Valid, .. }
        ));
        assert_eq!(report.valid_pieces(), 1);
        assert!(folder.join("203.0.113.6_51413").is_dir());
    }

    #[test]
    fn stalled_download_skips_sampling() {
        let env = Env::new();
        let data = content(PIECE * 5);
        let folder = env.folder("a", &data);
        std::fs::remove_file(folder.join("movie.mp4")).unwrap();
        let session = FakeSession::new().with_statuses(vec![status_done(0)]);

        let report = run_folder(session.clone(), &folder, &env.ctx(), &Budget::unlimited()).unwrap();
        assert_eq!(report.download, DownloadOutcome::Stalled);
        assert!(report.peers.is_empty());
        assert_eq!(session.peer_calls(), 0);
    }

    #[test]
    fn cancelled_run_stops_after_download() {
        let env = Env::new();
        let data = content(PIECE * 5);
        let folder = env.folder("a", &data);
        let session = honest_swarm(data);
        let cancel = CancelToken::new();
        cancel.cancel();
        let budget = Budget::with_deadline(cancel, &env.pacer, None);

        let report = run_folder(session.clone(), &folder, &env.ctx(), &budget).unwrap();
        assert_eq!(report.download, DownloadOutcome::AlreadyComplete);
        assert!(report.collected.is_empty());
        assert_eq!(session.peer_calls(), 0);
    }

    #[test]
    fn pending_folders_run_in_turn_and_failures_do_not_stop_the_rest() {
        let env = Env::new();
        let data = content(PIECE * 5);
        env.folder("a", &data);
        let broken = env.paths.evi().join("tor").join("b");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join(PROCESS_MARKER), b"").unwrap();
        env.folder("c", &data);

        let mut sessions = 0;
        let reports = run_pending(
            || {
                sessions += 1;
                Ok(honest_swarm(data.clone()))
            },
            &env.ctx(),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(sessions, 3);
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|(_, report)| report.valid_pieces() == 2));
        assert!(env.root.path().join("evi/tmp").is_dir());
    }
}
