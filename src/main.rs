use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use peer_evidence::clock::SystemClock;
use peer_evidence::config::{Paths, Settings};
use peer_evidence::downloader::Downloader;
use peer_evidence::engine::WireSession;
use peer_evidence::evidence::{find_piece_files, piece_index_from_name, register_torrent};
use peer_evidence::matcher::BinaryMatcher;
use peer_evidence::pipeline::{run_pending, RunContext};
use peer_evidence::poll::{Budget, CancelToken, RealPacer};
use peer_evidence::public_ip::PublicIpResolver;
use peer_evidence::sampler::{distinct_peers, PeerSampler, SampleScope, SampleTarget};
use peer_evidence::session::build_session;
use peer_evidence::torrent::TorrentDescriptor;
use peer_evidence::whois::WhoisLookup;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about = "Collects per-peer piece evidence from BitTorrent swarms.")]
struct Cli {
    /// application folder holding evi/ and settings/
    #[arg(short, long, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// create an evidence folder for a .torrent file
    Register { torrent: PathBuf },
    /// download, sample and collect for every folder marked for processing
    Collect,
    /// download the content of one evidence folder
    Download { folder: PathBuf },
    /// list the seeding peers of one evidence folder
    Sample { folder: PathBuf },
    /// check every saved piece below a folder against the downloaded content
    Match { folder: PathBuf },
    /// print what a .torrent file describes
    Info { torrent: PathBuf },
}

fn init_logging() {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init_timed();
}

fn budget(settings: &Settings, pacer: &RealPacer) -> Budget {
    Budget::with_deadline(CancelToken::new(), pacer, settings.run_deadline())
}

fn download(settings: &Settings, folder: &Path) -> Result<()> {
    let (session, torrent, _) =
        build_session(WireSession::new(settings.port), &folder.join(peer_evidence::SOURCE_TORRENT))?;
    let pacer = RealPacer::new();
    let outcome = Downloader::new(settings, &pacer, &SystemClock).run(
        &session,
        &torrent,
        folder,
        &budget(settings, &pacer),
    )?;
    println!("{:?}", outcome);
    Ok(())
}

fn sample(settings: &Settings, paths: &Paths, folder: &Path) -> Result<()> {
    let (session, torrent, base) =
        build_session(WireSession::new(settings.port), &folder.join(peer_evidence::SOURCE_TORRENT))?;
    let me = PublicIpResolver::new(&settings.public_ipv4_url, &settings.public_ipv6_url, settings.locale).resolve();
    let scope = SampleScope::load(paths, settings.add_all_peers)?;
    let pacer = RealPacer::new();
    let scratch = paths.scratch();
    let observations = PeerSampler::new(settings, &pacer, &SystemClock).sample(
        &session,
        &SampleTarget {
            torrent: &torrent,
            base: &base,
            folder,
            scratch: &scratch,
        },
        &scope,
        &me,
        &budget(settings, &pacer),
    )?;
    for peer in distinct_peers(&observations) {
        println!("{}", peer);
    }
    Ok(())
}

fn match_pieces(folder: &Path) -> Result<()> {
    let matcher = BinaryMatcher::open(&folder.join(peer_evidence::SOURCE_TORRENT))
        .with_context(|| format!("opening the content of {}", folder.display()))?;
    let files = find_piece_files(folder)?;
    let mut mismatches = 0;
    for file in &files {
        let named = file
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(piece_index_from_name);
        let found = matcher.binary_match(file)?;
        match (named, found) {
            (Some(named), Some(found)) if named == found => println!("ok       {}", file.display()),
            (_, Some(found)) => println!("moved    {} (content piece {})", file.display(), found),
            (_, None) => {
                mismatches += 1;
                println!("mismatch {}", file.display());
            }
        }
    }
    println!("{} mismatched of {} pieces", mismatches, files.len());
    Ok(())
}

fn info(torrent: &Path) -> Result<()> {
    let torrent = TorrentDescriptor::from_file(torrent)?;
    println!("name:         {}", torrent.name());
    println!("info hash:    {}", torrent.info_hash_hex());
    println!("total length: {}", torrent.total_length());
    println!("piece length: {}", torrent.piece_length());
    println!("pieces:       {}", torrent.num_pieces());
    if let Some(created_by) = torrent.created_by() {
        println!("created by:   {}", created_by);
    }
    for file in torrent.files() {
        println!("file:         {} ({} bytes)", file.path.display(), file.length);
    }
    for tracker in torrent.trackers() {
        println!("tracker:      {}", tracker);
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let paths = Paths::new(&cli.root);
    paths.ensure()?;
    let settings = Settings::load(&paths.settings_file())?;

    match cli.command {
        Command::Register { torrent } => {
            let folder = register_torrent(&paths.evi(), &torrent, &SystemClock, settings.locale)?;
            println!("{}", folder.display());
        }
        Command::Collect => {
            let me = PublicIpResolver::new(&settings.public_ipv4_url, &settings.public_ipv6_url, settings.locale)
                .resolve();
            let scope = SampleScope::load(&paths, settings.add_all_peers)?;
            let lookup = WhoisLookup::jpnic(&settings.whois_server, settings.locale);
            let pacer = RealPacer::new();
            let ctx = RunContext {
                settings: &settings,
                paths: &paths,
                clock: &SystemClock,
                pacer: &pacer,
                lookup: &lookup,
                me,
                scope: &scope,
            };
            let reports = run_pending(|| Ok(WireSession::new(settings.port)), &ctx, &CancelToken::new())?;
            for (folder, report) in reports {
                println!(
                    "{}: {:?}, {} peers, {} valid pieces",
                    folder.display(),
                    report.download,
                    report.peers.len(),
                    report.valid_pieces()
                );
            }
        }
        Command::Download { folder } => download(&settings, &folder)?,
        Command::Sample { folder } => sample(&settings, &paths, &folder)?,
        Command::Match { folder } => match_pieces(&folder)?,
        Command::Info { torrent } => info(&torrent)?,
    }
    Ok(())
}

fn main() {
    init_logging();
    if let Err(err) = run(Cli::parse()) {
        log::error!("{:#}", err);
        std::process::exit(1);
    }
}
