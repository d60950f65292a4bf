use chordtorrent::cli::{Cli, Command};
use chordtorrent::client::orchestrator::{self, UploadRegistry};
use chordtorrent::error::{Error, UsageError};
use chordtorrent::torrent::Torrent;
use chordtorrent::utils;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::from(0),
        Err(Error::Usage(UsageError(message))) => {
            eprintln!("usage error: {message}");
            ExitCode::from(1)
        }
        Err(e) => {
            eprintln!("fatal error: {e}");
            ExitCode::from(2)
        }
    }
}

fn run(command: Command) -> Result<(), Error> {
    match command {
        Command::ConnectTr { addr, bootstrap, m, store } => {
            let bind: std::net::SocketAddr = parse_addr(&addr)?;
            let bootstrap_addr = bootstrap.map(|b| parse_addr(&b)).transpose()?;
            let tracker = orchestrator::bootstrap_tracker(bind, m, bootstrap_addr, std::path::Path::new(&store))?;
            log::info!("tracker node {} is up (id {})", tracker.node.addr, tracker.node.id);
            park_forever();
        }
        Command::GetTorrent { tracker, info_hash } => {
            let tracker_addr = parse_addr(&tracker)?;
            let client = orchestrator::TrackerClient::new(tracker_addr);
            let record = client.get_torrent(&info_hash)?;
            println!("{}", serde_json::to_string_pretty(&record).unwrap_or_default());
        }
        Command::Download { tracker, info_hash, output } => {
            let tracker_addr = parse_addr(&tracker)?;
            let peer_id = utils::generate_peer_id();
            orchestrator::fetch(&info_hash, tracker_addr, peer_id, std::path::Path::new(&output))?;
            println!("download complete: {output}");
        }
        Command::CreateTorrent { path, piece_length, announce } => {
            let data = std::fs::read(&path)?;
            let hashes = hash_pieces(&data, piece_length);
            let name = std::path::Path::new(&path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unnamed".to_string());
            let torrent = Torrent::new(name, data.len() as i64, piece_length, &hashes, announce);
            let torrent_path = std::path::Path::new(&path).with_extension("torrent");
            torrent
                .save(&torrent_path)
                .map_err(|e| Error::Metainfo(e.to_string()))?;
            println!("wrote {}", torrent_path.display());
        }
        Command::UploadTorrent { torrent, tracker, listen } => {
            let tracker_addr = parse_addr(&tracker)?;
            let listen_addr = parse_addr(&listen)?;
            let torrent = Torrent::from_path(std::path::Path::new(&torrent))
                .map_err(|e| Error::Metainfo(e.to_string()))?;
            let peer_id = utils::generate_peer_id();
            let client = orchestrator::TrackerClient::new(tracker_addr);
            client.register_torrent(&torrent, peer_id, listen_addr.port())?;
            println!("announced {} to {tracker}", torrent.info_hash_hex());
        }
        Command::StartSeeding { path, piece_length, tracker, listen, announce } => {
            let tracker_addr = parse_addr(&tracker)?;
            let listen_addr = parse_addr(&listen)?;
            let registry = Arc::new(UploadRegistry::new());
            let torrent = orchestrator::create_and_seed(
                std::path::Path::new(&path),
                piece_length,
                announce,
                tracker_addr,
                listen_addr,
                registry,
            )?;
            log::info!("seeding {} ({})", torrent.name(), torrent.info_hash_hex());
            park_forever();
        }
        Command::DropTracker => {
            println!("drop_tracker: graceful ring leave is not modelled; terminate the process to leave.");
        }
        Command::Exit => {}
    }
    Ok(())
}

fn parse_addr(s: &str) -> Result<std::net::SocketAddr, Error> {
    s.parse()
        .map_err(|_| Error::Usage(UsageError(format!("invalid address: {s}"))))
}

fn hash_pieces(data: &[u8], piece_length: i64) -> Vec<[u8; 20]> {
    use sha1::{Digest, Sha1};
    data.chunks(piece_length as usize)
        .map(|chunk| {
            let mut hasher = Sha1::new();
            hasher.update(chunk);
            hasher.finalize().into()
        })
        .collect()
}

fn park_forever() {
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}
