//! Operator surface (spec §6): `clap` derive subcommands, one process
//! invocation per command rather than an interactive console.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "chordtorrent", about = "BitTorrent-style file sharing over a Chord tracker ring")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start (or join) a tracker ring node and serve its RPC port.
    ConnectTr {
        /// Address (ip:port) this tracker node listens on.
        #[arg(long)]
        addr: String,
        /// An existing ring member to join through; omit to start a fresh ring.
        #[arg(long)]
        bootstrap: Option<String>,
        #[arg(long, default_value_t = crate::chord::node::DEFAULT_M)]
        m: u32,
        #[arg(long, default_value = "tracker/database/tracker_data.json")]
        store: String,
    },
    /// Look up a torrent's metadata and peer set by info_hash.
    GetTorrent {
        #[arg(long)]
        tracker: String,
        info_hash: String,
    },
    /// Download a torrent's content, given its info_hash.
    Download {
        #[arg(long)]
        tracker: String,
        info_hash: String,
        output: String,
    },
    /// Hash a file into a .torrent metainfo file next to it.
    CreateTorrent {
        path: String,
        #[arg(long, default_value_t = 256 * 1024)]
        piece_length: i64,
        #[arg(long)]
        announce: Option<String>,
    },
    /// Announce an already-created .torrent's metadata to the tracker.
    UploadTorrent {
        torrent: String,
        #[arg(long)]
        tracker: String,
        #[arg(long)]
        listen: String,
    },
    /// Hash, register, and start serving a file's content to peers.
    StartSeeding {
        path: String,
        #[arg(long, default_value_t = 256 * 1024)]
        piece_length: i64,
        #[arg(long)]
        tracker: String,
        #[arg(long)]
        listen: String,
        #[arg(long)]
        announce: Option<String>,
    },
    /// Leave the tracker ring gracefully (best-effort; see spec §9 open question).
    DropTracker,
    /// No-op, present for operator-surface parity with the interactive console.
    Exit,
}
