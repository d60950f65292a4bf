//! Piece controller (C3, spec §4.3): the concurrent scheduler that drives a
//! torrent from empty to complete. Owns the piece array, the completion
//! bitfield, and the output file behind one mutex, per spec §5.

use crate::bitfield::BitField;
use crate::error::IntegrityError;
use crate::piece::piece::Piece;
use bytes::Bytes;
use crossbeam::channel::{bounded, select, tick, Sender};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Default age after which an IN_FLIGHT block is considered abandoned and
/// released back to EMPTY by the reaper (spec §5).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

struct Shared {
    pieces: Vec<Piece>,
    bitfield: BitField,
    file: File,
}

pub struct PieceController {
    shared: Mutex<Shared>,
    piece_length: u64,
    request_timeout: Duration,
}

/// Block of work handed out by [`PieceController::pick_work`].
#[derive(Debug, Clone, Copy)]
pub struct Work {
    pub piece_index: usize,
    pub block_index: usize,
    pub begin: u32,
    pub length: u32,
}

/// Outcome of integrating a freshly-downloaded block.
#[derive(Debug, PartialEq)]
pub enum ReceiveOutcome {
    /// The piece still has outstanding blocks.
    Pending,
    /// The piece completed and passed its SHA-1 check; it has been written to disk.
    PieceComplete,
    /// The piece completed but failed its SHA-1 check; it was reset to EMPTY
    /// and must be rescheduled. The caller should exclude the peer that
    /// supplied the bad data from the piece's next round.
    IntegrityFailed(IntegrityError),
}

impl PieceController {
    pub fn new(
        piece_sizes: &[usize],
        piece_hashes: &[[u8; 20]],
        piece_length: u64,
        output_path: &Path,
    ) -> std::io::Result<PieceController> {
        let pieces: Vec<Piece> = piece_sizes
            .iter()
            .zip(piece_hashes.iter())
            .enumerate()
            .map(|(i, (&size, &hash))| Piece::new(i, size, hash))
            .collect();
        let bitfield = BitField::for_pieces(pieces.len());

        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(output_path)?;

        Ok(PieceController {
            shared: Mutex::new(Shared {
                pieces,
                bitfield,
                file,
            }),
            piece_length,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.shared.lock().unwrap().pieces.len()
    }

    pub fn bitfield(&self) -> BitField {
        self.shared.lock().unwrap().bitfield.clone()
    }

    pub fn has_piece(&self, piece_index: usize) -> bool {
        self.shared.lock().unwrap().bitfield.has_piece(piece_index)
    }

    /// Returns the first EMPTY block of `piece_index`, marking it IN_FLIGHT.
    /// Callers iterate the piece array themselves and prefer pieces with
    /// remaining EMPTY blocks; this call only ever touches one piece.
    pub fn pick_work(&self, piece_index: usize) -> Option<Work> {
        let mut shared = self.shared.lock().unwrap();
        let piece = shared.pieces.get_mut(piece_index)?;
        if piece.is_downloaded {
            return None;
        }
        let block_index = piece
            .blocks
            .iter()
            .position(|b| b.state == crate::piece::block::BlockState::Empty)?;
        let begin = block_index as u32 * crate::piece::block::BLOCK_SIZE;
        let length = piece.blocks[block_index].size;
        piece.blocks[block_index].mark_in_flight();
        Some(Work {
            piece_index,
            block_index,
            begin,
            length,
        })
    }

    /// Integrates a downloaded block. If the piece becomes complete, runs
    /// `try_finalise` and, on success, writes it to disk and flips the
    /// bitfield bit.
    pub fn receive_block(
        &self,
        piece_index: usize,
        block_index: usize,
        data: Bytes,
    ) -> ReceiveOutcome {
        let mut shared = self.shared.lock().unwrap();
        let Shared {
            pieces,
            bitfield,
            file,
        } = &mut *shared;

        let piece = match pieces.get_mut(piece_index) {
            Some(p) => p,
            None => return ReceiveOutcome::Pending,
        };
        piece.set_block(block_index, data);

        if !piece.is_complete() {
            return ReceiveOutcome::Pending;
        }

        if piece.try_finalise() {
            if let Err(e) = piece.save(file, self.piece_length) {
                log::error!("failed to write piece {piece_index} to disk: {e}");
            }
            bitfield.set(piece_index);
            log::info!("piece {piece_index} complete and verified");
            ReceiveOutcome::PieceComplete
        } else {
            log::warn!("piece {piece_index} failed integrity check, resetting");
            ReceiveOutcome::IntegrityFailed(IntegrityError { piece_index })
        }
    }

    pub fn is_complete(&self) -> bool {
        self.shared.lock().unwrap().bitfield.is_complete()
    }

    /// Immediately releases a block back to EMPTY, independent of the
    /// reaper's timeout. Used when a session is declared faulty (no PIECE
    /// within the read timeout, or a transport error) so the block is
    /// rescheduled without waiting for the next reap (spec §5).
    pub fn release_block(&self, piece_index: usize, block_index: usize) {
        let mut shared = self.shared.lock().unwrap();
        if let Some(piece) = shared.pieces.get_mut(piece_index) {
            if let Some(block) = piece.blocks.get_mut(block_index) {
                block.reset();
            }
        }
    }

    /// Releases any IN_FLIGHT block whose request is older than the configured
    /// timeout back to EMPTY. Intended to run on its own periodic thread.
    pub fn reap_stale_requests(&self) -> usize {
        let mut shared = self.shared.lock().unwrap();
        let now = Instant::now();
        let timeout = self.request_timeout;
        let mut released = 0;
        for piece in shared.pieces.iter_mut() {
            if piece.is_downloaded {
                continue;
            }
            for block in piece.blocks.iter_mut() {
                if block.state == crate::piece::block::BlockState::InFlight {
                    if let Some(requested_at) = block.requested_at {
                        if now.duration_since(requested_at) > timeout {
                            block.reset();
                            released += 1;
                        }
                    }
                }
            }
        }
        released
    }

    /// Spawns a background thread that periodically calls [`reap_stale_requests`].
    /// Returns a [`ReaperHandle`]; dropping it signals the thread to stop and
    /// joins it, rather than relying on the thread to notice its own demise.
    pub fn spawn_reaper(controller: Arc<PieceController>, period: Duration) -> ReaperHandle {
        let (stop_tx, stop_rx) = bounded(0);
        let thread = std::thread::spawn(move || {
            let ticks = tick(period);
            loop {
                select! {
                    recv(ticks) -> _ => {
                        let released = controller.reap_stale_requests();
                        if released > 0 {
                            log::debug!("reaper released {released} stale in-flight blocks");
                        }
                        if controller.is_complete() {
                            return;
                        }
                    }
                    recv(stop_rx) -> _ => return,
                }
            }
        });
        ReaperHandle {
            thread: Some(thread),
            stop: stop_tx,
        }
    }
}

/// Handle to a running reaper thread. Dropping it asks the thread to stop
/// and blocks until it has (spec §5: the reaper must not outlive the fetch
/// it was started for).
pub struct ReaperHandle {
    thread: Option<std::thread::JoinHandle<()>>,
    stop: Sender<()>,
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        let _ = self.stop.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(data: &[u8]) -> [u8; 20] {
        use sha1::{Digest, Sha1};
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn make_controller(piece_sizes: &[usize], pieces_data: &[Vec<u8>]) -> (PieceController, tempfile::TempDir) {
        let hashes: Vec<[u8; 20]> = pieces_data.iter().map(|d| hash_of(d)).collect();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let ctl = PieceController::new(piece_sizes, &hashes, piece_sizes[0] as u64, &path).unwrap();
        (ctl, dir)
    }

    #[test]
    fn pick_work_marks_block_in_flight_and_is_idempotent_per_block() {
        let data = vec![1u8; 8];
        let (ctl, _dir) = make_controller(&[8], &[data]);
        let w1 = ctl.pick_work(0).unwrap();
        assert_eq!(w1.block_index, 0);
        // the only block is now in flight; no more work for this piece
        assert!(ctl.pick_work(0).is_none());
    }

    #[test]
    fn receive_block_completes_and_persists_matching_piece() {
        let data = vec![5u8; 8];
        let (ctl, dir) = make_controller(&[8], &[data.clone()]);
        ctl.pick_work(0).unwrap();
        let outcome = ctl.receive_block(0, 0, Bytes::from(data.clone()));
        assert_eq!(outcome, ReceiveOutcome::PieceComplete);
        assert!(ctl.is_complete());
        assert!(ctl.has_piece(0));

        let written = std::fs::read(dir.path().join("out.bin")).unwrap();
        assert_eq!(&written[..8], &data[..]);
    }

    #[test]
    fn receive_block_reports_integrity_failure_and_resets() {
        let (ctl, _dir) = make_controller(&[8], &[vec![9u8; 8]]);
        ctl.pick_work(0).unwrap();
        let outcome = ctl.receive_block(0, 0, Bytes::from(vec![0u8; 8]));
        assert!(matches!(outcome, ReceiveOutcome::IntegrityFailed(_)));
        assert!(!ctl.has_piece(0));
        // piece was reset, so the block is available for rescheduling
        assert!(ctl.pick_work(0).is_some());
    }

    #[test]
    fn reaper_releases_blocks_older_than_timeout() {
        let (mut ctl, _dir) = make_controller(&[8], &[vec![1u8; 8]]);
        ctl.request_timeout = Duration::from_millis(1);
        ctl.pick_work(0).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let released = ctl.reap_stale_requests();
        assert_eq!(released, 1);
        assert!(ctl.pick_work(0).is_some());
    }

    #[test]
    fn concurrent_receive_block_across_pieces_is_race_free() {
        let sizes = vec![8usize; 4];
        let datas: Vec<Vec<u8>> = (0..4).map(|i| vec![i as u8; 8]).collect();
        let (ctl, _dir) = make_controller(&sizes, &datas);
        let ctl = Arc::new(ctl);

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let ctl = Arc::clone(&ctl);
                let data = datas[i].clone();
                std::thread::spawn(move || {
                    ctl.pick_work(i).unwrap();
                    ctl.receive_block(i, 0, Bytes::from(data))
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), ReceiveOutcome::PieceComplete);
        }
        assert!(ctl.is_complete());
    }

    #[test]
    fn spawn_reaper_releases_stale_blocks_and_stops_on_drop() {
        let (mut ctl, _dir) = make_controller(&[8], &[vec![1u8; 8]]);
        ctl.request_timeout = Duration::from_millis(1);
        let ctl = Arc::new(ctl);
        ctl.pick_work(0).unwrap();

        let reaper = PieceController::spawn_reaper(Arc::clone(&ctl), Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(50));
        assert!(ctl.pick_work(0).is_some());
        drop(reaper);
    }
}
