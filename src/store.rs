use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use sha1::{Digest, Sha1};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{peer::message::Bitfield, torrent::TorrentMetadata};

mod disk;
pub mod error;

pub use error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    Missing,
    InFlight,
    Complete,
}

/// Bytes exist exactly when the piece is complete.
#[derive(Debug)]
enum Slot {
    Missing,
    InFlight,
    Complete(Arc<[u8]>),
}

#[derive(Debug)]
struct Piece {
    slot: Slot,
    availability: u32,
}

#[derive(Debug, Default)]
struct StoreState {
    pieces: Vec<Piece>,
    completed: usize,
    /// Bytes of complete pieces, resumed ones included.
    have_bytes: u64,
    /// Bytes verified during this run.
    downloaded: u64,
    uploaded: u64,
    disk_error: Option<String>,
}

/// Outcome of a successful `complete` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Stored,
    AlreadyComplete,
    /// This call completed the last piece.
    Finished,
}

fn sha1(bytes: &[u8]) -> [u8; 20] {
    Sha1::digest(bytes).into()
}

fn find_missing(
    pieces: &[Piece],
    start_hint: usize,
    mut accept: impl FnMut(usize) -> bool,
) -> Option<usize> {
    let count = pieces.len();
    if count == 0 {
        return None;
    }
    let start = start_hint % count;
    (0..count)
        .map(|offset| (start + offset) % count)
        .find(|&i| matches!(pieces[i].slot, Slot::Missing) && accept(i))
}

/// Shared piece table for one torrent.
///
/// Every state transition happens under a single lock, so a piece has at most
/// one claimant and completes at most once. The completion signal and the disk
/// write fire once, from the call that completes the last piece.
#[derive(Debug)]
pub struct PieceStore {
    meta: Arc<TorrentMetadata>,
    destination: PathBuf,
    state: Mutex<StoreState>,
    finished: watch::Sender<bool>,
}

impl PieceStore {
    /// Empty store; nothing is read from disk.
    pub fn new(
        meta: Arc<TorrentMetadata>,
        destination: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        if meta.files.is_empty() {
            return Err(StoreError::NoFiles);
        }
        let pieces = (0..meta.piece_count())
            .map(|_| Piece {
                slot: Slot::Missing,
                availability: 0,
            })
            .collect();
        let (finished, _) = watch::channel(meta.piece_count() == 0);

        Ok(Self {
            meta,
            destination: destination.into(),
            state: Mutex::new(StoreState {
                pieces,
                ..Default::default()
            }),
            finished,
        })
    }

    /// Like `new`, but seeds verified pieces from an existing single file at `destination`.
    pub fn open(
        meta: Arc<TorrentMetadata>,
        destination: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        let store = Self::new(meta, destination)?;
        store.resume();
        Ok(store)
    }

    fn resume(&self) {
        if self.meta.is_multi_file() {
            return;
        }
        let Ok(existing) = fs::metadata(&self.destination) else {
            return;
        };
        if !existing.is_file() || existing.len() != self.meta.total_length {
            warn!(
                path = %self.destination.display(),
                size = existing.len(),
                expected = self.meta.total_length,
                "existing file does not match the torrent, starting from scratch"
            );
            return;
        }

        let pieces = match disk::read_pieces(&self.meta, &self.destination) {
            Ok(pieces) => pieces,
            Err(e) => {
                warn!(path = %self.destination.display(), error = %e, "could not read existing file");
                return;
            }
        };

        let mut state = self.state();
        for (index, bytes) in pieces.into_iter().enumerate() {
            if sha1(&bytes) != self.meta.piece_hashes[index] {
                debug!(piece = index, "existing piece failed verification");
                continue;
            }
            state.have_bytes += bytes.len() as u64;
            state.pieces[index].slot = Slot::Complete(bytes.into());
            state.completed += 1;
        }
        info!(
            verified = state.completed,
            total = self.meta.piece_count(),
            "resumed from {}",
            self.destination.display()
        );
        let done = state.completed == self.meta.piece_count();
        drop(state);

        if done {
            self.finished.send_replace(true);
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn meta(&self) -> &Arc<TorrentMetadata> {
        &self.meta
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn piece_count(&self) -> usize {
        self.meta.piece_count()
    }

    pub fn status(&self, index: usize) -> Option<PieceStatus> {
        self.state().pieces.get(index).map(|p| match p.slot {
            Slot::Missing => PieceStatus::Missing,
            Slot::InFlight => PieceStatus::InFlight,
            Slot::Complete(_) => PieceStatus::Complete,
        })
    }

    /// First Missing piece scanning forward from `start_hint`, wrapping around.
    pub fn next_needed_index(&self, start_hint: usize) -> Option<usize> {
        find_missing(&self.state().pieces, start_hint, |_| true)
    }

    /// Missing -> InFlight. False if the piece is in any other state.
    pub fn claim(&self, index: usize) -> bool {
        let mut state = self.state();
        match state.pieces.get_mut(index) {
            Some(piece) if matches!(piece.slot, Slot::Missing) => {
                piece.slot = Slot::InFlight;
                true
            }
            _ => false,
        }
    }

    /// Finds and claims a needed piece in one step.
    ///
    /// `peer_has` filters out pieces the remote side cannot serve. The returned
    /// guard releases the piece when dropped unless it was completed.
    pub fn claim_next(
        self: &Arc<Self>,
        start_hint: usize,
        peer_has: impl Fn(usize) -> bool,
    ) -> Option<PieceClaim> {
        let index = {
            let mut state = self.state();
            let index = find_missing(&state.pieces, start_hint, peer_has)?;
            state.pieces[index].slot = Slot::InFlight;
            index
        };
        Some(PieceClaim {
            store: Arc::clone(self),
            index,
            completed: false,
        })
    }

    /// InFlight -> Missing. Returns whether anything changed.
    pub fn release(&self, index: usize) -> bool {
        let mut state = self.state();
        match state.pieces.get_mut(index) {
            Some(piece) if matches!(piece.slot, Slot::InFlight) => {
                piece.slot = Slot::Missing;
                debug!(piece = index, "released");
                true
            }
            _ => false,
        }
    }

    /// Stores a verified piece.
    ///
    /// Rejects data of the wrong length or hash without touching state. Completing
    /// an already complete piece is a no-op. The call that completes the last piece
    /// writes the download to disk and signals completion; a failed write is
    /// recorded and left for `persist` to retry.
    pub fn complete(&self, index: usize, bytes: Vec<u8>) -> Result<Completion, StoreError> {
        if index >= self.meta.piece_count() {
            return Err(StoreError::InvalidIndex(index));
        }
        let expected = self.meta.piece_len(index) as usize;
        if bytes.len() != expected {
            return Err(StoreError::LengthMismatch {
                index,
                expected,
                actual: bytes.len(),
            });
        }
        if sha1(&bytes) != self.meta.piece_hashes[index] {
            return Err(StoreError::HashMismatch(index));
        }

        let finished = {
            let mut state = self.state();
            if matches!(state.pieces[index].slot, Slot::Complete(_)) {
                return Ok(Completion::AlreadyComplete);
            }
            state.pieces[index].slot = Slot::Complete(bytes.into());
            state.completed += 1;
            state.downloaded += expected as u64;
            state.have_bytes += expected as u64;
            info!(
                piece = index,
                completed = state.completed,
                total = self.meta.piece_count(),
                "piece verified"
            );
            state.completed == self.meta.piece_count()
        };
        if !finished {
            return Ok(Completion::Stored);
        }

        info!("all pieces verified");
        if let Err(e) = self.persist() {
            error!(error = %e, "failed to write download, keeping it in memory");
        }
        self.finished.send_replace(true);
        Ok(Completion::Finished)
    }

    /// Writes every piece to the destination layout. Only valid once complete.
    pub fn persist(&self) -> Result<(), StoreError> {
        let pieces: Vec<Arc<[u8]>> = {
            let state = self.state();
            let missing = self.meta.piece_count() - state.completed;
            if missing > 0 {
                return Err(StoreError::Incomplete(missing));
            }
            state
                .pieces
                .iter()
                .filter_map(|p| match &p.slot {
                    Slot::Complete(bytes) => Some(Arc::clone(bytes)),
                    _ => None,
                })
                .collect()
        };

        let result = disk::write_pieces(&self.meta, &self.destination, &pieces);
        let mut state = self.state();
        match result {
            Ok(()) => {
                state.disk_error = None;
                info!(
                    path = %self.destination.display(),
                    bytes = self.meta.total_length,
                    "download written"
                );
                Ok(())
            }
            Err(e) => {
                state.disk_error = Some(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Last write failure, cleared by a successful `persist`.
    pub fn disk_error(&self) -> Option<String> {
        self.state().disk_error.clone()
    }

    /// Reads a block of a complete piece for a peer and counts it as uploaded.
    pub fn bytes_for_upload(&self, index: usize, begin: usize, length: usize) -> Option<Vec<u8>> {
        let mut state = self.state();
        let block = match &state.pieces.get(index)?.slot {
            Slot::Complete(bytes) => bytes.get(begin..begin.checked_add(length)?)?.to_vec(),
            _ => return None,
        };
        state.uploaded += block.len() as u64;
        Some(block)
    }

    pub fn record_availability(&self, bitfield: &Bitfield) {
        let mut state = self.state();
        for (index, piece) in state.pieces.iter_mut().enumerate() {
            if bitfield.has_piece(index) {
                piece.availability += 1;
            }
        }
    }

    pub fn record_have(&self, index: usize) {
        if let Some(piece) = self.state().pieces.get_mut(index) {
            piece.availability += 1;
        }
    }

    pub fn availability(&self, index: usize) -> Option<u32> {
        self.state().pieces.get(index).map(|p| p.availability)
    }

    /// Complete pieces as a wire bitfield.
    pub fn bitfield(&self) -> Bitfield {
        let state = self.state();
        let mut bitfield = Bitfield::from_piece_count(state.pieces.len());
        for (index, piece) in state.pieces.iter().enumerate() {
            if matches!(piece.slot, Slot::Complete(_)) {
                bitfield.set_piece(index);
            }
        }
        bitfield
    }

    pub fn is_complete(&self) -> bool {
        self.state().completed == self.meta.piece_count()
    }

    pub fn completed_pieces(&self) -> usize {
        self.state().completed
    }

    pub fn downloaded(&self) -> u64 {
        self.state().downloaded
    }

    pub fn uploaded(&self) -> u64 {
        self.state().uploaded
    }

    pub fn left(&self) -> u64 {
        self.meta.total_length - self.state().have_bytes
    }

    /// Flips to `true` once every piece is complete.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.finished.subscribe()
    }
}

/// Exclusive ownership of an in-flight piece.
#[derive(Debug)]
pub struct PieceClaim {
    store: Arc<PieceStore>,
    index: usize,
    completed: bool,
}

impl PieceClaim {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Hands the assembled piece to the store. On error the claim is dropped and the piece released.
    pub fn complete(mut self, bytes: Vec<u8>) -> Result<Completion, StoreError> {
        let completion = self.store.complete(self.index, bytes)?;
        self.completed = true;
        Ok(completion)
    }
}

impl Drop for PieceClaim {
    fn drop(&mut self) {
        if !self.completed {
            self.store.release(self.index);
        }
    }
}
