//! Write-ahead log.
//!
//! Every shard writes to the log stream of its track. A track is a sequence
//! of segment files `logs/log.<track>.<segment>`; only the newest segment of
//! a track is open for appends. [`Log`] owns the open segments, rotates
//! them once they grow past the configured size and remembers the sealed
//! segments so maintenance can prune the ones no shard depends on.

pub mod record;
pub mod replay;
pub mod segment;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

pub use record::LogRecord;
pub use replay::{SegmentFile, SegmentSummary};
pub use segment::{LogSegment, PendingCommit};

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::storage::types::{ContextId, LogPosition, ShardId, TrackId};

pub const LOG_DIR: &str = "logs";
pub const ARCHIVE_DIR: &str = "archive";

#[derive(Debug)]
pub struct Log {
    dir: PathBuf,
    segment_size: u64,
    write_granularity: usize,
    sync_granularity: usize,
    open: BTreeMap<TrackId, LogSegment>,
    /// Sealed segments of every track, waiting to be pruned.
    sealed: BTreeMap<TrackId, BTreeSet<u64>>,
    /// Highest segment id each track has used, pruned ones included.
    last_segment: BTreeMap<TrackId, u64>,
}

impl Log {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            dir: config.dir.join(LOG_DIR),
            segment_size: config.log_segment_size,
            write_granularity: config.write_granularity,
            sync_granularity: config.sync_granularity,
            open: BTreeMap::new(),
            sealed: BTreeMap::new(),
            last_segment: BTreeMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Registers segments found on disk. They are never appended to again.
    pub fn add_sealed(&mut self, track_id: TrackId, segment_id: u64) {
        self.sealed.entry(track_id).or_default().insert(segment_id);
        self.note_segment(track_id, segment_id);
    }

    /// Raises the segment numbering of a track past `segment_id`. Recovery
    /// uses it for segments that were pruned but are still referenced by
    /// chunk watermarks.
    pub fn note_segment(&mut self, track_id: TrackId, segment_id: u64) {
        let last = self.last_segment.entry(track_id).or_default();
        *last = (*last).max(segment_id);
    }

    /// Opens a fresh segment for `track_id`, one past every segment the
    /// track has had.
    pub fn open_track(&mut self, track_id: TrackId) -> Result<&mut LogSegment> {
        if self.open.contains_key(&track_id) {
            return self.segment_mut(track_id);
        }
        let next = self.last_segment.get(&track_id).map_or(1, |last| last + 1);
        let segment = LogSegment::create(
            &self.dir,
            track_id,
            next,
            self.write_granularity,
            self.sync_granularity,
        )?;
        tracing::info!(track_id = track_id, segment_id = next, "Opened log segment");
        self.note_segment(track_id, next);
        self.open.insert(track_id, segment);
        self.segment_mut(track_id)
    }

    fn segment_mut(&mut self, track_id: TrackId) -> Result<&mut LogSegment> {
        self.open
            .get_mut(&track_id)
            .ok_or_else(|| Error::InvalidState(format!("track {} has no open segment", track_id)))
    }

    pub fn current_segment_id(&self, track_id: TrackId) -> Option<u64> {
        self.open.get(&track_id).map(LogSegment::segment_id)
    }

    /// Position of the last command appended to the track. Every later
    /// append gets a greater position.
    pub fn position(&self, track_id: TrackId) -> LogPosition {
        match self.open.get(&track_id) {
            Some(segment) => segment.last_position(),
            None => LogPosition::new(
                self.last_segment.get(&track_id).copied().unwrap_or_default(),
                u32::MAX,
            ),
        }
    }

    pub fn append_set(
        &mut self,
        track_id: TrackId,
        context_id: ContextId,
        shard_id: ShardId,
        key: &[u8],
        value: &[u8],
    ) -> Result<LogPosition> {
        self.open_track(track_id)?
            .append_set(context_id, shard_id, key, value)
    }

    pub fn append_delete(
        &mut self,
        track_id: TrackId,
        context_id: ContextId,
        shard_id: ShardId,
        key: &[u8],
    ) -> Result<LogPosition> {
        self.open_track(track_id)?
            .append_delete(context_id, shard_id, key)
    }

    pub fn undo(&mut self, track_id: TrackId) -> bool {
        self.open
            .get_mut(&track_id)
            .is_some_and(LogSegment::undo)
    }

    pub fn is_dirty(&self) -> bool {
        self.open.values().any(LogSegment::is_dirty)
    }

    /// Frames the buffered commands of every track for writing.
    pub fn prepare_commit(&mut self) -> Result<Vec<PendingCommit>> {
        let mut pending = Vec::new();
        for segment in self.open.values_mut() {
            if let Some(commit) = segment.prepare_commit()? {
                pending.push(commit);
            }
        }
        Ok(pending)
    }

    /// Seals every clean segment that outgrew the segment size and opens its
    /// successor. Returns the sealed `(track, segment)` pairs.
    pub fn rotate(&mut self) -> Result<Vec<(TrackId, u64)>> {
        let full: Vec<TrackId> = self
            .open
            .iter()
            .filter(|(_, segment)| !segment.is_dirty() && segment.size() > self.segment_size)
            .map(|(track_id, _)| *track_id)
            .collect();

        let mut rotated = Vec::with_capacity(full.len());
        for track_id in full {
            if let Some(segment) = self.open.remove(&track_id) {
                let segment_id = segment.segment_id();
                self.add_sealed(track_id, segment_id);
                tracing::info!(
                    track_id = track_id,
                    segment_id = segment_id,
                    size = segment.size(),
                    "Rotated log segment"
                );
                rotated.push((track_id, segment_id));
                self.open_track(track_id)?;
            }
        }
        Ok(rotated)
    }

    /// Sealed segments, by track.
    pub fn sealed(&self) -> impl Iterator<Item = (TrackId, u64)> + '_ {
        self.sealed
            .iter()
            .flat_map(|(track_id, segments)| segments.iter().map(move |id| (*track_id, *id)))
    }

    /// Forgets a sealed segment once its file was removed or archived.
    pub fn forget(&mut self, track_id: TrackId, segment_id: u64) {
        if let Some(segments) = self.sealed.get_mut(&track_id) {
            segments.remove(&segment_id);
            if segments.is_empty() {
                self.sealed.remove(&track_id);
            }
        }
    }

    /// Closes a track no shard uses any more. Returns all its segments,
    /// the open one included, so they can be pruned. Buffered commands are
    /// discarded. A later reopen continues the segment numbering.
    pub fn close_track(&mut self, track_id: TrackId) -> Vec<(u64, PathBuf)> {
        let mut segments: Vec<(u64, PathBuf)> = self
            .sealed
            .remove(&track_id)
            .unwrap_or_default()
            .into_iter()
            .map(|segment_id| (segment_id, self.segment_path(track_id, segment_id)))
            .collect();
        if let Some(segment) = self.open.remove(&track_id) {
            segments.push((segment.segment_id(), segment.path().to_path_buf()));
        }
        segments
    }

    pub fn tracks(&self) -> BTreeSet<TrackId> {
        self.open.keys().chain(self.sealed.keys()).copied().collect()
    }

    pub fn segment_path(&self, track_id: TrackId, segment_id: u64) -> PathBuf {
        self.dir.join(segment::segment_file_name(track_id, segment_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path) -> StorageConfig {
        StorageConfig::new(dir)
            .log_segment_size(256)
            .log_granularity(64, 128)
    }

    #[test]
    fn test_tracks_are_independent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path());
        std::fs::create_dir_all(dir.path().join(LOG_DIR))?;
        let mut log = Log::new(&config);

        assert_eq!(log.append_set(1, 0, 1, b"a", b"1")?, LogPosition::new(1, 1));
        assert_eq!(log.append_set(2, 0, 2, b"b", b"2")?, LogPosition::new(1, 1));
        assert_eq!(log.append_delete(1, 0, 1, b"a")?, LogPosition::new(1, 2));
        assert!(log.is_dirty());

        let pending = log.prepare_commit()?;
        assert_eq!(pending.len(), 2);
        for commit in &pending {
            commit.write()?;
        }
        assert!(!log.is_dirty());
        assert_eq!(log.tracks().into_iter().collect::<Vec<_>>(), vec![1, 2]);
        Ok(())
    }

    #[test]
    fn test_rotation() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path());
        std::fs::create_dir_all(dir.path().join(LOG_DIR))?;
        let mut log = Log::new(&config);

        log.append_set(7, 0, 1, b"key", &[1u8; 300])?;
        // dirty segments are not rotated
        assert!(log.rotate()?.is_empty());
        for commit in log.prepare_commit()? {
            commit.write()?;
        }
        assert_eq!(log.rotate()?, vec![(7, 1)]);
        assert_eq!(log.current_segment_id(7), Some(2));
        assert_eq!(log.sealed().collect::<Vec<_>>(), vec![(7, 1)]);
        assert_eq!(log.append_set(7, 0, 1, b"key", b"v")?, LogPosition::new(2, 1));

        log.forget(7, 1);
        assert_eq!(log.sealed().count(), 0);
        let segments = log.close_track(7);
        assert_eq!(segments, vec![(2, log.segment_path(7, 2))]);
        assert!(log.tracks().is_empty());
        assert_eq!(log.open_track(7)?.segment_id(), 3);
        Ok(())
    }

    #[test]
    fn test_reopen_continues_after_sealed_segments() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path());
        std::fs::create_dir_all(dir.path().join(LOG_DIR))?;
        let mut log = Log::new(&config);
        log.add_sealed(3, 4);
        log.add_sealed(3, 9);
        assert_eq!(log.open_track(3)?.segment_id(), 10);
        assert!(!log.undo(3));
        Ok(())
    }

    #[test]
    fn test_position_precedes_later_appends() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path());
        std::fs::create_dir_all(dir.path().join(LOG_DIR))?;
        let mut log = Log::new(&config);

        log.note_segment(5, 6);
        let idle = log.position(5);
        assert_eq!(idle, LogPosition::new(6, u32::MAX));
        let first = log.append_set(5, 0, 1, b"a", b"1")?;
        assert_eq!(first, LogPosition::new(7, 1));
        assert!(first > idle);

        assert_eq!(log.position(5), first);
        assert!(log.append_delete(5, 0, 1, b"a")? > first);
        Ok(())
    }
}
