//! Chunk merger.
//!
//! Combines written file chunks of one shard into a single new chunk. The
//! inputs are given oldest first and must be a prefix of the shard's chunk
//! list: a tombstone that wins the merge is dropped from the output, which
//! is only safe when no older chunk outside the merge can still hold the
//! key. Records outside the shard's current range are dropped as well, so
//! a merge after a split sheds the half the shard gave away.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::chunk::{ChunkParams, FileChunk};
use super::cursor::{EntryIter, MergeIterator};
use super::page::HeaderPage;
use super::reader::ChunkReader;
use super::serializer::{ChunkBuilder, SHUTDOWN_CHECK_INTERVAL};
use super::types::{ChunkId, LogPosition};
use super::writer::FileSink;
use crate::disk;
use crate::error::{Error, Result};

/// Input and output description of one merge job.
#[derive(Debug, Clone)]
pub struct MergeSpec {
    /// Oldest first.
    pub inputs: Vec<Arc<FileChunk>>,
    pub chunk_id: ChunkId,
    pub first_key: Vec<u8>,
    /// Exclusive, empty for unbounded.
    pub last_key: Vec<u8>,
    pub use_bloom_filter: bool,
}

/// Merges the inputs into chunk file `spec.chunk_id` and returns its
/// header. A failed or interrupted merge removes the partial file.
pub fn merge(spec: &MergeSpec, params: &ChunkParams, shutting_down: &AtomicBool) -> Result<HeaderPage> {
    let path = params.chunk_path(spec.chunk_id);
    match merge_into(spec, params, shutting_down) {
        Ok(header) => {
            tracing::info!(
                chunk_id = spec.chunk_id,
                inputs = ?spec.inputs.iter().map(|c| c.id()).collect::<Vec<_>>(),
                num_keys = header.num_keys,
                size = header.file_size(),
                "Merged chunks"
            );
            Ok(header)
        }
        Err(e) => {
            if let Err(remove) = disk::remove_file_if_exists(&path) {
                tracing::warn!(path = %path.display(), error = %remove, "Failed to remove partial merge output");
            }
            Err(e)
        }
    }
}

fn merge_into(spec: &MergeSpec, params: &ChunkParams, shutting_down: &AtomicBool) -> Result<HeaderPage> {
    if spec.inputs.is_empty() {
        return Err(Error::InvalidArgument("merge without input chunks".into()));
    }

    let mut sources: Vec<EntryIter> = Vec::with_capacity(spec.inputs.len());
    for chunk in &spec.inputs {
        let reader = ChunkReader::new(Arc::clone(chunk), &spec.first_key, &spec.last_key)?;
        sources.push(Box::new(reader));
    }

    let expected_keys = spec
        .use_bloom_filter
        .then(|| spec.inputs.iter().map(|c| c.num_keys()).sum::<u64>());
    let mut builder = ChunkBuilder::new(spec.chunk_id, params, expected_keys);
    if let Some((min, max)) = log_range(&spec.inputs) {
        builder.set_log_range(min, max);
    }

    let mut sink = FileSink::create(&params.chunk_path(spec.chunk_id), params.header_page_size)?;
    for (i, entry) in MergeIterator::new(sources).enumerate() {
        if i % SHUTDOWN_CHECK_INTERVAL == 0 && shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        let (key, value) = entry?;
        if let Some(value) = value {
            builder.add(&mut sink, &key, Some(&value))?;
        }
    }

    let header = builder.finish(&mut sink)?;
    sink.complete()?;
    Ok(header)
}

/// Log range covered by the inputs; chunks that never saw a log command
/// do not contribute.
fn log_range(inputs: &[Arc<FileChunk>]) -> Option<(u64, LogPosition)> {
    inputs
        .iter()
        .map(|chunk| chunk.header())
        .filter(|header| header.max_log_segment_id != 0)
        .map(|header| (header.min_log_segment_id, header.max_log_position()))
        .reduce(|(min_a, max_a), (min_b, max_b)| (min_a.min(min_b), max_a.max(max_b)))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::config::StorageConfig;
    use crate::storage::cache::PageCache;
    use crate::storage::chunk::MemoChunk;
    use crate::storage::serializer::serialize;
    use crate::storage::writer::write_image;

    struct Fixture {
        _dir: tempfile::TempDir,
        params: ChunkParams,
        cache: Arc<PageCache>,
    }

    impl Fixture {
        fn new() -> Result<Self> {
            let dir = tempfile::tempdir()?;
            let config = StorageConfig::new(dir.path())
                .page_granularity(512)
                .data_page_size(1024)
                .max_key_size(32);
            let params = ChunkParams::from_config(&config);
            std::fs::create_dir_all(&params.chunk_dir)?;
            Ok(Self {
                _dir: dir,
                params,
                cache: PageCache::new(1 << 20),
            })
        }

        fn write(&self, memo: &MemoChunk) -> Result<Arc<FileChunk>> {
            let image = serialize(memo, &self.params, true, &AtomicBool::new(false))?;
            let path = self.params.chunk_path(memo.chunk_id());
            write_image(&path, &image, &AtomicBool::new(false))?;
            self.open(memo.chunk_id())
        }

        fn open(&self, chunk_id: ChunkId) -> Result<Arc<FileChunk>> {
            let path = self.params.chunk_path(chunk_id);
            Ok(Arc::new(FileChunk::open(&path, chunk_id, Arc::clone(&self.cache))?))
        }

        fn merge(&self, inputs: Vec<Arc<FileChunk>>, chunk_id: ChunkId, first: &[u8], last: &[u8]) -> Result<Arc<FileChunk>> {
            let spec = MergeSpec {
                inputs,
                chunk_id,
                first_key: first.to_vec(),
                last_key: last.to_vec(),
                use_bloom_filter: true,
            };
            merge(&spec, &self.params, &AtomicBool::new(false))?;
            self.open(chunk_id)
        }
    }

    fn contents(chunk: &Arc<FileChunk>) -> Result<Vec<(Vec<u8>, Option<Vec<u8>>)>> {
        ChunkReader::full(Arc::clone(chunk))?.collect()
    }

    #[test]
    fn test_newer_chunk_wins() -> Result<()> {
        let fixture = Fixture::new()?;
        let mut older = MemoChunk::new(1);
        older.set(b"a", b"old")?;
        older.set(b"b", b"old")?;
        older.set(b"c", b"old")?;
        older.register_log_command(LogPosition::new(1, 3));
        let mut newer = MemoChunk::new(2);
        newer.set(b"b", b"new")?;
        newer.delete(b"c")?;
        newer.set(b"d", b"new")?;
        newer.register_log_command(LogPosition::new(2, 1));

        let merged = fixture.merge(vec![fixture.write(&older)?, fixture.write(&newer)?], 3, b"", b"")?;
        assert_eq!(
            contents(&merged)?,
            vec![
                (b"a".to_vec(), Some(b"old".to_vec())),
                (b"b".to_vec(), Some(b"new".to_vec())),
                (b"d".to_vec(), Some(b"new".to_vec())),
            ]
        );
        assert_eq!(merged.num_keys(), 3);
        assert_eq!(merged.first_key(), b"a");
        assert_eq!(merged.last_key(), b"d");
        assert_eq!(merged.header().min_log_segment_id, 1);
        assert_eq!(merged.max_log_position(), LogPosition::new(2, 1));
        assert_eq!(merged.get(b"c")?, None);
        Ok(())
    }

    #[test]
    fn test_merging_lone_tombstone_leaves_empty_chunk() -> Result<()> {
        let fixture = Fixture::new()?;
        let mut memo = MemoChunk::new(1);
        memo.set(b"x", b"1")?;
        memo.delete(b"x")?;
        let chunk = fixture.write(&memo)?;
        assert_eq!(chunk.num_keys(), 1);

        let merged = fixture.merge(vec![chunk], 2, b"", b"")?;
        assert_eq!(merged.num_keys(), 0);
        assert!(contents(&merged)?.is_empty());
        assert_eq!(merged.get(b"x")?, None);
        Ok(())
    }

    #[test]
    fn test_merge_restricts_to_range() -> Result<()> {
        let fixture = Fixture::new()?;
        let mut memo = MemoChunk::new(1);
        for key in ["a", "f", "m", "t", "z"] {
            memo.set(key.as_bytes(), b"v")?;
        }
        let chunk = fixture.write(&memo)?;

        let merged = fixture.merge(vec![chunk], 2, b"f", b"t")?;
        let keys: Vec<Vec<u8>> = contents(&merged)?.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"f".to_vec(), b"m".to_vec()]);
        Ok(())
    }

    #[test]
    fn test_merge_matches_model() -> Result<()> {
        let fixture = Fixture::new()?;
        let mut rng = StdRng::seed_from_u64(7);
        let mut model: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
        let mut inputs = Vec::new();

        for chunk_id in 1..=4 {
            let mut memo = MemoChunk::new(chunk_id);
            for _ in 0..300 {
                let key = format!("key{:03}", rng.gen_range(0..400)).into_bytes();
                if rng.gen_bool(0.2) {
                    memo.delete(&key)?;
                    model.insert(key, None);
                } else {
                    let value = vec![chunk_id as u8; rng.gen_range(0..100)];
                    memo.set(&key, &value)?;
                    model.insert(key, Some(value));
                }
            }
            inputs.push(fixture.write(&memo)?);
        }

        let merged = fixture.merge(inputs, 10, b"", b"")?;
        let want: Vec<_> = model.into_iter().filter(|(_, v)| v.is_some()).collect();
        assert_eq!(contents(&merged)?, want);
        Ok(())
    }

    #[test]
    fn test_interrupted_merge_removes_output() -> Result<()> {
        let fixture = Fixture::new()?;
        let mut memo = MemoChunk::new(1);
        memo.set(b"a", b"1")?;
        let spec = MergeSpec {
            inputs: vec![fixture.write(&memo)?],
            chunk_id: 2,
            first_key: Vec::new(),
            last_key: Vec::new(),
            use_bloom_filter: false,
        };
        let result = merge(&spec, &fixture.params, &AtomicBool::new(true));
        assert!(matches!(result, Err(Error::ShuttingDown)));
        assert!(!Path::exists(&fixture.params.chunk_path(2)));
        Ok(())
    }
}
