use crate::{
    blob_store::{BlobStore, read_blob, write_blob},
    error::Result,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const DEFAULT_CHUNK_CAPACITY: usize = 2000;

pub fn chunk_blob_name(job: &str, length: usize, serial: usize, count: usize) -> String {
    format!("chunk_{job}_{length}_{serial}_{count}")
}

pub fn chunk_blob_prefix(job: &str) -> String {
    format!("chunk_{job}_")
}

/// Written once deduplication of a job has sealed every chunk.
pub fn chunkset_blob_name(job: &str) -> String {
    format!("chunkset_{job}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueSequence {
    /// `{length}_{serial}_{index}`
    pub id: String,
    pub seq: String,
    pub reads: Vec<String>,
}

impl UniqueSequence {
    pub fn read_count(&self) -> u64 {
        self.reads.len() as u64
    }
}

/// Unique sequences of one length. Immutable once sealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceChunk {
    pub job: String,
    pub length: usize,
    pub serial: usize,
    pub sequences: Vec<UniqueSequence>,
}

impl SequenceChunk {
    pub fn blob_name(&self) -> String {
        chunk_blob_name(&self.job, self.length, self.serial, self.sequences.len())
    }

    pub fn read_count(&self) -> u64 {
        self.sequences.iter().map(UniqueSequence::read_count).sum()
    }
}

/// Names of the sealed chunks of a job, in sealing order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSet {
    pub job: String,
    pub chunks: Vec<String>,
    pub reads: u64,
}

impl ChunkSet {
    pub fn load(store: &dyn BlobStore, job: &str) -> Result<Option<Self>> {
        let name = chunkset_blob_name(job);
        if !store.exists(&name) {
            return Ok(None);
        }
        read_blob(store, &name).map(Some)
    }
}

struct Bucket {
    serial: usize,
    index: HashMap<Vec<u8>, usize>,
    uniques: Vec<(Vec<u8>, Vec<String>)>,
}

impl Bucket {
    fn new(serial: usize) -> Self {
        Self {
            serial,
            index: HashMap::new(),
            uniques: Vec::new(),
        }
    }
}

/// Length-bucketed deduplication into sealed, write-once chunks.
pub struct ChunkStore<'a> {
    job: String,
    capacity: usize,
    store: &'a dyn BlobStore,
    open: BTreeMap<usize, Bucket>,
    next_serial: HashMap<usize, usize>,
    sealed: Vec<String>,
    reused: usize,
    reads: u64,
}

impl<'a> ChunkStore<'a> {
    pub fn new(job: &str, capacity: usize, store: &'a dyn BlobStore) -> Self {
        Self {
            job: job.to_string(),
            capacity: capacity.max(1),
            store,
            open: BTreeMap::new(),
            next_serial: HashMap::new(),
            sealed: Vec::new(),
            reused: 0,
            reads: 0,
        }
    }

    fn new_bucket(&mut self, length: usize) -> Bucket {
        let serial = self.next_serial.entry(length).or_insert(0);
        let bucket = Bucket::new(*serial);
        *serial += 1;
        bucket
    }

    pub fn add(&mut self, id: String, seq: &[u8]) -> Result<()> {
        let length = seq.len();
        self.reads += 1;
        if !self.open.contains_key(&length) {
            let bucket = self.new_bucket(length);
            self.open.insert(length, bucket);
        }
        let full = match self.open.get_mut(&length) {
            Some(bucket) => match bucket.index.get(seq) {
                Some(&i) => {
                    bucket.uniques[i].1.push(id);
                    return Ok(());
                }
                None => bucket.uniques.len() >= self.capacity,
            },
            None => false,
        };
        if full {
            let fresh = self.new_bucket(length);
            if let Some(old) = self.open.insert(length, fresh) {
                self.seal(length, old)?;
            }
        }
        if let Some(bucket) = self.open.get_mut(&length) {
            bucket.index.insert(seq.to_vec(), bucket.uniques.len());
            bucket.uniques.push((seq.to_vec(), vec![id]));
        }
        Ok(())
    }

    /// Writes a bucket as a chunk blob. A chunk with the same name from an
    /// earlier, interrupted run holds the same content and is reused.
    fn seal(&mut self, length: usize, bucket: Bucket) -> Result<()> {
        let chunk = SequenceChunk {
            job: self.job.clone(),
            length,
            serial: bucket.serial,
            sequences: bucket
                .uniques
                .into_iter()
                .enumerate()
                .map(|(index, (seq, reads))| UniqueSequence {
                    id: format!("{length}_{}_{index}", bucket.serial),
                    seq: String::from_utf8_lossy(&seq).to_string(),
                    reads,
                })
                .collect(),
        };
        let name = chunk.blob_name();
        if self.store.exists(&name) {
            self.reused += 1;
            tracing::debug!(chunk = name.as_str(), "reusing sealed chunk");
        } else {
            write_blob(self.store, &name, &chunk)?;
            tracing::debug!(chunk = name.as_str(), uniques = chunk.sequences.len(), "sealed chunk");
        }
        self.sealed.push(name);
        Ok(())
    }

    pub fn sealed(&self) -> &[String] {
        &self.sealed
    }

    pub fn reused(&self) -> usize {
        self.reused
    }

    /// Seals every open bucket and records the finished chunk set.
    pub fn finish(mut self) -> Result<ChunkSet> {
        let open = std::mem::take(&mut self.open);
        for (length, bucket) in open {
            if !bucket.uniques.is_empty() {
                self.seal(length, bucket)?;
            }
        }
        let set = ChunkSet {
            job: self.job.clone(),
            chunks: self.sealed,
            reads: self.reads,
        };
        let name = chunkset_blob_name(&self.job);
        if !self.store.exists(&name) {
            write_blob(self.store, &name, &set)?;
        }
        tracing::info!(
            job = self.job.as_str(),
            chunks = set.chunks.len(),
            reused = self.reused,
            reads = set.reads,
            "deduplication finished"
        );
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::MemoryBlobStore;

    #[test]
    fn test_identical_reads_share_one_unique() {
        let store = MemoryBlobStore::new();
        let mut chunks = ChunkStore::new("j", 10, &store);
        for i in 0..5 {
            chunks.add(format!("d:r{i}"), b"ACGT").unwrap();
        }
        let set = chunks.finish().unwrap();
        assert_eq!(set.chunks, vec!["chunk_j_4_0_1"]);
        assert_eq!(set.reads, 5);
        let chunk: SequenceChunk = read_blob(&store, "chunk_j_4_0_1").unwrap();
        assert_eq!(chunk.sequences.len(), 1);
        assert_eq!(chunk.sequences[0].id, "4_0_0");
        assert_eq!(chunk.sequences[0].reads.len(), 5);
        assert_eq!(ChunkSet::load(&store, "j").unwrap(), Some(set));
    }

    #[test]
    fn test_overflow_seals_previous_chunk_unchanged() {
        let store = MemoryBlobStore::new();
        let mut chunks = ChunkStore::new("j", 2, &store);
        chunks.add("a".into(), b"AAA").unwrap();
        chunks.add("b".into(), b"CCC").unwrap();
        chunks.add("b2".into(), b"CCC").unwrap();
        chunks.add("other".into(), b"GG").unwrap();
        assert!(chunks.sealed().is_empty());
        chunks.add("c".into(), b"TTT").unwrap();
        assert_eq!(chunks.sealed(), ["chunk_j_3_0_2"]);

        let first: SequenceChunk = read_blob(&store, "chunk_j_3_0_2").unwrap();
        let seqs: Vec<&str> = first.sequences.iter().map(|s| s.seq.as_str()).collect();
        assert_eq!(seqs, vec!["AAA", "CCC"]);
        assert_eq!(first.sequences[1].reads, vec!["b", "b2"]);

        let set = chunks.finish().unwrap();
        assert_eq!(set.chunks, vec!["chunk_j_3_0_2", "chunk_j_2_0_1", "chunk_j_3_1_1"]);
        let second: SequenceChunk = read_blob(&store, "chunk_j_3_1_1").unwrap();
        assert_eq!(second.sequences[0].id, "3_1_0");
        assert_eq!(second.sequences[0].seq, "TTT");
    }

    #[test]
    fn test_rerun_reuses_sealed_chunks() {
        let store = MemoryBlobStore::new();
        let mut first = ChunkStore::new("j", 1, &store);
        first.add("a".into(), b"AC").unwrap();
        first.add("b".into(), b"AG").unwrap();
        assert_eq!(first.sealed().len(), 1);
        drop(first);
        assert!(ChunkSet::load(&store, "j").unwrap().is_none());

        let mut again = ChunkStore::new("j", 1, &store);
        again.add("a".into(), b"AC").unwrap();
        again.add("b".into(), b"AG").unwrap();
        assert_eq!(again.reused(), 1);
        let set = again.finish().unwrap();
        assert_eq!(set.chunks, vec!["chunk_j_2_0_1", "chunk_j_2_1_1"]);
    }

    #[test]
    fn test_duplicate_after_seal_opens_new_unique() {
        let store = MemoryBlobStore::new();
        let mut chunks = ChunkStore::new("j", 1, &store);
        chunks.add("a".into(), b"AC").unwrap();
        chunks.add("b".into(), b"AG").unwrap();
        chunks.add("c".into(), b"AC").unwrap();
        let set = chunks.finish().unwrap();
        assert_eq!(set.chunks, vec!["chunk_j_2_0_1", "chunk_j_2_1_1", "chunk_j_2_2_1"]);
        assert_eq!(set.reads, 3);

        let first: SequenceChunk = read_blob(&store, "chunk_j_2_0_1").unwrap();
        let last: SequenceChunk = read_blob(&store, "chunk_j_2_2_1").unwrap();
        assert_eq!(first.sequences[0].seq, "AC");
        assert_eq!(first.sequences[0].reads, vec!["a"]);
        assert_eq!(last.sequences[0].seq, "AC");
        assert_eq!(last.sequences[0].id, "2_2_0");
        assert_eq!(last.sequences[0].reads, vec!["c"]);
    }
}
