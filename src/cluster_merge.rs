use crate::{
    blob_store::{BlobStore, read_blob},
    chunk_store::SequenceChunk,
    cluster_task::{SubclusterSet, clusters_blob_name, subcluster_blob_name, write_blob_once},
    error::{ErrorCode, Result, ScataError},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Folds sets into disjoint clusters. Each incoming set absorbs every cluster
/// it shares a member with.
pub fn absorb_sets<I>(sets: I) -> Vec<Vec<String>>
where
    I: IntoIterator<Item = Vec<String>>,
{
    let mut slots: Vec<Option<Vec<String>>> = Vec::new();
    let mut owner: HashMap<String, usize> = HashMap::new();
    for set in sets {
        let mut touched: Vec<usize> = set.iter().filter_map(|m| owner.get(m).copied()).collect();
        touched.sort_unstable();
        touched.dedup();
        let target = match touched.first() {
            Some(&slot) => slot,
            None => {
                slots.push(Some(Vec::new()));
                slots.len() - 1
            }
        };
        for &other in touched.iter().skip(1) {
            let moved = slots[other].take().unwrap_or_default();
            for member in moved {
                owner.insert(member.clone(), target);
                if let Some(members) = slots[target].as_mut() {
                    members.push(member);
                }
            }
        }
        for member in set {
            if owner.contains_key(&member) {
                continue;
            }
            owner.insert(member.clone(), target);
            if let Some(members) = slots[target].as_mut() {
                members.push(member);
            }
        }
    }
    slots.into_iter().flatten().collect()
}

/// Merges the `count` sets of `level` in batches of `fan_in` and returns the
/// number of sets written at the next level. Batches already present are
/// reused.
pub fn merge_level(store: &dyn BlobStore, job: &str, level: usize, count: usize, fan_in: usize) -> Result<usize> {
    let fan_in = fan_in.max(2);
    let batches = count.div_ceil(fan_in);
    let mut reused = 0usize;
    for batch in 0..batches {
        let name = subcluster_blob_name(job, level + 1, batch);
        if store.exists(&name) {
            reused += 1;
            continue;
        }
        let mut inputs = Vec::new();
        for record in batch * fan_in..((batch + 1) * fan_in).min(count) {
            let set: SubclusterSet = read_blob(store, &subcluster_blob_name(job, level, record))?;
            inputs.extend(set.clusters);
        }
        let merged = SubclusterSet {
            job: job.to_string(),
            level: level + 1,
            record: batch,
            clusters: absorb_sets(inputs),
        };
        write_blob_once(store, &name, &merged)?;
    }
    tracing::debug!(job, level = level + 1, sets = batches, reused, "merge level written");
    Ok(batches)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Most abundant unique sequence, first seen on ties.
    pub representative: String,
    pub sequence: String,
    pub uniques: Vec<String>,
    pub reads: Vec<String>,
    pub read_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterList {
    pub job: String,
    pub clusters: Vec<Cluster>,
}

impl ClusterList {
    pub fn load(store: &dyn BlobStore, job: &str) -> Result<Self> {
        read_blob(store, &clusters_blob_name(job))
    }

    pub fn read_count(&self) -> u64 {
        self.clusters.iter().map(|c| c.read_count).sum()
    }
}

/// Resolves the single set left at `level` into clusters of reads, most
/// uniques first, and persists them as the job's cluster list. A job that
/// dispatched `tasks > 0` must have its top set on disk.
pub fn finalize_clusters(
    store: &dyn BlobStore,
    job: &str,
    level: usize,
    tasks: usize,
    chunks: &[String],
) -> Result<ClusterList> {
    let name = clusters_blob_name(job);
    if store.exists(&name) {
        return ClusterList::load(store, job);
    }
    let top = subcluster_blob_name(job, level, 0);
    let sets: Vec<Vec<String>> = if tasks == 0 {
        Vec::new()
    } else if store.exists(&top) {
        read_blob::<SubclusterSet>(store, &top)?.clusters
    } else {
        return Err(ScataError::new(
            ErrorCode::NotFound,
            format!("Sub-cluster set '{top}' missing for job '{job}' with {tasks} tasks"),
        ));
    };

    let mut uniques: HashMap<String, (String, Vec<String>)> = HashMap::new();
    for chunk_name in chunks {
        let chunk: SequenceChunk = read_blob(store, chunk_name)?;
        for unique in chunk.sequences {
            uniques.insert(unique.id, (unique.seq, unique.reads));
        }
    }

    let mut clusters: Vec<Cluster> = sets
        .into_iter()
        .map(|members| {
            let mut cluster = Cluster {
                representative: String::new(),
                sequence: String::new(),
                uniques: Vec::with_capacity(members.len()),
                reads: Vec::new(),
                read_count: 0,
            };
            let mut best = 0usize;
            for id in members {
                if let Some((seq, reads)) = uniques.get(&id) {
                    if reads.len() > best || cluster.representative.is_empty() {
                        best = reads.len();
                        cluster.representative = id.clone();
                        cluster.sequence = seq.clone();
                    }
                    cluster.reads.extend(reads.iter().cloned());
                }
                cluster.uniques.push(id);
            }
            cluster.read_count = cluster.reads.len() as u64;
            cluster
        })
        .collect();
    clusters.sort_by(|a, b| {
        b.uniques
            .len()
            .cmp(&a.uniques.len())
            .then_with(|| b.read_count.cmp(&a.read_count))
            .then_with(|| a.representative.cmp(&b.representative))
    });

    let list = ClusterList {
        job: job.to_string(),
        clusters,
    };
    write_blob_once(store, &name, &list)?;
    tracing::info!(job, clusters = list.clusters.len(), reads = list.read_count(), "clusters written");
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{blob_store::MemoryBlobStore, chunk_store::ChunkStore};

    fn set(members: &[&str]) -> Vec<String> {
        members.iter().map(|m| m.to_string()).collect()
    }

    fn write_level0(store: &MemoryBlobStore, job: &str, record: usize, clusters: Vec<Vec<String>>) {
        let s = SubclusterSet {
            job: job.to_string(),
            level: 0,
            record,
            clusters,
        };
        write_blob_once(store, &s.blob_name(), &s).unwrap();
    }

    #[test]
    fn test_absorption_is_transitive() {
        let merged = absorb_sets(vec![set(&["a", "b"]), set(&["b", "c"]), set(&["d"])]);
        assert_eq!(merged, vec![set(&["a", "b", "c"]), set(&["d"])]);
    }

    #[test]
    fn test_incoming_set_bridges_existing_clusters() {
        let merged = absorb_sets(vec![set(&["a"]), set(&["b", "x"]), set(&["c"]), set(&["c", "a", "b"])]);
        assert_eq!(merged, vec![set(&["a", "b", "x", "c"])]);
    }

    #[test]
    fn test_levels_reduce_to_one_set() {
        let store = MemoryBlobStore::new();
        write_level0(&store, "j", 0, vec![set(&["a", "b"])]);
        write_level0(&store, "j", 1, vec![set(&["b", "c"])]);
        write_level0(&store, "j", 2, vec![set(&["d"])]);

        let next = merge_level(&store, "j", 0, 3, 2).unwrap();
        assert_eq!(next, 2);
        let first: SubclusterSet = read_blob(&store, "subcluster_j_1_0").unwrap();
        assert_eq!(first.clusters, vec![set(&["a", "b", "c"])]);
        assert_eq!(merge_level(&store, "j", 1, next, 2).unwrap(), 1);
        let top: SubclusterSet = read_blob(&store, "subcluster_j_2_0").unwrap();
        assert_eq!(top.clusters, vec![set(&["a", "b", "c"]), set(&["d"])]);
    }

    #[test]
    fn test_existing_merge_blobs_are_reused() {
        let store = MemoryBlobStore::new();
        write_level0(&store, "j", 0, vec![set(&["a"])]);
        write_level0(&store, "j", 1, vec![set(&["b"])]);
        let stale = SubclusterSet {
            job: "j".to_string(),
            level: 1,
            record: 0,
            clusters: vec![set(&["kept"])],
        };
        write_blob_once(&store, &stale.blob_name(), &stale).unwrap();
        assert_eq!(merge_level(&store, "j", 0, 2, 8).unwrap(), 1);
        let top: SubclusterSet = read_blob(&store, "subcluster_j_1_0").unwrap();
        assert_eq!(top.clusters, vec![set(&["kept"])]);
    }

    #[test]
    fn test_finalize_sorts_by_unique_count() {
        let store = MemoryBlobStore::new();
        let mut chunks = ChunkStore::new("j", 10, &store);
        chunks.add("d:r1".into(), b"AAAA").unwrap();
        chunks.add("d:r2".into(), b"CCCC").unwrap();
        chunks.add("d:r3".into(), b"GGGG").unwrap();
        chunks.add("d:r4".into(), b"GGGG").unwrap();
        chunks.add("d:r5".into(), b"GGGG").unwrap();
        let chunkset = chunks.finish().unwrap();
        write_level0(&store, "j", 0, vec![set(&["4_0_2"]), set(&["4_0_0", "4_0_1"])]);

        let list = finalize_clusters(&store, "j", 0, 1, &chunkset.chunks).unwrap();
        assert_eq!(list.clusters.len(), 2);
        assert_eq!(list.clusters[0].uniques, set(&["4_0_0", "4_0_1"]));
        assert_eq!(list.clusters[0].read_count, 2);
        assert_eq!(list.clusters[0].representative, "4_0_0");
        assert_eq!(list.clusters[1].representative, "4_0_2");
        assert_eq!(list.clusters[1].sequence, "GGGG");
        assert_eq!(list.clusters[1].reads, set(&["d:r3", "d:r4", "d:r5"]));
        assert_eq!(list.read_count(), 5);
        assert_eq!(ClusterList::load(&store, "j").unwrap(), list);
    }

    #[test]
    fn test_finalize_breaks_size_ties_by_read_count() {
        let store = MemoryBlobStore::new();
        let mut chunks = ChunkStore::new("j", 10, &store);
        chunks.add("d:r1".into(), b"AAAA").unwrap();
        chunks.add("d:r2".into(), b"CCCC").unwrap();
        chunks.add("d:r3".into(), b"CCCC").unwrap();
        let chunkset = chunks.finish().unwrap();
        write_level0(&store, "j", 0, vec![set(&["4_0_0"]), set(&["4_0_1"])]);

        let list = finalize_clusters(&store, "j", 0, 1, &chunkset.chunks).unwrap();
        assert_eq!(list.clusters[0].representative, "4_0_1");
        assert_eq!(list.clusters[0].read_count, 2);
        assert_eq!(list.clusters[1].representative, "4_0_0");
    }

    #[test]
    fn test_finalize_missing_top_set_fails() {
        let store = MemoryBlobStore::new();
        let mut chunks = ChunkStore::new("j", 10, &store);
        chunks.add("d:r1".into(), b"AAAA").unwrap();
        let chunkset = chunks.finish().unwrap();

        let err = finalize_clusters(&store, "j", 0, 1, &chunkset.chunks).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
        assert!(!store.exists("clusters_j"));
    }

    #[test]
    fn test_finalize_without_sets_is_empty() {
        let store = MemoryBlobStore::new();
        let list = finalize_clusters(&store, "empty", 0, 0, &[]).unwrap();
        assert!(list.clusters.is_empty());
        assert!(store.exists("clusters_empty"));
    }
}
