use crate::{
    aligner::{AlignerParams, PairwiseAligner, accept_hit},
    blob_store::{BlobStore, read_blob, write_blob},
    chunk_store::{SequenceChunk, UniqueSequence},
    config::ClusterParameters,
    error::{ErrorCode, Result, ScataError},
    union_find::UnionFind,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub fn subcluster_blob_name(job: &str, level: usize, record: usize) -> String {
    format!("subcluster_{job}_{level}_{record}")
}

pub fn clusters_blob_name(job: &str) -> String {
    format!("clusters_{job}")
}

/// Length, serial and unique count encoded in a chunk blob name.
pub fn parse_chunk_name(name: &str) -> Option<(usize, usize, usize)> {
    let mut parts = name.rsplitn(4, '_');
    let count = parts.next()?.parse().ok()?;
    let serial = parts.next()?.parse().ok()?;
    let length = parts.next()?.parse().ok()?;
    parts.next().filter(|head| head.starts_with("chunk_"))?;
    Some((length, serial, count))
}

/// Sets of unique ids written by one clustering task or merge batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubclusterSet {
    pub job: String,
    pub level: usize,
    pub record: usize,
    pub clusters: Vec<Vec<String>>,
}

impl SubclusterSet {
    pub fn blob_name(&self) -> String {
        subcluster_blob_name(&self.job, self.level, self.record)
    }
}

/// Writes `value` unless `name` already exists. Returns whether it wrote.
pub(crate) fn write_blob_once<T: Serialize>(store: &dyn BlobStore, name: &str, value: &T) -> Result<bool> {
    if store.exists(name) {
        return Ok(false);
    }
    match write_blob(store, name, value) {
        Ok(()) => Ok(true),
        Err(e) if e.code == ErrorCode::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkGroup {
    pub index: usize,
    pub chunks: Vec<String>,
    pub uniques: usize,
}

/// Partitions chunks, longest first, into contiguous groups of at most
/// `target` unique sequences. A chunk larger than `target` forms its own group.
pub fn group_chunks(chunks: &[String], target: usize) -> Result<Vec<ChunkGroup>> {
    let mut sized: Vec<(usize, usize, &String)> = chunks
        .iter()
        .map(|name| match parse_chunk_name(name) {
            Some((length, _, count)) => Ok((length, count, name)),
            None => Err(ScataError::new(
                ErrorCode::InvalidInput,
                format!("Malformed chunk name '{name}'"),
            )),
        })
        .collect::<Result<_>>()?;
    sized.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.2.cmp(b.2)));

    let mut groups: Vec<ChunkGroup> = Vec::new();
    for (_, count, name) in sized {
        let fits = groups.last().is_some_and(|g| g.uniques + count <= target);
        if !fits {
            groups.push(ChunkGroup {
                index: groups.len(),
                chunks: Vec::new(),
                uniques: 0,
            });
        }
        if let Some(group) = groups.last_mut() {
            group.chunks.push(name.clone());
            group.uniques += count;
        }
    }
    Ok(groups)
}

/// Unique ids seen fewer than `lowfreq` times, counting identical sequences
/// across all chunks of the same length.
pub fn low_frequency_uniques(store: &dyn BlobStore, chunks: &[String], lowfreq: u64) -> Result<HashSet<String>> {
    if lowfreq == 0 {
        return Ok(HashSet::new());
    }
    let mut totals: HashMap<String, u64> = HashMap::new();
    let mut ids: Vec<(String, String)> = Vec::new();
    for name in chunks {
        let chunk: SequenceChunk = read_blob(store, name)?;
        for unique in chunk.sequences {
            *totals.entry(unique.seq.clone()).or_insert(0) += unique.read_count();
            ids.push((unique.id, unique.seq));
        }
    }
    let excluded: HashSet<String> = ids
        .into_iter()
        .filter(|(_, seq)| totals.get(seq).copied().unwrap_or(0) < lowfreq)
        .map(|(id, _)| id)
        .collect();
    tracing::info!(lowfreq, excluded = excluded.len(), "low-frequency uniques excluded");
    Ok(excluded)
}

pub fn load_group(store: &dyn BlobStore, group: &ChunkGroup, excluded: &HashSet<String>) -> Result<Vec<UniqueSequence>> {
    let mut out = Vec::with_capacity(group.uniques);
    for name in &group.chunks {
        let chunk: SequenceChunk = read_blob(store, name)?;
        out.extend(chunk.sequences.into_iter().filter(|s| !excluded.contains(&s.id)));
    }
    Ok(out)
}

/// All-vs-all alignment of two chunk groups.
#[derive(Debug, Clone)]
pub struct ClusterTask {
    pub job: String,
    pub record: usize,
    pub queries: ChunkGroup,
    pub targets: ChunkGroup,
    pub parameters: ClusterParameters,
    pub aligner_threads: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Written { clusters: usize },
    AlreadyDone,
}

/// Every unordered pair of groups, self-pairs included, numbered in order.
pub fn plan_tasks(
    job: &str,
    groups: &[ChunkGroup],
    parameters: &ClusterParameters,
    aligner_threads: usize,
) -> Vec<ClusterTask> {
    let mut tasks = Vec::new();
    for (i, queries) in groups.iter().enumerate() {
        for targets in &groups[i..] {
            tasks.push(ClusterTask {
                job: job.to_string(),
                record: tasks.len(),
                queries: queries.clone(),
                targets: targets.clone(),
                parameters: parameters.clone(),
                aligner_threads,
            });
        }
    }
    tasks
}

impl ClusterTask {
    pub fn blob_name(&self) -> String {
        subcluster_blob_name(&self.job, 0, self.record)
    }

    pub fn is_self_pair(&self) -> bool {
        self.queries.index == self.targets.index
    }

    pub fn run(
        &self,
        store: &dyn BlobStore,
        aligner: &dyn PairwiseAligner,
        excluded: &HashSet<String>,
    ) -> Result<TaskOutcome> {
        let name = self.blob_name();
        if store.exists(&name) {
            tracing::debug!(task = name.as_str(), "sub-clusters already written");
            return Ok(TaskOutcome::AlreadyDone);
        }
        let queries = load_group(store, &self.queries, excluded)?;
        let targets = if self.is_self_pair() {
            queries.clone()
        } else {
            load_group(store, &self.targets, excluded)?
        };
        let params = AlignerParams::from_parameters(&self.parameters, self.aligner_threads);
        let hits = aligner.align(&queries, &targets, &params)?;

        let mut sets = UnionFind::new();
        if self.is_self_pair() {
            for q in &queries {
                sets.insert(&q.id);
            }
        }
        let mut accepted = 0usize;
        for hit in &hits {
            if hit.is_self_hit() {
                sets.insert(&hit.query);
            } else if accept_hit(hit, &self.parameters) {
                sets.union(&hit.query, &hit.target);
                accepted += 1;
            }
        }
        let set = SubclusterSet {
            job: self.job.clone(),
            level: 0,
            record: self.record,
            clusters: sets.groups(),
        };
        let clusters = set.clusters.len();
        if !write_blob_once(store, &name, &set)? {
            return Ok(TaskOutcome::AlreadyDone);
        }
        tracing::debug!(
            task = name.as_str(),
            aligner = aligner.name(),
            hits = hits.len(),
            accepted,
            clusters,
            "clustering task finished"
        );
        Ok(TaskOutcome::Written { clusters })
    }
}
