use crate::{
    amplicon::Amplicon,
    blob_store::BlobStore,
    config::{ClusterParameters, JobConfig, JobSource},
    dataset::{load_references, load_sequences, load_tag_index},
    detagger::Detagger,
    error::Result,
    read::Read,
};
use itertools::Itertools;
use scata_protocol::ErrorTallies;
use std::collections::VecDeque;

/// One read as it enters deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSequence {
    /// `{source}:{read}`
    pub id: String,
    pub seq: Vec<u8>,
    pub tag: String,
}

/// Shortens every run of one base to at most `max` bases; 0 disables.
pub fn collapse_homopolymers(seq: &[u8], max: usize) -> Vec<u8> {
    if max == 0 {
        return seq.to_vec();
    }
    let mut out = Vec::with_capacity(seq.len());
    for (count, base) in seq.iter().dedup_with_count() {
        out.extend(std::iter::repeat_n(*base, count.min(max)));
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    Dataset,
    Refset,
}

/// Every read of a job's datasets and reference sets, one source at a time.
pub struct JobSequences<'a> {
    store: &'a dyn BlobStore,
    pending: VecDeque<(SourceKind, JobSource)>,
    current: std::vec::IntoIter<JobSequence>,
    job_amplicon: Option<(String, Detagger)>,
    max_homopolymer: usize,
    downsample: usize,
    rejected: ErrorTallies,
}

impl<'a> JobSequences<'a> {
    pub fn new(
        store: &'a dyn BlobStore,
        job: &JobConfig,
        amplicon: Option<&Amplicon>,
        params: &ClusterParameters,
    ) -> Self {
        let pending = job
            .datasets
            .iter()
            .map(|s| (SourceKind::Dataset, s.clone()))
            .chain(job.refsets.iter().map(|s| (SourceKind::Refset, s.clone())))
            .collect();
        Self {
            store,
            pending,
            current: Vec::new().into_iter(),
            job_amplicon: amplicon.map(|a| (a.id.clone(), Detagger::new(a, true, false))),
            max_homopolymer: params.max_homopolymer,
            downsample: params.downsample,
            rejected: ErrorTallies::default(),
        }
    }

    /// Reads dropped because they did not fit the job amplicon.
    pub fn rejected(&self) -> &ErrorTallies {
        &self.rejected
    }

    fn prepare(&mut self, source: &JobSource, read_id: &str, seq: &str, tag: &str) -> Option<JobSequence> {
        let mut bytes = seq.as_bytes().to_vec();
        if let Some((amplicon_id, detagger)) = &self.job_amplicon {
            if source.amplicon_id.as_deref() != Some(amplicon_id.as_str()) {
                match detagger.detag(Read::new(read_id, bytes)) {
                    Ok(detagged) => bytes = detagged.read.seq,
                    Err(e) => {
                        self.rejected.record(e.kind, &e.message);
                        return None;
                    }
                }
            }
        }
        Some(JobSequence {
            id: format!("{}:{read_id}", source.id),
            seq: collapse_homopolymers(&bytes, self.max_homopolymer),
            tag: tag.to_string(),
        })
    }

    fn load(&mut self, kind: SourceKind, source: &JobSource) -> Result<Vec<JobSequence>> {
        let mut out = Vec::new();
        match kind {
            SourceKind::Dataset => {
                let tags = load_tag_index(self.store, &source.id)?;
                let seqs = load_sequences(self.store, &source.id)?;
                let per_tag = match self.downsample {
                    0 => usize::MAX,
                    n => n,
                };
                for (tag, entry) in &tags {
                    for read_id in entry.reads.iter().take(per_tag) {
                        let Some(seq) = seqs.get(read_id) else {
                            continue;
                        };
                        if let Some(s) = self.prepare(source, read_id, seq, tag) {
                            out.push(s);
                        }
                    }
                }
            }
            SourceKind::Refset => {
                for (read_id, seq) in &load_references(self.store, &source.id)? {
                    if let Some(s) = self.prepare(source, read_id, seq, "") {
                        out.push(s);
                    }
                }
            }
        }
        tracing::debug!(source = source.id.as_str(), reads = out.len(), "source loaded");
        Ok(out)
    }
}

impl Iterator for JobSequences<'_> {
    type Item = Result<JobSequence>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(seq) = self.current.next() {
                return Some(Ok(seq));
            }
            let (kind, source) = self.pending.pop_front()?;
            match self.load(kind, &source) {
                Ok(seqs) => self.current = seqs.into_iter(),
                Err(e) => {
                    self.pending.clear();
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        amplicon::Primer,
        blob_store::{MemoryBlobStore, write_blob},
        dataset::{SequenceStore, TagIndex, TagIndexEntry, refs_blob_name, seqs_blob_name, tags_blob_name},
        error::ErrorCode,
    };
    use scata_protocol::ReadErrorKind;

    fn source(id: &str, amplicon_id: Option<&str>) -> JobSource {
        JobSource {
            id: id.to_string(),
            amplicon_id: amplicon_id.map(str::to_string),
        }
    }

    fn store_dataset(store: &MemoryBlobStore, id: &str, reads: &[(&str, &str, &str)]) {
        let mut tags = TagIndex::new();
        let mut seqs = SequenceStore::new();
        for (tag, read, seq) in reads {
            let entry: &mut TagIndexEntry = tags.entry(tag.to_string()).or_default();
            entry.cnt += 1;
            entry.reads.push(read.to_string());
            seqs.insert(read.to_string(), seq.to_string());
        }
        write_blob(store, &tags_blob_name(id), &tags).unwrap();
        write_blob(store, &seqs_blob_name(id), &seqs).unwrap();
    }

    fn job(datasets: Vec<JobSource>, refsets: Vec<JobSource>) -> JobConfig {
        JobConfig {
            id: "j".to_string(),
            datasets,
            refsets,
            ..JobConfig::default()
        }
    }

    #[test]
    fn test_collapse_homopolymers() {
        assert_eq!(collapse_homopolymers(b"AAAAACGGGGT", 3), b"AAACGGGT".to_vec());
        assert_eq!(collapse_homopolymers(b"AAAAA", 0), b"AAAAA".to_vec());
        assert_eq!(collapse_homopolymers(b"", 2), Vec::<u8>::new());
    }

    #[test]
    fn test_flattens_datasets_then_refsets() {
        let store = MemoryBlobStore::new();
        store_dataset(&store, "d1", &[("TAG1", "r1", "ACGTTTTTA"), ("TAG2", "r2", "ACGT")]);
        let mut refs = SequenceStore::new();
        refs.insert("ref1".to_string(), "GGGG".to_string());
        write_blob(&store, &refs_blob_name("rs"), &refs).unwrap();

        let params = ClusterParameters::default();
        let job = job(vec![source("d1", None)], vec![source("rs", None)]);
        let seqs: Vec<JobSequence> = JobSequences::new(&store, &job, None, &params)
            .collect::<Result<_>>()
            .unwrap();
        let ids: Vec<&str> = seqs.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["d1:r1", "d1:r2", "rs:ref1"]);
        assert_eq!(seqs[0].seq, b"ACGTTTA".to_vec());
        assert_eq!(seqs[0].tag, "TAG1");
        assert_eq!(seqs[2].seq, b"GGG".to_vec());
    }

    #[test]
    fn test_downsample_keeps_first_reads_per_tag() {
        let store = MemoryBlobStore::new();
        store_dataset(
            &store,
            "d1",
            &[("A", "a1", "AC"), ("A", "a2", "AG"), ("A", "a3", "AT"), ("B", "b1", "CA")],
        );
        let params = ClusterParameters {
            downsample: 2,
            ..ClusterParameters::default()
        };
        let job = job(vec![source("d1", None)], Vec::new());
        let ids: Vec<String> = JobSequences::new(&store, &job, None, &params)
            .map(|s| s.unwrap().id)
            .collect();
        assert_eq!(ids, vec!["d1:a1", "d1:a2", "d1:b1"]);
    }

    #[test]
    fn test_redetags_when_job_amplicon_differs() {
        let store = MemoryBlobStore::new();
        store_dataset(
            &store,
            "d1",
            &[("T", "hit", "GGGACGTACCTTT"), ("T", "miss", "GGGGGGGGG")],
        );
        store_dataset(&store, "d2", &[("T", "same", "GGGACGTACCTTT")]);
        let amplicon = Amplicon::new("inner", Some(Primer::new("ACGTACC", 0)), None);
        let params = ClusterParameters {
            max_homopolymer: 0,
            ..ClusterParameters::default()
        };
        let job = job(
            vec![source("d1", Some("outer")), source("d2", Some("inner"))],
            Vec::new(),
        );
        let mut seqs = JobSequences::new(&store, &job, Some(&amplicon), &params);
        let first = seqs.next().unwrap().unwrap();
        assert_eq!(first.seq, b"TTT".to_vec());
        let second = seqs.next().unwrap().unwrap();
        assert_eq!(second.id, "d2:same");
        assert_eq!(second.seq, b"GGGACGTACCTTT".to_vec());
        assert!(seqs.next().is_none());
        assert_eq!(seqs.rejected().count(ReadErrorKind::NoPrimer5), 1);
    }

    #[test]
    fn test_missing_artifacts_fail() {
        let store = MemoryBlobStore::new();
        let params = ClusterParameters::default();
        let job = job(vec![source("nope", None)], Vec::new());
        let mut seqs = JobSequences::new(&store, &job, None, &params);
        assert_eq!(seqs.next().unwrap().unwrap_err().code, ErrorCode::NotFound);
        assert!(seqs.next().is_none());
    }
}
