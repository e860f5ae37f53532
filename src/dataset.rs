use crate::{
    amplicon::Amplicon,
    blob_store::{BlobStore, read_blob, write_blob},
    config::{DatasetSettings, RefsetSettings},
    error::{ReadFailure, Result, ScataError},
    read::DetaggedRead,
    read_parser::ReadParser,
    reads::{FilterSettings, Reads},
};
use scata_protocol::{ErrorTallies, FileFormat, FilterMethod};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, time::Instant};

pub const PROGRESS_INTERVAL: u64 = 10_000;

/// Reads assigned to one tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagIndexEntry {
    pub cnt: u64,
    pub rev: u64,
    pub reads: Vec<String>,
}

/// Tag name -> reads carrying it.
pub type TagIndex = BTreeMap<String, TagIndexEntry>;
/// Read id -> accepted, uppercased sequence.
pub type SequenceStore = BTreeMap<String, String>;

pub fn tags_blob_name(dataset: &str) -> String {
    format!("tags_{dataset}")
}

pub fn seqs_blob_name(dataset: &str) -> String {
    format!("seqs_{dataset}")
}

pub fn refs_blob_name(refset: &str) -> String {
    format!("refs_{refset}")
}

pub fn load_tag_index(store: &dyn BlobStore, dataset: &str) -> Result<TagIndex> {
    read_blob(store, &tags_blob_name(dataset))
}

pub fn load_sequences(store: &dyn BlobStore, dataset: &str) -> Result<SequenceStore> {
    read_blob(store, &seqs_blob_name(dataset))
}

pub fn load_references(store: &dyn BlobStore, refset: &str) -> Result<SequenceStore> {
    read_blob(store, &refs_blob_name(refset))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterProgress {
    pub total_reads: u64,
    pub good_reads: u64,
}

impl fmt::Display for FilterProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Filtering, {} reads done. {} reads accepted",
            self.total_reads, self.good_reads
        )
    }
}

/// Outcome of processing one dataset or reference set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetReport {
    pub id: String,
    pub validated: bool,
    pub is_valid: bool,
    pub progress: String,
    pub seq_count: u64,
    pub seq_total: u64,
    pub seq_rev: u64,
    pub tag_count: usize,
    pub process_time_secs: f64,
    pub errors: ErrorTallies,
}

impl DatasetReport {
    fn failed(id: &str, err: &ScataError) -> Self {
        tracing::warn!(dataset = id, code = err.code.as_str(), "{}", err.message);
        Self {
            id: id.to_string(),
            validated: true,
            is_valid: false,
            progress: format!("Failed: {}", err.message),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct FilterRun {
    total: u64,
    good: u64,
    errors: ErrorTallies,
}

/// Drains a read pipeline, tallying skipped reads by kind. A fatal failure
/// stops the run.
fn run_filter<I>(
    reads: I,
    on_progress: &mut dyn FnMut(&FilterProgress),
    mut accept: impl FnMut(DetaggedRead),
) -> std::result::Result<FilterRun, ScataError>
where
    I: Iterator<Item = std::result::Result<DetaggedRead, ReadFailure>>,
{
    let mut run = FilterRun::default();
    for item in reads {
        run.total += 1;
        if run.total % PROGRESS_INTERVAL == 0 {
            on_progress(&FilterProgress {
                total_reads: run.total,
                good_reads: run.good,
            });
        }
        match item {
            Ok(read) => {
                run.good += 1;
                accept(read);
            }
            Err(ReadFailure::Skip(e)) => run.errors.record(e.kind, &e.message),
            Err(ReadFailure::Fatal(e)) => return Err(e),
        }
    }
    Ok(run)
}

fn open_reads(
    settings: &DatasetSettings,
    amplicon: Option<&Amplicon>,
    filter: &FilterSettings,
) -> Result<Reads<ReadParser>> {
    let parser = ReadParser::open(
        settings.format,
        &settings.file1,
        settings.file2.as_deref(),
        settings.pairing,
    )?;
    Reads::from_parser(parser, amplicon, filter)
}

/// Filters and detags a read dataset into its `tags_` and `seqs_` blobs.
///
/// Problems with the input itself are reported through an invalid
/// [`DatasetReport`]; only storage failures are returned as errors.
pub fn check_dataset(
    settings: &DatasetSettings,
    amplicon: Option<&Amplicon>,
    store: &dyn BlobStore,
    on_progress: &mut dyn FnMut(&FilterProgress),
) -> Result<DatasetReport> {
    let start = Instant::now();
    let reads = match open_reads(settings, amplicon, &settings.filter) {
        Ok(reads) => reads,
        Err(e) => return Ok(DatasetReport::failed(&settings.id, &e)),
    };

    let mut tags = TagIndex::new();
    let mut seqs = SequenceStore::new();
    let mut rev_reads = 0;
    let run = run_filter(reads, on_progress, |read| {
        let entry = tags.entry(read.tag).or_default();
        entry.cnt += 1;
        if read.reversed {
            entry.rev += 1;
            rev_reads += 1;
        }
        let seq = read.read.seq_string().to_ascii_uppercase();
        entry.reads.push(read.read.id.clone());
        seqs.insert(read.read.id, seq);
    });
    let run = match run {
        Ok(run) => run,
        Err(e) => return Ok(DatasetReport::failed(&settings.id, &e)),
    };

    write_blob(store, &tags_blob_name(&settings.id), &tags)?;
    write_blob(store, &seqs_blob_name(&settings.id), &seqs)?;

    let report = DatasetReport {
        id: settings.id.clone(),
        validated: true,
        is_valid: run.good > 0,
        progress: format!("Ready, {}/{} good reads", run.good, run.total),
        seq_count: run.good,
        seq_total: run.total,
        seq_rev: rev_reads,
        tag_count: tags.len(),
        process_time_secs: start.elapsed().as_secs_f64(),
        errors: run.errors,
    };
    tracing::info!(
        dataset = settings.id.as_str(),
        good = report.seq_count,
        total = report.seq_total,
        tags = report.tag_count,
        "dataset processed"
    );
    Ok(report)
}

/// Cuts reference sequences to the amplicon and stores them as `refs_`.
pub fn check_refset(
    settings: &RefsetSettings,
    amplicon: Option<&Amplicon>,
    store: &dyn BlobStore,
    on_progress: &mut dyn FnMut(&FilterProgress),
) -> Result<DatasetReport> {
    let start = Instant::now();
    let as_dataset = DatasetSettings {
        id: settings.id.clone(),
        format: FileFormat::Fasta,
        file1: settings.file.clone(),
        ..DatasetSettings::default()
    };
    let filter = FilterSettings {
        method: FilterMethod::Fs,
        keep_primer: false,
        ignore_tags: true,
        ..FilterSettings::default()
    };
    let reads = match open_reads(&as_dataset, amplicon, &filter) {
        Ok(reads) => reads,
        Err(e) => return Ok(DatasetReport::failed(&settings.id, &e)),
    };

    let mut refs = SequenceStore::new();
    let run = match run_filter(reads, on_progress, |read| {
        let seq = read.read.seq_string().to_ascii_uppercase();
        refs.insert(read.read.id, seq);
    }) {
        Ok(run) => run,
        Err(e) => return Ok(DatasetReport::failed(&settings.id, &e)),
    };

    write_blob(store, &refs_blob_name(&settings.id), &refs)?;
    tracing::info!(refset = settings.id.as_str(), good = run.good, "reference set processed");
    Ok(DatasetReport {
        id: settings.id.clone(),
        validated: true,
        is_valid: run.good > 0,
        progress: format!("Ready, {}/{} good reads", run.good, run.total),
        seq_count: run.good,
        seq_total: run.total,
        seq_rev: 0,
        tag_count: 0,
        process_time_secs: start.elapsed().as_secs_f64(),
        errors: run.errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        amplicon::{Primer, TagSet},
        blob_store::MemoryBlobStore,
        iupac_code::reverse_complement,
    };
    use flate2::{Compression, write::GzEncoder};
    use scata_protocol::ReadErrorKind;
    use std::{fs, io::Write, path::Path};

    const PRIMER5: &str = "GTGAATCATCGAATCTTTG";
    const PAYLOAD: &str = "AACGCACATTGCGCCCTTTGGTATTCCGAAGGG";

    fn amplicon() -> Amplicon {
        let mut tags = TagSet::new();
        tags.insert("ACGTAC", "TAG1", Vec::new());
        tags.insert("TGCATG", "TAG2", Vec::new());
        Amplicon::new("a", Some(Primer::new(PRIMER5, 1)), None).with_tags(Some(tags), None)
    }

    fn write_gzip_fastq(path: &Path, reads: &[(&str, String)]) {
        let file = fs::File::create(path).unwrap();
        let mut encoder = GzEncoder::new(file, Compression::default());
        for (id, seq) in reads {
            write!(encoder, "@{id}\n{seq}\n+\n{}\n", "I".repeat(seq.len())).unwrap();
        }
        encoder.finish().unwrap();
    }

    fn settings(dir: &Path, method: FilterMethod) -> DatasetSettings {
        DatasetSettings {
            id: "ds1".to_string(),
            format: FileFormat::Fastq,
            file1: dir.join("reads.fq.gz"),
            filter: FilterSettings {
                method,
                ..FilterSettings::default()
            },
            ..DatasetSettings::default()
        }
    }

    #[test]
    fn test_check_dataset_builds_tag_index() {
        let dir = tempfile::tempdir().unwrap();
        let reversed = reverse_complement(format!("TGCATG{PRIMER5}{PAYLOAD}").as_bytes());
        write_gzip_fastq(
            &dir.path().join("reads.fq.gz"),
            &[
                ("r1", format!("ACGTAC{PRIMER5}{PAYLOAD}")),
                ("r2", String::from_utf8(reversed).unwrap()),
                ("r3", PAYLOAD.to_string()),
                (
                    "r4",
                    format!("acgtac{}{}", PRIMER5.to_lowercase(), PAYLOAD.to_lowercase()),
                ),
            ],
        );
        let store = MemoryBlobStore::new();
        let report = check_dataset(
            &settings(dir.path(), FilterMethod::Ampq),
            Some(&amplicon()),
            &store,
            &mut |_| {},
        )
        .unwrap();

        assert!(report.is_valid);
        assert_eq!(report.seq_total, 4);
        assert_eq!(report.seq_count, 3);
        assert_eq!(report.seq_rev, 1);
        assert_eq!(report.tag_count, 2);
        assert_eq!(report.errors.count(ReadErrorKind::NoPrimer5), 1);
        assert_eq!(report.progress, "Ready, 3/4 good reads");

        let tags = load_tag_index(&store, "ds1").unwrap();
        assert_eq!(
            tags["TAG1"],
            TagIndexEntry {
                cnt: 2,
                rev: 0,
                reads: vec!["r1".to_string(), "r4".to_string()],
            }
        );
        assert_eq!(tags["TAG2"].rev, 1);
        let seqs = load_sequences(&store, "ds1").unwrap();
        assert_eq!(seqs["r1"], PAYLOAD);
        assert_eq!(seqs["r2"], PAYLOAD);
        assert_eq!(seqs["r4"], PAYLOAD);
    }

    #[test]
    fn test_progress_every_ten_thousand_reads() {
        let dir = tempfile::tempdir().unwrap();
        let reads: Vec<(&str, String)> = (0..PROGRESS_INTERVAL + 5)
            .map(|_| ("r", "ACGT".to_string()))
            .collect();
        write_gzip_fastq(&dir.path().join("reads.fq.gz"), &reads);
        let store = MemoryBlobStore::new();
        let mut seen = Vec::new();
        let report = check_dataset(&settings(dir.path(), FilterMethod::Fs), None, &store, &mut |p| {
            seen.push(p.to_string())
        })
        .unwrap();
        assert_eq!(seen, vec!["Filtering, 10000 reads done. 9999 reads accepted"]);
        assert_eq!(report.seq_total, PROGRESS_INTERVAL + 5);
        assert_eq!(report.tag_count, 1);
    }

    #[test]
    fn test_fatal_input_marks_dataset_invalid() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("reads.fa"), ">a\nACGT\n").unwrap();
        fs::write(dir.path().join("reads.qual"), ">b\n30 30 30 30\n").unwrap();
        let settings = DatasetSettings {
            id: "ds2".to_string(),
            format: FileFormat::FastaQual,
            file1: dir.path().join("reads.fa"),
            file2: Some(dir.path().join("reads.qual")),
            ..DatasetSettings::default()
        };
        let store = MemoryBlobStore::new();
        let report = check_dataset(&settings, Some(&amplicon()), &store, &mut |_| {}).unwrap();
        assert!(report.validated);
        assert!(!report.is_valid);
        assert!(report.progress.starts_with("Failed: "));
        assert!(store.list("").unwrap().is_empty());

        let fasta_only = DatasetSettings {
            format: FileFormat::Fasta,
            file2: None,
            ..settings
        };
        let report = check_dataset(&fasta_only, Some(&amplicon()), &store, &mut |_| {}).unwrap();
        assert_eq!(
            report.progress,
            "Failed: Selected filtering method requires quality data"
        );
    }

    #[test]
    fn test_check_refset_strips_primers_and_ignores_tags() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("refs.fasta"),
            format!(">ref1 some species\nGGGGGG{PRIMER5}{PAYLOAD}\n>ref2\nTTTTTTTTTT\n"),
        )
        .unwrap();
        let settings = RefsetSettings {
            id: "rs".to_string(),
            file: dir.path().join("refs.fasta"),
            amplicon_file: None,
        };
        let store = MemoryBlobStore::new();
        let report = check_refset(&settings, Some(&amplicon()), &store, &mut |_| {}).unwrap();
        assert!(report.is_valid);
        assert_eq!(report.seq_count, 1);
        assert_eq!(report.errors.count(ReadErrorKind::NoPrimer5), 1);
        let refs = load_references(&store, "rs").unwrap();
        assert_eq!(refs["ref1"], PAYLOAD);
    }
}
