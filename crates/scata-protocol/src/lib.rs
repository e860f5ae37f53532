//! Machine-readable contracts shared between the SCATA engine, its command
//! line and whatever record layer stores job and dataset state.
//!
//! Every identifier here serializes to a stable, locale-independent string so
//! that counts can be aggregated across runs and stored next to the records.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Why a single read was dropped. Never fatal to the stream it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadErrorKind {
    PairingFailed,
    TooShort,
    TooLong,
    LowMeanQuality,
    LowMinQuality,
    #[serde(rename = "no_primer5")]
    NoPrimer5,
    #[serde(rename = "no_primer3")]
    NoPrimer3,
    #[serde(rename = "no_tag5")]
    NoTag5,
    #[serde(rename = "no_tag3")]
    NoTag3,
    ChimericTag,
}

impl ReadErrorKind {
    pub const ALL: [ReadErrorKind; 10] = [
        ReadErrorKind::PairingFailed,
        ReadErrorKind::TooShort,
        ReadErrorKind::TooLong,
        ReadErrorKind::LowMeanQuality,
        ReadErrorKind::LowMinQuality,
        ReadErrorKind::NoPrimer5,
        ReadErrorKind::NoPrimer3,
        ReadErrorKind::NoTag5,
        ReadErrorKind::NoTag3,
        ReadErrorKind::ChimericTag,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReadErrorKind::PairingFailed => "pairing_failed",
            ReadErrorKind::TooShort => "too_short",
            ReadErrorKind::TooLong => "too_long",
            ReadErrorKind::LowMeanQuality => "low_mean_quality",
            ReadErrorKind::LowMinQuality => "low_min_quality",
            ReadErrorKind::NoPrimer5 => "no_primer5",
            ReadErrorKind::NoPrimer3 => "no_primer3",
            ReadErrorKind::NoTag5 => "no_tag5",
            ReadErrorKind::NoTag3 => "no_tag3",
            ReadErrorKind::ChimericTag => "chimeric_tag",
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            ReadErrorKind::PairingFailed => "Pairing failed",
            ReadErrorKind::TooShort => "Read too short",
            ReadErrorKind::TooLong => "Read too long",
            ReadErrorKind::LowMeanQuality => "Too low mean quality",
            ReadErrorKind::LowMinQuality => "Too low minimum quality",
            ReadErrorKind::NoPrimer5 => "No 5' primer found",
            ReadErrorKind::NoPrimer3 => "No 3' primer found",
            ReadErrorKind::NoTag5 => "No 5' tag found",
            ReadErrorKind::NoTag3 => "No 3' tag found",
            ReadErrorKind::ChimericTag => "Chimeric tags",
        }
    }
}

impl fmt::Display for ReadErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Count of one failure kind plus the first message seen for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorTally {
    pub message: String,
    pub count: u64,
}

/// Failure counts keyed by kind. Memory is bounded by the number of kinds,
/// not by the number of failing reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorTallies(BTreeMap<ReadErrorKind, ErrorTally>);

impl ErrorTallies {
    pub fn record(&mut self, kind: ReadErrorKind, message: &str) {
        self.0
            .entry(kind)
            .and_modify(|t| t.count += 1)
            .or_insert_with(|| ErrorTally {
                message: message.to_string(),
                count: 1,
            });
    }

    pub fn count(&self, kind: ReadErrorKind) -> u64 {
        self.0.get(&kind).map(|t| t.count).unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().map(|t| t.count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReadErrorKind, &ErrorTally)> {
        self.0.iter()
    }

    pub fn merge(&mut self, other: &ErrorTallies) {
        for (kind, tally) in other.iter() {
            self.0
                .entry(*kind)
                .and_modify(|t| t.count += tally.count)
                .or_insert_with(|| tally.clone());
        }
    }
}

/// Layout of the uploaded read files of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    #[default]
    Fastq,
    PairedFastq,
    Fasta,
    FastaQual,
}

impl FileFormat {
    pub fn has_quality(&self) -> bool {
        !matches!(self, FileFormat::Fasta)
    }

    pub fn needs_second_file(&self) -> bool {
        matches!(self, FileFormat::PairedFastq | FileFormat::FastaQual)
    }
}

/// Read acceptance policy of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMethod {
    /// Sequence only, no quality screen.
    Fs,
    /// Full-sequence quality screen, then detag.
    Fsq,
    /// High-quality region extraction, then detag.
    Hqr,
    /// Detag first, then screen the amplicon region.
    #[default]
    Ampq,
}

impl FilterMethod {
    pub fn needs_quality(&self) -> bool {
        !matches!(self, FilterMethod::Fs)
    }
}

/// Lifecycle of a clustering job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum JobPhase {
    #[default]
    Pending,
    Preparing,
    Deduplicating,
    Clustering,
    Merging,
    Done,
    Failed,
    Aborted,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Pending => "Pending",
            JobPhase::Preparing => "Preparing",
            JobPhase::Deduplicating => "Deduplicating",
            JobPhase::Clustering => "Clustering",
            JobPhase::Merging => "Merging",
            JobPhase::Done => "Done",
            JobPhase::Failed => "Failed",
            JobPhase::Aborted => "Aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Done | JobPhase::Failed | JobPhase::Aborted)
    }

    pub fn can_transition_to(&self, next: JobPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            JobPhase::Failed | JobPhase::Aborted => true,
            JobPhase::Preparing => *self == JobPhase::Pending,
            JobPhase::Deduplicating => *self == JobPhase::Preparing,
            JobPhase::Clustering => *self == JobPhase::Deduplicating,
            JobPhase::Merging => *self == JobPhase::Clustering,
            JobPhase::Done => *self == JobPhase::Merging,
            JobPhase::Pending => false,
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the record layer stores for a job after every checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobStatus {
    pub phase: JobPhase,
    pub progress: String,
}
