use crate::{
    amplicon::Amplicon,
    error::{ErrorCode, Result, ScataError},
    pairing::PairingParams,
    reads::FilterSettings,
};
use scata_protocol::FileFormat;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};

fn load_json<T: DeserializeOwned>(path: &str, what: &str) -> Result<T> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        ScataError::new(ErrorCode::Io, format!("Could not read {what} file '{path}': {e}"))
    })?;
    serde_json::from_str(&text).map_err(|e| {
        ScataError::new(
            ErrorCode::InvalidInput,
            format!("Could not parse {what} JSON '{path}': {e}"),
        )
    })
}

fn base_dir(path: &str) -> PathBuf {
    Path::new(path)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default()
}

fn resolve(base: &Path, path: &mut PathBuf) {
    if path.is_relative() && !path.as_os_str().is_empty() {
        *path = base.join(&*path);
    }
}

fn check_range(name: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if !(min..=max).contains(&value) {
        return Err(ScataError::new(
            ErrorCode::InvalidInput,
            format!("{name} must be between {min} and {max}, got {value}"),
        ));
    }
    Ok(())
}

/// Clustering method parameters of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterParameters {
    /// Maximum normalized distance for two sequences to be linked.
    pub distance: f64,
    /// Minimum fraction of both sequences covered by the alignment.
    pub min_alignment: f64,
    pub mismatch_pen: f64,
    pub open_pen: f64,
    pub extend_pen: f64,
    /// Weight of end gaps relative to internal gaps.
    pub endgap_pen: f64,
    /// Homopolymers longer than this are collapsed; 0 disables.
    pub max_homopolymer: usize,
    /// Per-tag read cap; 0 disables.
    pub downsample: usize,
    /// Unique sequences seen fewer times than this are dropped; 0 disables.
    pub lowfreq: u64,
}

impl Default for ClusterParameters {
    fn default() -> Self {
        Self {
            distance: 0.015,
            min_alignment: 0.9,
            mismatch_pen: 1.0,
            open_pen: 1.0,
            extend_pen: 0.0,
            endgap_pen: 0.0,
            max_homopolymer: 3,
            downsample: 0,
            lowfreq: 0,
        }
    }
}

impl ClusterParameters {
    pub fn validate(&self) -> Result<()> {
        check_range("distance", self.distance, 0.001, 0.10)?;
        check_range("min_alignment", self.min_alignment, 0.5, 1.0)?;
        check_range("mismatch_pen", self.mismatch_pen, 0.0, 100.0)?;
        check_range("open_pen", self.open_pen, 0.0, 100.0)?;
        check_range("extend_pen", self.extend_pen, 0.0, 100.0)?;
        check_range("endgap_pen", self.endgap_pen, 0.0, 100.0)?;
        check_range("max_homopolymer", self.max_homopolymer as f64, 0.0, 10.0)?;
        check_range("downsample", self.downsample as f64, 0.0, 1e5)?;
        check_range("lowfreq", self.lowfreq as f64, 0.0, 100.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignerKind {
    #[default]
    Vsearch,
    Global,
}

/// Engine tuning shared by all jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub blob_dir: PathBuf,
    /// Unique sequences per sealed chunk.
    pub chunk_capacity: usize,
    /// Target number of unique sequences per clustering group.
    pub group_target: usize,
    /// Sub-cluster sets merged per batch.
    pub merge_fan_in: usize,
    pub poll_interval_ms: u64,
    /// Tasks still outstanding after this long count as failed.
    pub wait_timeout_secs: u64,
    /// 0 lets the pool pick one thread per core.
    pub worker_threads: usize,
    pub aligner: AlignerKind,
    /// Threads given to each external aligner process.
    pub aligner_threads: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            blob_dir: PathBuf::from("blobs"),
            chunk_capacity: 2000,
            group_target: 4000,
            merge_fan_in: 8,
            poll_interval_ms: 2000,
            wait_timeout_secs: 24 * 3600,
            worker_threads: 0,
            aligner: AlignerKind::default(),
            aligner_threads: 1,
        }
    }
}

impl EngineSettings {
    pub fn load_from_path(path: &str) -> Result<Self> {
        let mut settings: Self = load_json(path, "engine settings")?;
        resolve(&base_dir(path), &mut settings.blob_dir);
        Ok(settings)
    }
}

/// One uploaded read dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetSettings {
    pub id: String,
    pub format: FileFormat,
    pub file1: PathBuf,
    pub file2: Option<PathBuf>,
    pub filter: FilterSettings,
    pub pairing: PairingParams,
    pub amplicon_file: Option<PathBuf>,
}

impl DatasetSettings {
    pub fn load_from_path(path: &str) -> Result<Self> {
        let mut settings: Self = load_json(path, "dataset")?;
        let base = base_dir(path);
        resolve(&base, &mut settings.file1);
        for p in [&mut settings.file2, &mut settings.amplicon_file].into_iter().flatten() {
            resolve(&base, p);
        }
        Ok(settings)
    }

    pub fn load_amplicon(&self) -> Result<Option<Amplicon>> {
        load_optional_amplicon(self.amplicon_file.as_deref())
    }
}

/// One uploaded reference-sequence set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefsetSettings {
    pub id: String,
    pub file: PathBuf,
    pub amplicon_file: Option<PathBuf>,
}

impl RefsetSettings {
    pub fn load_from_path(path: &str) -> Result<Self> {
        let mut settings: Self = load_json(path, "reference set")?;
        let base = base_dir(path);
        resolve(&base, &mut settings.file);
        if let Some(p) = settings.amplicon_file.as_mut() {
            resolve(&base, p);
        }
        Ok(settings)
    }

    pub fn load_amplicon(&self) -> Result<Option<Amplicon>> {
        load_optional_amplicon(self.amplicon_file.as_deref())
    }
}

fn load_optional_amplicon(path: Option<&Path>) -> Result<Option<Amplicon>> {
    path.map(|p| Amplicon::load_from_path(&p.to_string_lossy()))
        .transpose()
}

/// A processed dataset or reference set taking part in a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSource {
    pub id: String,
    /// Amplicon the source was detagged with.
    pub amplicon_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub id: String,
    pub amplicon_file: Option<PathBuf>,
    pub datasets: Vec<JobSource>,
    pub refsets: Vec<JobSource>,
    pub parameters: ClusterParameters,
}

impl JobConfig {
    pub fn load_from_path(path: &str) -> Result<Self> {
        let mut config: Self = load_json(path, "job")?;
        if let Some(p) = config.amplicon_file.as_mut() {
            resolve(&base_dir(path), p);
        }
        config.parameters.validate()?;
        Ok(config)
    }

    pub fn load_amplicon(&self) -> Result<Option<Amplicon>> {
        load_optional_amplicon(self.amplicon_file.as_deref())
    }
}
