use crate::{
    aligner::{PairwiseAligner, aligner_for},
    amplicon::Amplicon,
    blob_store::BlobStore,
    chunk_store::{ChunkSet, ChunkStore},
    cluster_merge::{finalize_clusters, merge_level},
    cluster_task::{group_chunks, low_frequency_uniques, plan_tasks},
    config::{EngineSettings, JobConfig},
    dataset::PROGRESS_INTERVAL,
    error::{ErrorCode, Result, ScataError},
    job::{CancelToken, JobState},
    job_sequences::JobSequences,
    transport::TaskTransport,
};
use scata_protocol::{ErrorTallies, JobPhase, JobStatus};
use serde::{Deserialize, Serialize};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job: String,
    pub reads: u64,
    pub chunks: usize,
    /// Deduplication was skipped because the chunk set already existed.
    pub reused_chunks: bool,
    pub tasks: usize,
    pub merge_levels: usize,
    pub clusters: usize,
    pub rejected: ErrorTallies,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Done(JobSummary),
    Aborted,
}

/// Drives one clustering job through its phases.
pub struct JobController<'a> {
    store: Arc<dyn BlobStore>,
    transport: Arc<dyn TaskTransport>,
    aligner: Arc<dyn PairwiseAligner>,
    settings: EngineSettings,
    cancel: CancelToken,
    on_status: Box<dyn FnMut(&JobStatus) + 'a>,
}

impl<'a> JobController<'a> {
    pub fn new(store: Arc<dyn BlobStore>, transport: Arc<dyn TaskTransport>, settings: EngineSettings) -> Self {
        Self {
            store,
            transport,
            aligner: aligner_for(settings.aligner),
            settings,
            cancel: CancelToken::new(),
            on_status: Box::new(|_| {}),
        }
    }

    pub fn with_aligner(mut self, aligner: Arc<dyn PairwiseAligner>) -> Self {
        self.aligner = aligner;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn on_status(mut self, f: impl FnMut(&JobStatus) + 'a) -> Self {
        self.on_status = Box::new(f);
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn emit(&mut self, state: &JobState, progress: impl Into<String>) {
        let status = state.status(progress);
        tracing::debug!(phase = %status.phase, progress = status.progress.as_str(), "job status");
        (self.on_status)(&status);
    }

    fn enter(&mut self, state: &mut JobState, phase: JobPhase, progress: impl Into<String>) -> Result<()> {
        state.transition(phase)?;
        self.emit(state, progress);
        Ok(())
    }

    pub fn run(&mut self, job: &JobConfig) -> Result<JobOutcome> {
        let amplicon = job.load_amplicon()?;
        self.run_with_amplicon(job, amplicon.as_ref())
    }

    pub fn run_with_amplicon(&mut self, job: &JobConfig, amplicon: Option<&Amplicon>) -> Result<JobOutcome> {
        let mut state = JobState::new(&job.id);
        match self.drive(&mut state, job, amplicon) {
            Ok(Some(summary)) => Ok(JobOutcome::Done(summary)),
            Ok(None) => {
                self.enter(&mut state, JobPhase::Aborted, "Aborted")?;
                tracing::warn!(job = job.id.as_str(), "job cancelled");
                Ok(JobOutcome::Aborted)
            }
            Err(e) => {
                if !state.phase().is_terminal() {
                    self.enter(&mut state, JobPhase::Failed, format!("Failed: {}", e.message))?;
                }
                tracing::warn!(job = job.id.as_str(), error = %e, "job failed");
                Err(e)
            }
        }
    }

    /// `Ok(None)` when the job was cancelled at a checkpoint.
    fn drive(&mut self, state: &mut JobState, job: &JobConfig, amplicon: Option<&Amplicon>) -> Result<Option<JobSummary>> {
        let store = Arc::clone(&self.store);
        self.enter(state, JobPhase::Preparing, "Preparing")?;
        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        job.parameters.validate()?;
        let mut summary = JobSummary {
            job: job.id.clone(),
            ..JobSummary::default()
        };

        let chunkset = match ChunkSet::load(&*store, &job.id)? {
            Some(existing) => {
                self.enter(state, JobPhase::Deduplicating, format!("Reusing {} chunks", existing.chunks.len()))?;
                summary.reused_chunks = true;
                existing
            }
            None => {
                self.enter(state, JobPhase::Deduplicating, "Deduplicating")?;
                if self.cancel.is_cancelled() {
                    return Ok(None);
                }
                let mut chunks = ChunkStore::new(&job.id, self.settings.chunk_capacity, &*store);
                let mut sequences = JobSequences::new(&*store, job, amplicon, &job.parameters);
                let mut done: u64 = 0;
                for seq in sequences.by_ref() {
                    let seq = seq?;
                    chunks.add(seq.id, &seq.seq)?;
                    done += 1;
                    if done % PROGRESS_INTERVAL == 0 {
                        self.emit(state, format!("Deduplicating, {done} reads done"));
                        if self.cancel.is_cancelled() {
                            return Ok(None);
                        }
                    }
                }
                summary.rejected = sequences.rejected().clone();
                chunks.finish()?
            }
        };
        summary.reads = chunkset.reads;
        summary.chunks = chunkset.chunks.len();

        self.enter(state, JobPhase::Clustering, format!("Clustering {} chunks", chunkset.chunks.len()))?;
        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        let groups = group_chunks(&chunkset.chunks, self.settings.group_target)?;
        let excluded = Arc::new(low_frequency_uniques(&*store, &chunkset.chunks, job.parameters.lowfreq)?);
        let tasks = plan_tasks(&job.id, &groups, &job.parameters, self.settings.aligner_threads);
        summary.tasks = tasks.len();

        let group = format!("cluster_{}", job.id);
        self.transport.delete_group(&group);
        for task in tasks {
            let store = Arc::clone(&store);
            let aligner = Arc::clone(&self.aligner);
            let excluded = Arc::clone(&excluded);
            self.transport.submit(
                &group,
                Box::new(move || task.run(&*store, &*aligner, &excluded).map(|_| ())),
            );
        }
        tracing::info!(job = job.id.as_str(), groups = groups.len(), tasks = summary.tasks, "clustering tasks dispatched");
        self.emit(state, format!("Clustering, {} tasks dispatched", summary.tasks));

        let Some((succeeded, failed)) = self.wait_for_tasks(state, &group, summary.tasks) else {
            return Ok(None);
        };
        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        if failed > 0 {
            let first = self
                .transport
                .failures(&group)
                .into_iter()
                .next()
                .map(|f| f.message)
                .unwrap_or_else(|| "timed out".to_string());
            self.transport.delete_group(&group);
            return Err(ScataError::new(
                ErrorCode::TaskFailed,
                format!("{failed} of {} clustering tasks failed: {first}", succeeded + failed),
            ));
        }
        self.transport.delete_group(&group);

        self.enter(state, JobPhase::Merging, format!("Merging {} sub-cluster sets", summary.tasks))?;
        let (mut level, mut count) = (0, summary.tasks);
        while count > 1 {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            count = merge_level(&*store, &job.id, level, count, self.settings.merge_fan_in)?;
            level += 1;
            self.emit(state, format!("Merging, level {level}: {count} sets"));
        }
        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        let clusters = finalize_clusters(&*store, &job.id, level, summary.tasks, &chunkset.chunks)?;
        summary.merge_levels = level;
        summary.clusters = clusters.clusters.len();

        self.enter(state, JobPhase::Done, format!("Done, {} clusters", summary.clusters))?;
        Ok(Some(summary))
    }

    /// Polls until every dispatched task resolved or the wait timed out, in
    /// which case outstanding tasks count as failed. `None` on cancellation.
    fn wait_for_tasks(&mut self, state: &JobState, group: &str, dispatched: usize) -> Option<(usize, usize)> {
        let start = Instant::now();
        let interval = Duration::from_millis(self.settings.poll_interval_ms.max(1));
        let timeout = Duration::from_secs(self.settings.wait_timeout_secs);
        let mut last_resolved = 0;
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            let succeeded = self.transport.count_succeeded(group);
            let failed = self.transport.count_failed(group);
            if succeeded + failed >= dispatched {
                return Some((succeeded, failed));
            }
            if start.elapsed() >= timeout {
                tracing::warn!(group, outstanding = dispatched - succeeded - failed, "clustering tasks timed out");
                return Some((succeeded, dispatched - succeeded));
            }
            if succeeded + failed != last_resolved {
                last_resolved = succeeded + failed;
                self.emit(state, format!("Clustering, {last_resolved}/{dispatched} tasks done"));
            }
            std::thread::sleep(interval);
        }
    }
}
