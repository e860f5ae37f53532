use crate::{
    chunk_store::UniqueSequence,
    config::{AlignerKind, ClusterParameters},
    error::{ErrorCode, ScataError},
};
use bio::{
    alignment::{AlignmentOperation, pairwise::Aligner},
    io::fasta,
};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    io::ErrorKind,
    path::Path,
    process::{Command, Output},
    sync::Arc,
};

const DEFAULT_VSEARCH_BIN: &str = "vsearch";
const VSEARCH_ENV_BIN: &str = "SCATA_VSEARCH_BIN";
const VSEARCH_USERFIELDS: &str =
    "query+target+id+qlo+qhi+tlo+thi+ql+tl+qcov+tcov+mism+opens+exts+pairs+ids+alnlen";

/// One reported alignment. Positions are 0-based and half-open; identity and
/// coverages are fractions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentHit {
    pub query: String,
    pub target: String,
    pub identity: f64,
    pub qlo: usize,
    pub qhi: usize,
    pub tlo: usize,
    pub thi: usize,
    pub qlen: usize,
    pub tlen: usize,
    pub qcov: f64,
    pub tcov: f64,
    pub mismatches: usize,
    pub gap_opens: usize,
    pub gap_extensions: usize,
    pub pairs: usize,
    pub ids: usize,
    pub aln_len: usize,
}

impl AlignmentHit {
    pub fn query_span(&self) -> usize {
        self.qhi.saturating_sub(self.qlo)
    }

    pub fn target_span(&self) -> usize {
        self.thi.saturating_sub(self.tlo)
    }

    pub fn is_self_hit(&self) -> bool {
        self.query == self.target
    }
}

/// Penalty-weighted edit count per aligned base.
pub fn hit_distance(hit: &AlignmentHit, params: &ClusterParameters) -> f64 {
    let span = hit.query_span().max(hit.target_span());
    if span == 0 {
        return f64::INFINITY;
    }
    (params.mismatch_pen * hit.mismatches as f64
        + params.open_pen * hit.gap_opens as f64
        + params.extend_pen * hit.gap_extensions as f64)
        / span as f64
}

/// Whether a hit links its query and target into one cluster.
pub fn accept_hit(hit: &AlignmentHit, params: &ClusterParameters) -> bool {
    hit.qcov.min(hit.tcov) >= params.min_alignment && hit_distance(hit, params) <= params.distance
}

pub fn identity_floor(distance: f64) -> f64 {
    (1.0 - distance - 0.02).max(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignerParams {
    pub mismatch_pen: f64,
    pub open_pen: f64,
    pub extend_pen: f64,
    pub endgap_pen: f64,
    pub min_identity: f64,
    pub threads: usize,
}

impl AlignerParams {
    pub fn from_parameters(params: &ClusterParameters, threads: usize) -> Self {
        Self {
            mismatch_pen: params.mismatch_pen,
            open_pen: params.open_pen,
            extend_pen: params.extend_pen,
            endgap_pen: params.endgap_pen,
            min_identity: identity_floor(params.distance),
            threads: threads.max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub enum AlignerError {
    ToolNotFound {
        executable: String,
    },
    ToolFailed {
        executable: String,
        args: Vec<String>,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },
    Parse {
        line: usize,
        message: String,
    },
    Io {
        message: String,
    },
}

impl fmt::Display for AlignerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToolNotFound { executable } => write!(
                f,
                "Could not find vsearch executable '{}'. Install vsearch or set {}",
                executable, VSEARCH_ENV_BIN
            ),
            Self::ToolFailed {
                executable,
                args,
                status,
                stdout,
                stderr,
            } => write!(
                f,
                "vsearch command failed: {} {} (status={:?}, stdout='{}', stderr='{}')",
                executable,
                args.join(" "),
                status,
                stdout.trim(),
                stderr.trim()
            ),
            Self::Parse { line, message } => {
                write!(f, "Could not parse aligner output line {line}: {message}")
            }
            Self::Io { message } => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for AlignerError {}

impl From<AlignerError> for ScataError {
    fn from(err: AlignerError) -> Self {
        ScataError::new(ErrorCode::Aligner, err.to_string())
    }
}

fn io_error(context: &str, e: std::io::Error) -> AlignerError {
    AlignerError::Io {
        message: format!("{context}: {e}"),
    }
}

/// Reports hits between every query and target that pass the identity floor.
pub trait PairwiseAligner: Send + Sync {
    fn name(&self) -> &str;

    fn align(
        &self,
        queries: &[UniqueSequence],
        targets: &[UniqueSequence],
        params: &AlignerParams,
    ) -> Result<Vec<AlignmentHit>, AlignerError>;
}

pub fn aligner_for(kind: AlignerKind) -> Arc<dyn PairwiseAligner> {
    match kind {
        AlignerKind::Vsearch => Arc::new(VsearchAligner::new()),
        AlignerKind::Global => Arc::new(GlobalAligner),
    }
}

/// `vsearch --usearch_global` run over temporary FASTA files.
#[derive(Debug, Clone)]
pub struct VsearchAligner {
    executable: String,
}

impl Default for VsearchAligner {
    fn default() -> Self {
        Self::new()
    }
}

fn vsearch_executable() -> String {
    std::env::var(VSEARCH_ENV_BIN)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_VSEARCH_BIN.to_string())
}

fn write_fasta(path: &Path, seqs: &[UniqueSequence]) -> Result<(), AlignerError> {
    let mut writer = fasta::Writer::to_file(path)
        .map_err(|e| io_error(&format!("Could not create '{}'", path.display()), e))?;
    for s in seqs {
        writer
            .write(&s.id, None, s.seq.as_bytes())
            .map_err(|e| io_error(&format!("Could not write '{}'", path.display()), e))?;
    }
    writer
        .flush()
        .map_err(|e| io_error(&format!("Could not flush '{}'", path.display()), e))
}

fn score_term(penalty: f64) -> i64 {
    penalty.round() as i64
}

fn run_vsearch(executable: &str, args: &[String]) -> Result<Output, AlignerError> {
    Command::new(executable).args(args).output().map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            AlignerError::ToolNotFound {
                executable: executable.to_string(),
            }
        } else {
            AlignerError::Io {
                message: format!(
                    "Could not run vsearch executable '{}' with args [{}]: {}",
                    executable,
                    args.join(" "),
                    e
                ),
            }
        }
    })
}

impl VsearchAligner {
    pub fn new() -> Self {
        Self {
            executable: vsearch_executable(),
        }
    }

    pub fn with_executable(executable: &str) -> Self {
        Self {
            executable: executable.to_string(),
        }
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    pub fn arguments(
        &self,
        queries: &Path,
        targets: &Path,
        userout: &Path,
        params: &AlignerParams,
    ) -> Vec<String> {
        let split = |p: f64| {
            format!(
                "{}I/{}E",
                score_term(p),
                score_term(p * params.endgap_pen)
            )
        };
        vec![
            "--usearch_global".to_string(),
            queries.display().to_string(),
            "--db".to_string(),
            targets.display().to_string(),
            "--userout".to_string(),
            userout.display().to_string(),
            "--userfields".to_string(),
            VSEARCH_USERFIELDS.to_string(),
            "--id".to_string(),
            format!("{:.4}", params.min_identity),
            "--strand".to_string(),
            "plus".to_string(),
            "--maxaccepts".to_string(),
            "0".to_string(),
            "--maxrejects".to_string(),
            "0".to_string(),
            "--mismatch".to_string(),
            format!("{}", -score_term(params.mismatch_pen)),
            "--gapopen".to_string(),
            split(params.open_pen),
            "--gapext".to_string(),
            split(params.extend_pen),
            "--threads".to_string(),
            params.threads.to_string(),
            "--quiet".to_string(),
        ]
    }
}

fn parse_field<T: std::str::FromStr>(value: &str, name: &str, line: usize) -> Result<T, AlignerError> {
    value.trim().parse().map_err(|_| AlignerError::Parse {
        line,
        message: format!("invalid {name} '{value}'"),
    })
}

/// Parses `--userout` lines in `VSEARCH_USERFIELDS` order.
pub fn parse_userout(text: &str) -> Result<Vec<AlignmentHit>, AlignerError> {
    let mut hits = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        let f: Vec<&str> = line.split('\t').collect();
        if f.len() != 17 {
            return Err(AlignerError::Parse {
                line: line_no,
                message: format!("expected 17 fields, found {}", f.len()),
            });
        }
        let qlo: usize = parse_field(f[3], "qlo", line_no)?;
        let tlo: usize = parse_field(f[5], "tlo", line_no)?;
        hits.push(AlignmentHit {
            query: f[0].to_string(),
            target: f[1].to_string(),
            identity: parse_field::<f64>(f[2], "id", line_no)? / 100.0,
            qlo: qlo.saturating_sub(1),
            qhi: parse_field(f[4], "qhi", line_no)?,
            tlo: tlo.saturating_sub(1),
            thi: parse_field(f[6], "thi", line_no)?,
            qlen: parse_field(f[7], "ql", line_no)?,
            tlen: parse_field(f[8], "tl", line_no)?,
            qcov: parse_field::<f64>(f[9], "qcov", line_no)? / 100.0,
            tcov: parse_field::<f64>(f[10], "tcov", line_no)? / 100.0,
            mismatches: parse_field(f[11], "mism", line_no)?,
            gap_opens: parse_field(f[12], "opens", line_no)?,
            gap_extensions: parse_field(f[13], "exts", line_no)?,
            pairs: parse_field(f[14], "pairs", line_no)?,
            ids: parse_field(f[15], "ids", line_no)?,
            aln_len: parse_field(f[16], "alnlen", line_no)?,
        });
    }
    Ok(hits)
}

impl PairwiseAligner for VsearchAligner {
    fn name(&self) -> &str {
        "vsearch"
    }

    fn align(
        &self,
        queries: &[UniqueSequence],
        targets: &[UniqueSequence],
        params: &AlignerParams,
    ) -> Result<Vec<AlignmentHit>, AlignerError> {
        if queries.is_empty() || targets.is_empty() {
            return Ok(Vec::new());
        }
        let dir = tempfile::tempdir().map_err(|e| io_error("Could not create temporary directory", e))?;
        let query_path = dir.path().join("queries.fasta");
        let target_path = dir.path().join("targets.fasta");
        let userout = dir.path().join("hits.tsv");
        write_fasta(&query_path, queries)?;
        write_fasta(&target_path, targets)?;

        let args = self.arguments(&query_path, &target_path, &userout, params);
        tracing::debug!(executable = self.executable.as_str(), queries = queries.len(), targets = targets.len(), "running vsearch");
        let output = run_vsearch(&self.executable, &args)?;
        if !output.status.success() {
            return Err(AlignerError::ToolFailed {
                executable: self.executable.clone(),
                args,
                status: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        let text = std::fs::read_to_string(&userout)
            .map_err(|e| io_error(&format!("Could not read '{}'", userout.display()), e))?;
        parse_userout(&text)
    }
}

const GLOBAL_MATCH_SCORE: i32 = 2;

/// In-process global alignment of every query against every target.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalAligner;

fn scaled(penalty: f64) -> i32 {
    (2.0 * penalty).round() as i32
}

/// Hit statistics of one alignment, terminal gaps excluded.
fn summarize(
    query: &UniqueSequence,
    target: &UniqueSequence,
    ops: &[AlignmentOperation],
) -> Option<AlignmentHit> {
    use AlignmentOperation::*;
    let is_gap = |op: &AlignmentOperation| matches!(op, Ins | Del);
    let first = ops.iter().position(|op| !is_gap(op))?;
    let last = ops.iter().rposition(|op| !is_gap(op))?;

    let (mut qi, mut ti) = (0, 0);
    for op in &ops[..first] {
        match op {
            Ins => qi += 1,
            Del => ti += 1,
            _ => {}
        }
    }
    let (qlo, tlo) = (qi, ti);
    let (mut ids, mut mismatches, mut opens, mut exts) = (0, 0, 0, 0);
    let mut previous: Option<AlignmentOperation> = None;
    for op in &ops[first..=last] {
        match op {
            Match | Subst => {
                if *op == Match {
                    ids += 1;
                } else {
                    mismatches += 1;
                }
                qi += 1;
                ti += 1;
            }
            Ins | Del => {
                if previous == Some(*op) {
                    exts += 1;
                } else {
                    opens += 1;
                }
                if *op == Ins {
                    qi += 1;
                } else {
                    ti += 1;
                }
            }
            _ => {}
        }
        previous = Some(*op);
    }

    let aln_len = last - first + 1;
    let (qlen, tlen) = (query.seq.len(), target.seq.len());
    Some(AlignmentHit {
        query: query.id.clone(),
        target: target.id.clone(),
        identity: ids as f64 / aln_len as f64,
        qlo,
        qhi: qi,
        tlo,
        thi: ti,
        qlen,
        tlen,
        qcov: (qi - qlo) as f64 / qlen as f64,
        tcov: (ti - tlo) as f64 / tlen as f64,
        mismatches,
        gap_opens: opens,
        gap_extensions: exts,
        pairs: ids + mismatches,
        ids,
        aln_len,
    })
}

impl GlobalAligner {
    pub fn align_pair(
        &self,
        query: &UniqueSequence,
        target: &UniqueSequence,
        params: &AlignerParams,
    ) -> Option<AlignmentHit> {
        let (x, y) = (query.seq.as_bytes(), target.seq.as_bytes());
        if x.is_empty() || y.is_empty() {
            return None;
        }
        let mismatch = -scaled(params.mismatch_pen).max(1);
        let gap_open = -scaled(params.open_pen).max(0);
        let gap_extend = -scaled(params.extend_pen).max(1);
        let score = |a: u8, b: u8| {
            if a == b {
                GLOBAL_MATCH_SCORE
            } else {
                mismatch
            }
        };
        let mut aligner = Aligner::with_capacity(x.len(), y.len(), gap_open, gap_extend, score);
        let alignment = aligner.global(x, y);
        summarize(query, target, &alignment.operations).filter(|hit| hit.identity >= params.min_identity)
    }
}

impl PairwiseAligner for GlobalAligner {
    fn name(&self) -> &str {
        "global"
    }

    fn align(
        &self,
        queries: &[UniqueSequence],
        targets: &[UniqueSequence],
        params: &AlignerParams,
    ) -> Result<Vec<AlignmentHit>, AlignerError> {
        Ok(queries
            .iter()
            .flat_map(|q| targets.iter().filter_map(move |t| self.align_pair(q, t, params)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const SEQ: &str = "AACGCACATTGCGCCCTTTGGTATTCCGAAGGGCATGCCTGTTCGAGCGTCATTTCAACC";

    fn unique(id: &str, seq: &str) -> UniqueSequence {
        UniqueSequence {
            id: id.to_string(),
            seq: seq.to_string(),
            reads: vec![id.to_string()],
        }
    }

    fn params() -> AlignerParams {
        AlignerParams::from_parameters(&ClusterParameters::default(), 1)
    }

    #[test]
    fn test_identity_floor() {
        assert!((identity_floor(0.015) - 0.965).abs() < 1e-12);
        assert_eq!(identity_floor(0.99), 0.0);
    }

    #[test]
    fn test_parse_userout_converts_units() {
        let text = "q1\tt1\t98.5\t1\t200\t3\t202\t200\t210\t100.0\t95.2\t2\t1\t0\t199\t196\t200\n\n";
        let hits = parse_userout(text).unwrap();
        assert_eq!(hits.len(), 1);
        let hit = &hits[0];
        assert_eq!((hit.qlo, hit.qhi, hit.tlo, hit.thi), (0, 200, 2, 202));
        assert!((hit.identity - 0.985).abs() < 1e-12);
        assert!((hit.tcov - 0.952).abs() < 1e-12);
        assert_eq!(hit.query_span(), 200);
        assert_eq!(hit.gap_opens, 1);

        let err = parse_userout("q\tt\t99\n").unwrap_err();
        assert!(matches!(err, AlignerError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_distance_and_acceptance() {
        let mut hit = parse_userout("a\tb\t99.0\t1\t200\t1\t200\t200\t200\t100\t100\t1\t1\t1\t199\t198\t200\n")
            .unwrap()
            .remove(0);
        let params = ClusterParameters::default();
        // (1 + 1 + 0) / 200
        assert!((hit_distance(&hit, &params) - 0.01).abs() < 1e-12);
        assert!(accept_hit(&hit, &params));
        hit.tcov = 0.85;
        assert!(!accept_hit(&hit, &params));
        hit.tcov = 1.0;
        hit.mismatches = 3;
        assert!(!accept_hit(&hit, &params));
    }

    #[test]
    fn test_vsearch_arguments() {
        let aligner = VsearchAligner::with_executable("vsearch");
        let p = AlignerParams {
            endgap_pen: 0.5,
            open_pen: 20.0,
            extend_pen: 2.0,
            mismatch_pen: 4.0,
            ..params()
        };
        let args = aligner.arguments(Path::new("q.fa"), Path::new("t.fa"), Path::new("o.tsv"), &p);
        let joined = args.join(" ");
        assert!(joined.starts_with("--usearch_global q.fa --db t.fa --userout o.tsv"));
        assert!(joined.contains("--id 0.9650"));
        assert!(joined.contains("--strand plus"));
        assert!(joined.contains("--mismatch -4"));
        assert!(joined.contains("--gapopen 20I/10E"));
        assert!(joined.contains("--gapext 2I/1E"));
        assert!(joined.contains("--maxaccepts 0 --maxrejects 0"));
    }

    #[test]
    fn test_vsearch_missing_executable() {
        let aligner = VsearchAligner::with_executable("/nonexistent/vsearch-binary");
        let seqs = vec![unique("a", SEQ)];
        let err = aligner.align(&seqs, &seqs, &params()).unwrap_err();
        assert!(matches!(err, AlignerError::ToolNotFound { .. }));
        assert_eq!(ScataError::from(err).code, ErrorCode::Aligner);
    }

    #[cfg(unix)]
    fn script(dir: &Path, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[cfg(unix)]
    #[test]
    fn test_vsearch_runs_external_tool() {
        let dir = tempfile::tempdir().unwrap();
        let fake = script(
            dir.path(),
            "fake-vsearch",
            r#"while [ $# -gt 0 ]; do
  if [ "$1" = "--userout" ]; then out="$2"; fi
  shift
done
printf 'a\tb\t100.0\t1\t60\t1\t60\t60\t60\t100.0\t100.0\t0\t0\t0\t60\t60\t60\n' > "$out""#,
        );
        let aligner = VsearchAligner::with_executable(&fake);
        let seqs = vec![unique("a", SEQ), unique("b", SEQ)];
        let hits = aligner.align(&seqs, &seqs, &params()).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!((hits[0].query.as_str(), hits[0].target.as_str()), ("a", "b"));

        let failing = script(dir.path(), "failing-vsearch", "echo broken >&2\nexit 3");
        let err = VsearchAligner::with_executable(&failing)
            .align(&seqs, &seqs, &params())
            .unwrap_err();
        match err {
            AlignerError::ToolFailed { status, stderr, .. } => {
                assert_eq!(status, Some(3));
                assert_eq!(stderr.trim(), "broken");
            }
            other => panic!("expected tool failure, got {other:?}"),
        }
    }

    #[test]
    fn test_global_substitution() {
        let mut other = SEQ.as_bytes().to_vec();
        other[30] = if other[30] == b'A' { b'T' } else { b'A' };
        let other = String::from_utf8(other).unwrap();
        let hit = GlobalAligner
            .align_pair(&unique("q", SEQ), &unique("t", &other), &params())
            .unwrap();
        assert_eq!(hit.mismatches, 1);
        assert_eq!(hit.ids, 59);
        assert_eq!((hit.gap_opens, hit.gap_extensions), (0, 0));
        assert_eq!(hit.qcov, 1.0);
        assert!((hit.identity - 59.0 / 60.0).abs() < 1e-12);
    }

    #[test]
    fn test_global_internal_and_terminal_gaps() {
        let deleted = format!("{}{}", &SEQ[..20], &SEQ[21..]);
        let hit = GlobalAligner
            .align_pair(&unique("q", SEQ), &unique("t", &deleted), &params())
            .unwrap();
        assert_eq!((hit.gap_opens, hit.gap_extensions, hit.mismatches), (1, 0, 0));
        assert_eq!((hit.query_span(), hit.target_span()), (60, 59));

        let trimmed = &SEQ[5..];
        let hit = GlobalAligner
            .align_pair(&unique("q", SEQ), &unique("t", trimmed), &params())
            .unwrap();
        assert_eq!(hit.qlo, 5);
        assert_eq!(hit.gap_opens, 0);
        assert_eq!(hit.identity, 1.0);
        assert!((hit.qcov - 55.0 / 60.0).abs() < 1e-12);
        assert_eq!(hit.tcov, 1.0);
    }

    #[test]
    fn test_global_identity_floor_drops_unrelated() {
        let queries = vec![unique("q", SEQ)];
        let targets = vec![unique("t", "TTTTTTTTTTGGGGGGGGGGTTTTTTTTTTGGGGGGGGGGTTTTTTTTTTGGGGGGGGGG"), unique("q", SEQ)];
        let hits = GlobalAligner.align(&queries, &targets, &params()).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].is_self_hit());
    }
}
