use crate::{
    error::{ErrorCode, ReadError, ReadFailure, ScataError},
    read::Read,
    read_parser::FastqReads,
};
use scata_protocol::ReadErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingParams {
    /// k-mer length used to anchor read 1 in read 2.
    pub kmer: usize,
    /// A run of anchored k-mers must be longer than this.
    pub hsp: usize,
    /// Minimum number of anchored k-mers in the kept run.
    pub min_shared: usize,
}

impl Default for PairingParams {
    fn default() -> Self {
        Self {
            kmer: 7,
            hsp: 5,
            min_shared: 10,
        }
    }
}

fn pairing_failed(message: &str) -> ReadError {
    ReadError::with_message(ReadErrorKind::PairingFailed, format!("Pairing failed, {message}"))
}

/// Joins a read pair through their k-mer overlap.
///
/// Read 2 is reverse complemented and indexed by k-mer. Read 1 is scanned for
/// maximal runs of consecutive k-mers that occur in that index; the longest
/// run longer than `hsp` anchors the splice, after multiply-anchored k-mers
/// have been trimmed from both of its ends.
pub fn join_pair(r1: &Read, r2: &Read, params: &PairingParams) -> Result<Read, ReadError> {
    let k = params.kmer.max(1);
    let s2 = r2.reverse_complemented();
    if r1.len() < k || s2.len() < k {
        return Err(pairing_failed("reads shorter than k-mer"));
    }

    let mut index: HashMap<&[u8], Vec<usize>> = HashMap::new();
    for i in 0..=s2.len() - k {
        index.entry(&s2.seq[i..i + k]).or_default().push(i);
    }

    let hits: Vec<Option<&[usize]>> = (0..=r1.len() - k)
        .map(|y| index.get(&r1.seq[y..y + k]).map(|a| a.as_slice()))
        .collect();

    // (start, length) of the longest qualifying run, first one on ties.
    let mut best: Option<(usize, usize)> = None;
    let mut run_start: Option<usize> = None;
    for y in 0..=hits.len() {
        let anchored = hits.get(y).is_some_and(|h| h.is_some());
        match (anchored, run_start) {
            (true, None) => run_start = Some(y),
            (false, Some(start)) => {
                let len = y - start;
                if len > params.hsp && best.is_none_or(|(_, l)| len > l) {
                    best = Some((start, len));
                }
                run_start = None;
            }
            _ => {}
        }
    }

    let Some((start, len)) = best else {
        return Err(pairing_failed("no kmer runs found"));
    };
    if len < params.min_shared {
        return Err(pairing_failed("kmer runs too short"));
    }

    let run: Vec<(usize, &[usize])> = (start..start + len)
        .filter_map(|y| hits[y].map(|a| (y, a)))
        .collect();
    let first_unique = run.iter().position(|(_, a)| a.len() == 1);
    let last_unique = run.iter().rposition(|(_, a)| a.len() == 1);
    let (Some(_), Some(last)) = (first_unique, last_unique) else {
        return Err(pairing_failed("no unambiguous kmer run found"));
    };

    let (y_last, anchors) = run[last];
    let a_last = anchors[0];
    if y_last > r1.len() || a_last > s2.len() {
        return Err(pairing_failed("could not splice"));
    }

    let mut seq = r1.seq[..y_last].to_vec();
    seq.extend_from_slice(&s2.seq[a_last..]);
    let qual = match (r1.qual.as_ref(), s2.qual.as_ref()) {
        (Some(q1), Some(q2)) => {
            let mut q = q1[..y_last].to_vec();
            q.extend_from_slice(&q2[a_last..]);
            Some(q)
        }
        _ => None,
    };
    Ok(Read {
        id: r1.id.clone(),
        seq,
        qual,
    })
}

/// Two FASTQ streams advanced in lock step, each pair joined into one read.
pub struct PairedFastqReads {
    first: FastqReads,
    second: FastqReads,
    params: PairingParams,
}

impl PairedFastqReads {
    pub fn new(first: FastqReads, second: FastqReads, params: PairingParams) -> Self {
        Self {
            first,
            second,
            params,
        }
    }
}

impl Iterator for PairedFastqReads {
    type Item = Result<Read, ReadFailure>;

    fn next(&mut self) -> Option<Self::Item> {
        match (self.first.next_read(), self.second.next_read()) {
            (None, None) => None,
            (Some(Err(e)), _) | (_, Some(Err(e))) => Some(Err(ReadFailure::Fatal(e))),
            (Some(Ok(r)), None) | (None, Some(Ok(r))) => Some(Err(ReadFailure::Fatal(
                ScataError::new(
                    ErrorCode::UnpairedReads,
                    format!("Read '{}' has no mate in the other file", r.id),
                ),
            ))),
            (Some(Ok(r1)), Some(Ok(r2))) => {
                Some(join_pair(&r1, &r2, &self.params).map_err(ReadFailure::Skip))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iupac_code::reverse_complement;
    use crate::read_parser::ReadStream;
    use std::io::Cursor;

    // 180 bp without any repeated 7-mer.
    const FRAGMENT: &str = "TGACGGATATATATTAAAAAGTGTTTTAAGATACATTGAGGCCCGTTCGTGCTCCTCGCCCTGAAGCATTGCTTTGTGAAGAGGGACTTCAGCCAATAGACCTGCATACCGGCTCATTCTTCATGTGCAACCTAGGGAGAATGTGTACATACGCTCTTACTGCGGTCGCGTCTAATAATA";

    fn overlapping_pair() -> (Read, Read) {
        let f = FRAGMENT.as_bytes();
        let r1 = Read::with_qual("pair", &f[..100], vec![30; 100]);
        let r2 = Read::with_qual("pair", reverse_complement(&f[80..]), (0..100).collect());
        (r1, r2)
    }

    #[test]
    fn test_join_twenty_base_overlap() {
        let (r1, r2) = overlapping_pair();
        let joined = join_pair(&r1, &r2, &PairingParams::default()).unwrap();
        assert_eq!(joined.len(), r1.len() + r2.len() - 20);
        assert_eq!(joined.seq, FRAGMENT.as_bytes().to_vec());

        let mut expected_qual = vec![30u8; 93];
        expected_qual.extend((0..=86u8).rev());
        assert_eq!(joined.qual, Some(expected_qual));
    }

    #[test]
    fn test_unrelated_reads_fail_pairing() {
        let r1 = Read::with_qual("a", "TACATTTGCTTCGTTGACTAGCAACCCAGGGCTATAGCTATTCCCCCCGCGGCCCACCCA", vec![30; 60]);
        let r2 = Read::with_qual("a", "GTATTCCTAACGGAGCATAAATCCCACCCGAACTAAGTTTGTCGAACCTTGGTCCAAGAT", vec![30; 60]);
        let err = join_pair(&r1, &r2, &PairingParams::default()).unwrap_err();
        assert_eq!(err.kind, ReadErrorKind::PairingFailed);
    }

    #[test]
    fn test_short_run_fails_min_shared() {
        let (r1, r2) = overlapping_pair();
        let params = PairingParams {
            min_shared: 50,
            ..PairingParams::default()
        };
        let err = join_pair(&r1, &r2, &params).unwrap_err();
        assert!(err.message.contains("too short"));
    }

    // The 20-base overlap anchors exactly 14 consecutive 7-mers.
    const OVERLAP_RUN: usize = 14;

    #[test]
    fn test_run_of_exactly_hsp_is_ignored() {
        let (r1, r2) = overlapping_pair();
        let params = PairingParams {
            hsp: OVERLAP_RUN,
            ..PairingParams::default()
        };
        let err = join_pair(&r1, &r2, &params).unwrap_err();
        assert!(err.message.contains("no kmer runs"));

        let params = PairingParams {
            hsp: OVERLAP_RUN - 1,
            ..PairingParams::default()
        };
        assert_eq!(join_pair(&r1, &r2, &params).unwrap().len(), 180);
    }

    #[test]
    fn test_overlap_equal_to_min_shared_joins() {
        let (r1, r2) = overlapping_pair();
        let params = PairingParams {
            min_shared: OVERLAP_RUN,
            ..PairingParams::default()
        };
        assert_eq!(join_pair(&r1, &r2, &params).unwrap().seq, FRAGMENT.as_bytes().to_vec());

        let params = PairingParams {
            min_shared: OVERLAP_RUN + 1,
            ..PairingParams::default()
        };
        let err = join_pair(&r1, &r2, &params).unwrap_err();
        assert!(err.message.contains("too short"));
    }

    fn fastq(records: &[(&str, &[u8])]) -> ReadStream {
        let mut text = String::new();
        for (id, seq) in records {
            text.push_str(&format!(
                "@{id}\n{}\n+\n{}\n",
                String::from_utf8_lossy(seq),
                "I".repeat(seq.len())
            ));
        }
        Box::new(Cursor::new(text.into_bytes()))
    }

    #[test]
    fn test_paired_stream_skips_failures_and_detects_unpaired() {
        let (r1, r2) = overlapping_pair();
        let repeat: &[u8] = b"ACGTACGTACGTAC";
        let first = fastq(&[("p1", r1.seq.as_slice()), ("p2", repeat), ("p3", r1.seq.as_slice())]);
        let second = fastq(&[("p1", r2.seq.as_slice()), ("p2", repeat)]);
        let mut reads = PairedFastqReads::new(
            FastqReads::new(first),
            FastqReads::new(second),
            PairingParams::default(),
        );
        assert_eq!(reads.next().unwrap().unwrap().len(), 180);
        assert!(matches!(reads.next(), Some(Err(ReadFailure::Skip(_)))));
        match reads.next() {
            Some(Err(ReadFailure::Fatal(e))) => assert_eq!(e.code, ErrorCode::UnpairedReads),
            other => panic!("expected unpaired error, got {other:?}"),
        }
    }
}
