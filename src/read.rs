use crate::iupac_code::reverse_complement;
use serde::{Deserialize, Serialize};

/// One sequencing read. Qualities are integer Phred scores, one per base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Read {
    pub id: String,
    pub seq: Vec<u8>,
    pub qual: Option<Vec<u8>>,
}

impl Read {
    pub fn new(id: impl Into<String>, seq: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            seq: seq.into(),
            qual: None,
        }
    }

    pub fn with_qual(id: impl Into<String>, seq: impl Into<Vec<u8>>, qual: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            seq: seq.into(),
            qual: Some(qual),
        }
    }

    pub fn len(&self) -> usize {
        self.seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }

    pub fn seq_string(&self) -> String {
        String::from_utf8_lossy(&self.seq).to_string()
    }

    /// Reverse complement of the sequence, qualities reversed alongside.
    pub fn reverse_complemented(&self) -> Read {
        Read {
            id: self.id.clone(),
            seq: reverse_complement(&self.seq),
            qual: self.qual.as_ref().map(|q| q.iter().rev().copied().collect()),
        }
    }

    /// Keeps `start..end` of sequence and qualities.
    pub fn slice(&mut self, start: usize, end: usize) {
        self.seq.truncate(end);
        self.seq.drain(..start);
        if let Some(q) = self.qual.as_mut() {
            q.truncate(end);
            q.drain(..start);
        }
    }
}

/// A read after primer/tag detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetaggedRead {
    pub read: Read,
    pub tag: String,
    pub reversed: bool,
}

impl DetaggedRead {
    pub fn untagged(read: Read) -> Self {
        Self {
            read,
            tag: String::new(),
            reversed: false,
        }
    }
}

pub fn mean_quality(qual: &[u8]) -> f64 {
    if qual.is_empty() {
        return 0.0;
    }
    qual.iter().map(|q| *q as f64).sum::<f64>() / qual.len() as f64
}
