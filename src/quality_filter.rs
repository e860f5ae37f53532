use crate::{
    error::{ErrorCode, ReadError, ReadFailure},
    read::{Read, mean_quality},
};
use scata_protocol::ReadErrorKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    pub min_length: usize,
    pub mean_min: f64,
    pub min_qual: u8,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_length: 0,
            mean_min: 20.0,
            min_qual: 20,
        }
    }
}

fn quality_of(read: &Read) -> Result<&[u8], ReadFailure> {
    read.qual.as_deref().ok_or_else(|| {
        ReadFailure::fatal(
            ErrorCode::MissingQual,
            "Selected filtering method requires quality data",
        )
    })
}

/// Replaces every base called below `min_qual` with `N`, returning how many
/// were masked.
pub fn mask_low_quality(read: &mut Read, min_qual: u8) -> usize {
    let Some(qual) = read.qual.as_ref() else {
        return 0;
    };
    let mut masked = 0;
    for (base, q) in read.seq.iter_mut().zip(qual.iter()) {
        if *q < min_qual {
            *base = b'N';
            masked += 1;
        }
    }
    masked
}

/// Full-sequence screen. Any base below the floor rejects the read.
pub fn filter_full(mut read: Read, t: &QualityThresholds) -> Result<Read, ReadFailure> {
    let mean = mean_quality(quality_of(&read)?);
    if read.len() < t.min_length {
        return Err(ReadError::new(ReadErrorKind::TooShort).into());
    }
    if mean < t.mean_min {
        return Err(ReadError::new(ReadErrorKind::LowMeanQuality).into());
    }
    if mask_low_quality(&mut read, t.min_qual) > 0 {
        return Err(ReadError::new(ReadErrorKind::LowMinQuality).into());
    }
    Ok(read)
}

#[derive(Debug, Clone, PartialEq)]
struct Region {
    start: usize,
    end: usize,
    mean: Option<f64>,
    length: usize,
}

impl Region {
    fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            mean: None,
            length: 0,
        }
    }
}

/// High-quality-region extraction.
///
/// This keeps the historical boundary behavior: a region still open at the
/// end of the read stops at `len - 1` (dropping the final base), and trimming
/// compares against the base at the exclusive `end`, which for inner regions
/// is the low-quality base that closed the region. Tests pin both.
pub fn filter_hqr(mut read: Read, t: &QualityThresholds) -> Result<Read, ReadFailure> {
    let qual = quality_of(&read)?;
    if read.len() < t.min_length {
        return Err(ReadError::new(ReadErrorKind::TooShort).into());
    }

    let mut regions: Vec<Region> = Vec::new();
    let mut open: Option<usize> = None;
    for (i, q) in qual.iter().enumerate() {
        match open {
            None if *q >= t.min_qual => open = Some(i),
            Some(start) if *q < t.min_qual => {
                regions.push(Region::new(start, i));
                open = None;
            }
            _ => {}
        }
    }
    if let Some(start) = open {
        regions.push(Region::new(start, qual.len() - 1));
    }

    for r in regions.iter_mut() {
        if r.end - r.start < t.min_length {
            continue;
        }
        while r.end > r.start && mean_quality(&qual[r.start..r.end]) < t.mean_min {
            if qual[r.start] < qual[r.end] {
                r.start += 1;
            } else {
                r.end -= 1;
            }
        }
        if r.end > r.start {
            r.mean = Some(mean_quality(&qual[r.start..r.end]));
            r.length = r.end - r.start;
        }
    }

    let mut best: Option<&Region> = None;
    for r in regions
        .iter()
        .filter(|r| r.length >= t.min_length && r.mean.is_some_and(|m| m >= t.mean_min))
    {
        if best.is_none_or(|b| r.length > b.length) {
            best = Some(r);
        }
    }
    let Some(best) = best else {
        return Err(ReadError::new(ReadErrorKind::LowMeanQuality).into());
    };
    if best.end - best.start < t.min_length {
        return Err(ReadError::new(ReadErrorKind::LowMeanQuality).into());
    }
    let (start, end) = (best.start, best.end);
    read.slice(start, end);
    Ok(read)
}
