use crate::{
    amplicon::{Amplicon, Primer, TagSet},
    error::ReadError,
    iupac_code::{IupacCode, count_mismatches, primer_masks, read_masks, reverse_complement},
    read::{DetaggedRead, Read},
};
use scata_protocol::ReadErrorKind;
use std::collections::BTreeSet;

/// The 5' primer is only searched for within this many leading bases
/// (plus the primer length).
pub const PRIMER5_SEARCH_WINDOW: usize = 20_000;

#[derive(Debug, Clone)]
struct PrimerPattern {
    masks: Vec<IupacCode>,
    mismatches: usize,
}

impl PrimerPattern {
    fn five_prime(primer: &Primer) -> Option<Self> {
        (!primer.is_empty()).then(|| Self {
            masks: primer_masks(primer.sequence.as_bytes()),
            mismatches: primer.mismatches,
        })
    }

    /// The 3' primer is found on the read as its reverse complement.
    fn three_prime(primer: &Primer) -> Option<Self> {
        (!primer.is_empty()).then(|| Self {
            masks: primer_masks(&reverse_complement(primer.sequence.as_bytes())),
            mismatches: primer.mismatches,
        })
    }

    fn len(&self) -> usize {
        self.masks.len()
    }

    fn accepts(&self, window: &[IupacCode]) -> bool {
        count_mismatches(window, &self.masks) <= self.mismatches
    }

    /// First start position, left to right, within the search window.
    fn find_forward(&self, read: &[IupacCode]) -> Option<usize> {
        let plen = self.len();
        let limit = read.len().min(PRIMER5_SEARCH_WINDOW + plen);
        if limit < plen {
            return None;
        }
        (0..=limit - plen).find(|&x| self.accepts(&read[x..x + plen]))
    }

    /// First start position, right to left, not before `lower`.
    fn find_backward(&self, read: &[IupacCode], lower: usize) -> Option<usize> {
        let plen = self.len();
        if read.len() < plen || read.len() - plen < lower {
            return None;
        }
        (lower..=read.len() - plen)
            .rev()
            .find(|&x| self.accepts(&read[x..x + plen]))
    }
}

/// Locates primers and tags of one amplicon on reads and cuts out the
/// region between the primers.
#[derive(Debug, Clone)]
pub struct Detagger {
    five_prime: Option<PrimerPattern>,
    three_prime: Option<PrimerPattern>,
    five_prime_tags: Option<TagSet>,
    three_prime_tags: Option<TagSet>,
    keep_primer: bool,
    min_length: usize,
    max_length: Option<usize>,
}

fn skip(kind: ReadErrorKind) -> ReadError {
    ReadError::new(kind)
}

impl Detagger {
    pub fn new(amplicon: &Amplicon, ignore_tags: bool, keep_primer: bool) -> Self {
        let tags = |set: &Option<TagSet>| {
            set.as_ref()
                .filter(|t| !ignore_tags && !t.is_empty())
                .cloned()
        };
        Self {
            five_prime: amplicon.five_prime.as_ref().and_then(PrimerPattern::five_prime),
            three_prime: amplicon.three_prime.as_ref().and_then(PrimerPattern::three_prime),
            five_prime_tags: tags(&amplicon.five_prime_tags),
            three_prime_tags: tags(&amplicon.three_prime_tags),
            keep_primer,
            min_length: amplicon.min_length,
            max_length: amplicon.max_length,
        }
    }

    pub fn detag(&self, read: Read) -> Result<DetaggedRead, ReadError> {
        let mut read = read;
        let mut reversed = false;
        let mut masks = read_masks(&read.seq);

        let (p5_start, p5_end) = match &self.five_prime {
            Some(primer) => {
                let pos = match primer.find_forward(&masks) {
                    Some(pos) => pos,
                    None => {
                        read = read.reverse_complemented();
                        masks = read_masks(&read.seq);
                        reversed = true;
                        primer
                            .find_forward(&masks)
                            .ok_or_else(|| skip(ReadErrorKind::NoPrimer5))?
                    }
                };
                (pos, pos + primer.len())
            }
            None => (0, 0),
        };

        let mut tag = String::new();
        let mut accepted_mates: Option<&BTreeSet<String>> = None;
        if let (Some(_), Some(tags)) = (&self.five_prime, &self.five_prime_tags) {
            let entry = p5_start
                .checked_sub(tags.tag_length())
                .and_then(|start| tags.lookup(&read.seq[start..p5_start].to_ascii_uppercase()))
                .ok_or_else(|| skip(ReadErrorKind::NoTag5))?;
            tag = entry.name.clone();
            if !entry.mates.is_empty() {
                accepted_mates = Some(&entry.mates);
            }
        }

        let (start, end) = match &self.three_prime {
            Some(primer) => {
                let pos = primer
                    .find_backward(&masks, p5_end)
                    .ok_or_else(|| skip(ReadErrorKind::NoPrimer3))?;
                let p3_end = pos + primer.len();
                if let Some(tags) = &self.three_prime_tags {
                    let window_end = p3_end + tags.tag_length();
                    if window_end > read.len() {
                        return Err(skip(ReadErrorKind::NoTag3));
                    }
                    let window = reverse_complement(&read.seq[p3_end..window_end]);
                    let entry = tags
                        .lookup(&window)
                        .ok_or_else(|| skip(ReadErrorKind::NoTag3))?;
                    if accepted_mates.is_some_and(|mates| !mates.contains(&entry.name)) {
                        return Err(skip(ReadErrorKind::ChimericTag));
                    }
                    tag = if tag.is_empty() {
                        entry.name.clone()
                    } else {
                        format!("{tag}_{}", entry.name)
                    };
                }
                if self.keep_primer {
                    (p5_start, p3_end)
                } else {
                    (p5_end, pos)
                }
            }
            None if self.keep_primer => (p5_start, read.len()),
            None => (p5_end, read.len()),
        };

        let length = end - start;
        if length < self.min_length {
            return Err(ReadError::with_message(
                ReadErrorKind::TooShort,
                format!("Amplicon shorter than {} bp", self.min_length),
            ));
        }
        if let Some(max) = self.max_length.filter(|max| length > *max) {
            return Err(ReadError::with_message(
                ReadErrorKind::TooLong,
                format!("Amplicon longer than {max} bp"),
            ));
        }

        read.slice(start, end);
        Ok(DetaggedRead {
            read,
            tag,
            reversed,
        })
    }
}
