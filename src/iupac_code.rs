const DNA_BITMASK_A: u8 = 1;
const DNA_BITMASK_C: u8 = 2;
const DNA_BITMASK_G: u8 = 4;
const DNA_BITMASK_T: u8 = 8;
const DNA_BITMASK_N: u8 = DNA_BITMASK_A | DNA_BITMASK_C | DNA_BITMASK_G | DNA_BITMASK_T;

/// The fifteen IUPAC nucleotide symbols.
pub const IUPAC_ALPHABET: [u8; 15] = *b"ACGTRYSWKMBDHVN";

const fn letter_mask(letter: u8) -> u8 {
    match letter.to_ascii_uppercase() {
        b'A' => DNA_BITMASK_A,
        b'C' => DNA_BITMASK_C,
        b'G' => DNA_BITMASK_G,
        b'T' | b'U' => DNA_BITMASK_T,
        b'W' => DNA_BITMASK_A | DNA_BITMASK_T,
        b'S' => DNA_BITMASK_C | DNA_BITMASK_G,
        b'M' => DNA_BITMASK_A | DNA_BITMASK_C,
        b'K' => DNA_BITMASK_G | DNA_BITMASK_T,
        b'R' => DNA_BITMASK_A | DNA_BITMASK_G,
        b'Y' => DNA_BITMASK_C | DNA_BITMASK_T,
        b'B' => DNA_BITMASK_C | DNA_BITMASK_G | DNA_BITMASK_T,
        b'D' => DNA_BITMASK_A | DNA_BITMASK_G | DNA_BITMASK_T,
        b'H' => DNA_BITMASK_A | DNA_BITMASK_C | DNA_BITMASK_T,
        b'V' => DNA_BITMASK_A | DNA_BITMASK_C | DNA_BITMASK_G,
        b'N' => DNA_BITMASK_N,
        _ => 0,
    }
}

const fn build_mask_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = letter_mask(i as u8);
        i += 1;
    }
    table
}

/// Membership mask of every byte value, built at compile time.
static IUPAC_MASKS: [u8; 256] = build_mask_table();

/// A bitmasked IUPAC code for DNA bases, eg DNA_BITMASK_A|DNA_BITMASK_C
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct IupacCode(u8);

impl IupacCode {
    pub fn new(bitmask: u8) -> Self {
        Self(bitmask)
    }

    #[inline(always)]
    pub fn from_letter(letter: u8) -> Self {
        Self(IUPAC_MASKS[letter as usize])
    }

    /// Mask for a base observed in a read. An `N` in a read is an unknown
    /// call and must not match anything, so it maps to the empty mask.
    #[inline(always)]
    pub fn from_read_letter(letter: u8) -> Self {
        if letter.eq_ignore_ascii_case(&b'N') {
            Self(0)
        } else {
            Self::from_letter(letter)
        }
    }

    #[inline(always)]
    pub fn bits(&self) -> u8 {
        self.0
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub fn matches(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Swaps A<->T and C<->G membership.
    #[inline(always)]
    pub fn complement(self) -> Self {
        let b = self.0;
        Self(
            ((b & DNA_BITMASK_A) << 3)
                | ((b & DNA_BITMASK_T) >> 3)
                | ((b & DNA_BITMASK_C) << 1)
                | ((b & DNA_BITMASK_G) >> 1),
        )
    }

    #[inline(always)]
    pub fn is_valid_letter(letter: u8) -> bool {
        IUPAC_MASKS[letter as usize] != 0
    }

    #[inline(always)]
    pub fn letter_complement(letter: u8) -> u8 {
        match letter.to_ascii_uppercase() {
            b'A' => b'T',
            b'C' => b'G',
            b'G' => b'C',
            b'T' => b'A',
            b'U' => b'A',
            b'R' => b'Y',
            b'Y' => b'R',
            b'K' => b'M',
            b'M' => b'K',
            b'S' => b'S',
            b'W' => b'W',
            b'B' => b'V',
            b'V' => b'B',
            b'D' => b'H',
            b'H' => b'D',
            b'N' => b'N',
            _ => b' ',
        }
    }
}

pub fn reverse_complement(seq: &[u8]) -> Vec<u8> {
    seq.iter()
        .rev()
        .map(|c| IupacCode::letter_complement(*c))
        .collect()
}

/// Masks of a primer as written, 5' to 3'.
pub fn primer_masks(primer: &[u8]) -> Vec<IupacCode> {
    primer.iter().map(|c| IupacCode::from_letter(*c)).collect()
}

/// Masks of a read sequence; unknown calls never match.
pub fn read_masks(seq: &[u8]) -> Vec<IupacCode> {
    seq.iter().map(|c| IupacCode::from_read_letter(*c)).collect()
}

/// Number of positions where `window` and `pattern` share no base.
#[inline]
pub fn count_mismatches(window: &[IupacCode], pattern: &[IupacCode]) -> usize {
    window
        .iter()
        .zip(pattern.iter())
        .filter(|(a, b)| !a.matches(**b))
        .count()
}
