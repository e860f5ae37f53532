//! Lazy readers for the supported read layouts.
//!
//! Every source is sniffed for the gzip magic bytes and transparently
//! decompressed. Items are `Ok(Read)`, a recoverable [`ReadFailure::Skip`]
//! (paired reads that do not join) or a [`ReadFailure::Fatal`] that ends the
//! dataset.

use crate::{
    error::{ErrorCode, ReadFailure, Result, ScataError},
    pairing::{PairedFastqReads, PairingParams},
    read::Read,
};
use bio::io::{fasta, fastq};
use flate2::read::MultiGzDecoder;
use scata_protocol::FileFormat;
use std::{
    fs::File,
    io::{BufRead, BufReader, Lines, Read as IoRead},
    path::Path,
};

pub type ReadStream = Box<dyn IoRead + Send>;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Wraps `reader` in a gzip decoder when it starts with the gzip magic bytes.
pub fn decompress_if_gzipped<R: IoRead + Send + 'static>(reader: R) -> std::io::Result<ReadStream> {
    let mut buffered = BufReader::new(reader);
    let is_gzip = buffered.fill_buf()?.starts_with(&GZIP_MAGIC);
    if is_gzip {
        Ok(Box::new(MultiGzDecoder::new(buffered)))
    } else {
        Ok(Box::new(buffered))
    }
}

pub fn open_source(path: &Path) -> Result<ReadStream> {
    let file = File::open(path)
        .map_err(|e| ScataError::io(&format!("Could not open '{}'", path.display()), e))?;
    decompress_if_gzipped(file)
        .map_err(|e| ScataError::io(&format!("Could not read '{}'", path.display()), e))
}

fn phred33(qual: &[u8]) -> Vec<u8> {
    qual.iter().map(|q| q.saturating_sub(33)).collect()
}

/// Single-end FASTQ.
pub struct FastqReads {
    records: fastq::Records<BufReader<ReadStream>>,
}

impl FastqReads {
    pub fn new(stream: ReadStream) -> Self {
        Self {
            records: fastq::Reader::new(stream).records(),
        }
    }

    /// Next record as a [`Read`], `None` at end of input.
    pub fn next_read(&mut self) -> Option<std::result::Result<Read, ScataError>> {
        let record = self.records.next()?;
        Some(
            record
                .map(|r| Read::with_qual(r.id(), r.seq(), phred33(r.qual())))
                .map_err(|e| {
                    ScataError::new(ErrorCode::BadInput, format!("Bad FASTQ input: {e}"))
                }),
        )
    }
}

impl Iterator for FastqReads {
    type Item = std::result::Result<Read, ReadFailure>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_read().map(|r| r.map_err(ReadFailure::Fatal))
    }
}

/// Records of a `.qual` file: `>name` then whitespace separated integers
/// until the next header or end of input.
pub struct QualRecords<R: BufRead> {
    lines: Lines<R>,
    header: Option<String>,
    started: bool,
}

impl<R: BufRead> QualRecords<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            header: None,
            started: false,
        }
    }

    fn bad(message: impl Into<String>) -> ScataError {
        ScataError::new(ErrorCode::BadQualfile, message)
    }

    fn next_line(&mut self) -> Option<std::result::Result<String, ScataError>> {
        self.lines
            .next()
            .map(|l| l.map_err(|e| Self::bad(format!("Could not read quality file: {e}"))))
    }

    fn read_first_header(&mut self) -> std::result::Result<(), ScataError> {
        self.started = true;
        while let Some(line) = self.next_line() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if !line.starts_with('>') {
                return Err(Self::bad("Format error in quality file: expected '>'"));
            }
            self.header = Some(line);
            return Ok(());
        }
        Ok(())
    }
}

impl<R: BufRead> Iterator for QualRecords<R> {
    type Item = std::result::Result<(String, Vec<u8>), ScataError>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            if let Err(e) = self.read_first_header() {
                return Some(Err(e));
            }
        }
        let header = self.header.take()?;
        let name = header[1..].split_whitespace().next().unwrap_or("").to_string();
        let mut quals = Vec::new();
        while let Some(line) = self.next_line() {
            let line = match line {
                Ok(line) => line,
                Err(e) => return Some(Err(e)),
            };
            if line.starts_with('>') {
                self.header = Some(line);
                break;
            }
            for token in line.split_whitespace() {
                match token.parse::<u8>() {
                    Ok(q) => quals.push(q),
                    Err(_) => {
                        return Some(Err(Self::bad(format!(
                            "Invalid quality value '{token}' for '{name}'"
                        ))))
                    }
                }
            }
        }
        Some(Ok((name, quals)))
    }
}

/// FASTA, optionally joined with a `.qual` file.
pub struct FastaReads {
    records: fasta::Records<BufReader<ReadStream>>,
    qual: Option<QualRecords<BufReader<ReadStream>>>,
}

impl FastaReads {
    pub fn new(stream: ReadStream, qual: Option<ReadStream>) -> Self {
        Self {
            records: fasta::Reader::new(stream).records(),
            qual: qual.map(|q| QualRecords::new(BufReader::new(q))),
        }
    }

    fn attach_quality(&mut self, mut read: Read) -> std::result::Result<Read, ScataError> {
        let Some(quals) = self.qual.as_mut() else {
            return Ok(read);
        };
        let (name, q) = match quals.next() {
            Some(entry) => entry?,
            None => {
                return Err(ScataError::new(
                    ErrorCode::BadQualfile,
                    format!("Quality file ended before sequence '{}'", read.id),
                ))
            }
        };
        if name != read.id {
            return Err(ScataError::new(
                ErrorCode::IdMismatch,
                format!("Fasta and Qual ID mismatch: {} {}", read.id, name),
            ));
        }
        if q.len() != read.seq.len() {
            return Err(ScataError::new(
                ErrorCode::LengthMismatch,
                format!(
                    "Length of sequence and quality mismatch: {} {} ({} bases, {} scores)",
                    read.id,
                    name,
                    read.seq.len(),
                    q.len()
                ),
            ));
        }
        read.qual = Some(q);
        Ok(read)
    }
}

impl Iterator for FastaReads {
    type Item = std::result::Result<Read, ReadFailure>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = match self.records.next()? {
            Ok(record) => record,
            Err(e) => {
                return Some(Err(ReadFailure::fatal(
                    ErrorCode::BadInput,
                    format!("Bad FASTA input: {e}"),
                )))
            }
        };
        let read = Read::new(record.id(), record.seq());
        Some(self.attach_quality(read).map_err(ReadFailure::Fatal))
    }
}

/// Format-agnostic read source.
pub enum ReadParser {
    Fastq(FastqReads),
    PairedFastq(PairedFastqReads),
    Fasta(FastaReads),
}

impl ReadParser {
    pub fn from_streams(
        format: FileFormat,
        first: ReadStream,
        second: Option<ReadStream>,
        pairing: PairingParams,
    ) -> Result<Self> {
        match (format, second) {
            (FileFormat::Fastq, _) => Ok(ReadParser::Fastq(FastqReads::new(first))),
            (FileFormat::Fasta, _) => Ok(ReadParser::Fasta(FastaReads::new(first, None))),
            (FileFormat::PairedFastq, Some(second)) => Ok(ReadParser::PairedFastq(
                PairedFastqReads::new(FastqReads::new(first), FastqReads::new(second), pairing),
            )),
            (FileFormat::FastaQual, Some(second)) => {
                Ok(ReadParser::Fasta(FastaReads::new(first, Some(second))))
            }
            (format, None) => Err(ScataError::new(
                ErrorCode::InvalidInput,
                format!("{format:?} requires a second input file"),
            )),
        }
    }

    pub fn open(
        format: FileFormat,
        first: &Path,
        second: Option<&Path>,
        pairing: PairingParams,
    ) -> Result<Self> {
        let first = open_source(first)?;
        let second = match second {
            Some(path) if format.needs_second_file() => Some(open_source(path)?),
            _ => None,
        };
        Self::from_streams(format, first, second, pairing)
    }

    pub fn has_quality(&self) -> bool {
        match self {
            ReadParser::Fastq(_) | ReadParser::PairedFastq(_) => true,
            ReadParser::Fasta(reads) => reads.qual.is_some(),
        }
    }
}

impl Iterator for ReadParser {
    type Item = std::result::Result<Read, ReadFailure>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            ReadParser::Fastq(reads) => reads.next(),
            ReadParser::PairedFastq(reads) => reads.next(),
            ReadParser::Fasta(reads) => reads.next(),
        }
    }
}
