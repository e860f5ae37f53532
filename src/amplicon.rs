use crate::{
    error::{ErrorCode, Result, ScataError},
    iupac_code::IupacCode,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashMap},
    fs::File,
    io::Read as _,
    path::{Path, PathBuf},
    sync::LazyLock,
};

pub const MAX_TAGSET_FILE_BYTES: u64 = 100_000;
pub const MAX_TAGSET_ERRORS: usize = 20;

static TAG_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-A-Za-z0-9_]+$").expect("valid tag name regex"));
static TAG_SEQ_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[ACGT]+$").expect("valid tag sequence regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Primer {
    pub sequence: String,
    #[serde(default)]
    pub mismatches: usize,
}

impl Primer {
    pub fn new(sequence: &str, mismatches: usize) -> Self {
        Self {
            sequence: sequence.to_ascii_uppercase(),
            mismatches,
        }
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    /// Fails on an empty primer or a letter outside the IUPAC alphabet.
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(ScataError::new(ErrorCode::InvalidInput, "Primer sequence is empty"));
        }
        match self.sequence.bytes().position(|b| !IupacCode::is_valid_letter(b)) {
            Some(pos) => Err(ScataError::new(
                ErrorCode::InvalidInput,
                format!(
                    "Primer '{}' has a non-IUPAC letter at position {}",
                    self.sequence,
                    pos + 1
                ),
            )),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagEntry {
    pub name: String,
    #[serde(default)]
    pub mates: BTreeSet<String>,
}

/// Serialized form of one tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRecord {
    pub name: String,
    pub sequence: String,
    #[serde(default)]
    pub mates: Vec<String>,
}

/// Tag sequence -> sample name and accepted mates. All tags share one length.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<TagRecord>", into = "Vec<TagRecord>")]
pub struct TagSet {
    tag_length: usize,
    tags: HashMap<Vec<u8>, TagEntry>,
}

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a tag. The first tag fixes the set's tag length.
    pub fn insert(&mut self, sequence: &str, name: &str, mates: impl IntoIterator<Item = String>) {
        let sequence = sequence.to_ascii_uppercase().into_bytes();
        if self.tags.is_empty() {
            self.tag_length = sequence.len();
        }
        self.tags.insert(
            sequence,
            TagEntry {
                name: name.to_string(),
                mates: mates.into_iter().collect(),
            },
        );
    }

    pub fn tag_length(&self) -> usize {
        self.tag_length
    }

    pub fn lookup(&self, sequence: &[u8]) -> Option<&TagEntry> {
        self.tags.get(sequence)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn records(&self) -> Vec<TagRecord> {
        let mut records: Vec<TagRecord> = self
            .tags
            .iter()
            .map(|(seq, entry)| TagRecord {
                name: entry.name.clone(),
                sequence: String::from_utf8_lossy(seq).to_string(),
                mates: entry.mates.iter().cloned().collect(),
            })
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.sequence.cmp(&b.sequence)));
        records
    }
}

impl From<Vec<TagRecord>> for TagSet {
    fn from(records: Vec<TagRecord>) -> Self {
        let mut set = TagSet::new();
        for record in records {
            set.insert(&record.sequence, &record.name, record.mates);
        }
        set
    }
}

impl From<TagSet> for Vec<TagRecord> {
    fn from(set: TagSet) -> Self {
        set.records()
    }
}

/// Outcome of validating a tag-set file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagSetReport {
    pub is_valid: bool,
    pub errors: String,
    pub num_tags: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<TagSet>,
}

impl TagSetReport {
    fn failed(errors: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            errors: errors.into(),
            num_tags: 0,
            tags: None,
        }
    }
}

/// Parses `name;TAGSEQ[;mate...]` lines. Invalid lines are reported and
/// skipped; too many of them fail the whole file.
pub fn parse_tagset(text: &str) -> TagSetReport {
    let mut tags = TagSet::new();
    let mut errors = String::new();
    let mut err_cnt = 0;
    let mut tag_len = 0;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(';').collect();
        if fields.len() < 2 {
            continue;
        }
        if tag_len == 0 {
            tag_len = fields[1].len();
        }

        let problem = if fields[1].len() != tag_len {
            Some(format!(
                "Tag on line {line_no} is not {tag_len} bp, as tags on previous lines"
            ))
        } else if !TAG_SEQ_RE.is_match(&fields[1].to_ascii_uppercase()) {
            Some(format!("Tag on line {line_no} contains invalid bases"))
        } else if !TAG_NAME_RE.is_match(fields[0]) {
            Some(format!("Tag name on line {line_no} contains invalid characters"))
        } else {
            fields[2..]
                .iter()
                .position(|mate| !TAG_NAME_RE.is_match(mate))
                .map(|i| {
                    format!(
                        "Pairing tag name {} on line {line_no} contains invalid characters",
                        i + 3
                    )
                })
        };

        match problem {
            Some(message) => {
                errors.push_str(&message);
                errors.push('\n');
                err_cnt += 1;
                if err_cnt > MAX_TAGSET_ERRORS {
                    errors.push_str("Too many errors, bailing out\n");
                    return TagSetReport::failed(errors);
                }
            }
            None => tags.insert(
                fields[1],
                fields[0],
                fields[2..].iter().map(|m| m.to_string()),
            ),
        }
    }

    TagSetReport {
        is_valid: true,
        errors,
        num_tags: tags.len(),
        tags: Some(tags),
    }
}

pub fn parse_tagset_file(path: &Path) -> Result<TagSetReport> {
    let file = File::open(path)
        .map_err(|e| ScataError::io(&format!("Could not open tag set '{}'", path.display()), e))?;
    let mut bytes = Vec::new();
    file.take(MAX_TAGSET_FILE_BYTES + 1)
        .read_to_end(&mut bytes)
        .map_err(|e| ScataError::io(&format!("Could not read tag set '{}'", path.display()), e))?;
    if bytes.len() as u64 > MAX_TAGSET_FILE_BYTES {
        return Ok(TagSetReport::failed("File too big"));
    }
    Ok(parse_tagset(&String::from_utf8_lossy(&bytes)))
}

/// Primer pair, length bounds and optional tag sets for one amplicon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Amplicon {
    pub id: String,
    pub five_prime: Option<Primer>,
    pub three_prime: Option<Primer>,
    pub min_length: usize,
    pub max_length: Option<usize>,
    pub five_prime_tags: Option<TagSet>,
    pub three_prime_tags: Option<TagSet>,
}

/// On-disk amplicon definition; tag sets may be given as tag-set files.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AmpliconFile {
    #[serde(flatten)]
    amplicon: Amplicon,
    five_prime_tagset: Option<PathBuf>,
    three_prime_tagset: Option<PathBuf>,
}

impl Amplicon {
    pub fn new(id: &str, five_prime: Option<Primer>, three_prime: Option<Primer>) -> Self {
        Self {
            id: id.to_string(),
            five_prime,
            three_prime,
            ..Self::default()
        }
    }

    pub fn with_tags(mut self, five_prime: Option<TagSet>, three_prime: Option<TagSet>) -> Self {
        self.five_prime_tags = five_prime;
        self.three_prime_tags = three_prime;
        self
    }

    pub fn with_length_bounds(mut self, min_length: usize, max_length: Option<usize>) -> Self {
        self.min_length = min_length;
        self.max_length = max_length;
        self
    }

    pub fn has_tags(&self) -> bool {
        self.five_prime_tags.is_some() || self.three_prime_tags.is_some()
    }

    /// Loads an amplicon JSON file. `five_prime_tagset`/`three_prime_tagset`
    /// are resolved relative to the file and must validate.
    pub fn load_from_path(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ScataError::io(&format!("Could not read amplicon '{path}'"), e))?;
        let file: AmpliconFile = serde_json::from_str(&text).map_err(|e| {
            ScataError::new(
                ErrorCode::InvalidInput,
                format!("Could not parse amplicon '{path}': {e}"),
            )
        })?;
        let base = Path::new(path).parent().unwrap_or(Path::new("."));
        let mut amplicon = file.amplicon;
        for primer in amplicon.five_prime.iter().chain(amplicon.three_prime.iter()) {
            primer.validate()?;
        }
        if let Some(tagset) = file.five_prime_tagset {
            amplicon.five_prime_tags = Some(load_valid_tagset(&base.join(tagset))?);
        }
        if let Some(tagset) = file.three_prime_tagset {
            amplicon.three_prime_tags = Some(load_valid_tagset(&base.join(tagset))?);
        }
        Ok(amplicon)
    }
}

fn load_valid_tagset(path: &Path) -> Result<TagSet> {
    let report = parse_tagset_file(path)?;
    match report.tags {
        Some(tags) if report.is_valid => Ok(tags),
        _ => Err(ScataError::new(
            ErrorCode::InvalidInput,
            format!(
                "Tag set '{}' is invalid: {}",
                path.display(),
                report.errors.trim_end()
            ),
        )),
    }
}
