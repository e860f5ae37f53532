use crate::{
    amplicon::Amplicon,
    detagger::Detagger,
    error::{ErrorCode, ReadFailure, Result, ScataError},
    quality_filter::{QualityThresholds, filter_full, filter_hqr},
    read::{DetaggedRead, Read},
    read_parser::ReadParser,
};
use scata_protocol::FilterMethod;
use serde::{Deserialize, Serialize};

/// How reads of one dataset are screened before they are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    pub method: FilterMethod,
    pub mean_min: f64,
    pub min_qual: u8,
    pub keep_primer: bool,
    pub ignore_tags: bool,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            method: FilterMethod::default(),
            mean_min: 20.0,
            min_qual: 20,
            keep_primer: false,
            ignore_tags: false,
        }
    }
}

/// Parser, quality filter and detagger composed per filter method.
pub struct Reads<I> {
    source: I,
    method: FilterMethod,
    thresholds: QualityThresholds,
    detagger: Option<Detagger>,
}

impl Reads<ReadParser> {
    pub fn from_parser(
        parser: ReadParser,
        amplicon: Option<&Amplicon>,
        settings: &FilterSettings,
    ) -> Result<Self> {
        let has_quality = parser.has_quality();
        Self::new(parser, has_quality, amplicon, settings)
    }
}

impl<I> Reads<I>
where
    I: Iterator<Item = std::result::Result<Read, ReadFailure>>,
{
    pub fn new(
        source: I,
        has_quality: bool,
        amplicon: Option<&Amplicon>,
        settings: &FilterSettings,
    ) -> Result<Self> {
        if settings.method.needs_quality() && !has_quality {
            return Err(ScataError::new(
                ErrorCode::MissingQual,
                "Selected filtering method requires quality data",
            ));
        }
        if settings.method == FilterMethod::Ampq && amplicon.is_none() {
            return Err(ScataError::new(
                ErrorCode::NoAmplicon,
                "Amplicon quality filtering requires a defined amplicon",
            ));
        }
        Ok(Self {
            source,
            method: settings.method,
            thresholds: QualityThresholds {
                min_length: amplicon.map(|a| a.min_length).unwrap_or(0),
                mean_min: settings.mean_min,
                min_qual: settings.min_qual,
            },
            detagger: amplicon
                .map(|a| Detagger::new(a, settings.ignore_tags, settings.keep_primer)),
        })
    }

    fn detag(&self, read: Read) -> std::result::Result<DetaggedRead, ReadFailure> {
        match &self.detagger {
            Some(detagger) => Ok(detagger.detag(read)?),
            None => Ok(DetaggedRead::untagged(read)),
        }
    }

    fn process(&self, read: Read) -> std::result::Result<DetaggedRead, ReadFailure> {
        match self.method {
            FilterMethod::Fs => self.detag(read),
            FilterMethod::Fsq => self.detag(filter_full(read, &self.thresholds)?),
            FilterMethod::Hqr => self.detag(filter_hqr(read, &self.thresholds)?),
            FilterMethod::Ampq => {
                let detagged = self.detag(read)?;
                let read = filter_full(detagged.read, &self.thresholds)?;
                Ok(DetaggedRead { read, ..detagged })
            }
        }
    }
}

impl<I> Iterator for Reads<I>
where
    I: Iterator<Item = std::result::Result<Read, ReadFailure>>,
{
    type Item = std::result::Result<DetaggedRead, ReadFailure>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(match self.source.next()? {
            Ok(read) => self.process(read),
            Err(e) => Err(e),
        })
    }
}
