//! Row addressing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Subject label used when the caller does not supply one.
pub const DEFAULT_BIDS_ID: &str = "DEFAULT";

/// Granularity a row is addressed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    /// One imaging session of one subject (the BIDS participant level).
    #[default]
    Session,
    /// All sessions of one subject.
    Subject,
    /// A group of subjects.
    Group,
    /// The whole dataset.
    Dataset,
}

impl Frequency {
    /// Returns true if the app runs at the `participant` analysis level.
    pub fn is_participant_level(self) -> bool {
        matches!(self, Frequency::Session)
    }

    pub fn analysis_level(self) -> AnalysisLevel {
        if self.is_participant_level() {
            AnalysisLevel::Participant
        } else {
            AnalysisLevel::Group
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frequency::Session => write!(f, "session"),
            Frequency::Subject => write!(f, "subject"),
            Frequency::Group => write!(f, "group"),
            Frequency::Dataset => write!(f, "dataset"),
        }
    }
}

impl FromStr for Frequency {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "session" => Ok(Frequency::Session),
            "subject" => Ok(Frequency::Subject),
            "group" => Ok(Frequency::Group),
            "dataset" => Ok(Frequency::Dataset),
            _ => Err(ConfigError::InvalidFrequency(s.to_string())),
        }
    }
}

/// Positional analysis-level token passed to the app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisLevel {
    Participant,
    Group,
}

impl AnalysisLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisLevel::Participant => "participant",
            AnalysisLevel::Group => "group",
        }
    }
}

impl fmt::Display for AnalysisLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One addressable unit of the dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRowAddress")]
pub struct RowAddress {
    frequency: Frequency,
    id: String,
}

/// Unchecked wire form of [`RowAddress`].
#[derive(Deserialize)]
struct RawRowAddress {
    frequency: Frequency,
    id: Option<String>,
}

impl TryFrom<RawRowAddress> for RowAddress {
    type Error = ConfigError;

    fn try_from(raw: RawRowAddress) -> Result<Self, Self::Error> {
        RowAddress::new(raw.frequency, raw.id.as_deref())
    }
}

impl RowAddress {
    /// Creates a row address.
    ///
    /// A `sub-` prefix on `id` is stripped; a missing id becomes
    /// [`DEFAULT_BIDS_ID`]. The remaining label must be alphanumeric.
    pub fn new(frequency: Frequency, id: Option<&str>) -> Result<Self, ConfigError> {
        let raw = id.map(str::trim).filter(|s| !s.is_empty());
        let label = match raw {
            Some(value) => value.strip_prefix("sub-").unwrap_or(value),
            None => DEFAULT_BIDS_ID,
        };
        if label.is_empty() || !label.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ConfigError::InvalidRowId(raw.unwrap_or_default().to_string()));
        }
        Ok(Self {
            frequency,
            id: label.to_string(),
        })
    }

    /// Shorthand for a participant-level row.
    pub fn session(id: &str) -> Result<Self, ConfigError> {
        Self::new(Frequency::Session, Some(id))
    }

    pub fn frequency(&self) -> Frequency {
        self.frequency
    }

    /// Label without the `sub-` prefix, as passed to `--participant-label`.
    pub fn label(&self) -> &str {
        &self.id
    }

    /// Subject directory name, `sub-<label>`.
    pub fn subject_dir(&self) -> String {
        format!("sub-{}", self.id)
    }

    pub fn analysis_level(&self) -> AnalysisLevel {
        self.frequency.analysis_level()
    }
}

impl fmt::Display for RowAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.frequency, self.subject_dir())
    }
}
