//! Observation classification codes and the derived overall assessment

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Classification attached to each observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClassificationCode {
    /// Danger present
    C1,
    /// Potentially dangerous
    C2,
    /// Improvement recommended
    C3,
    /// Further investigation required
    FI,
}

impl ClassificationCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::C1 => "C1",
            Self::C2 => "C2",
            Self::C3 => "C3",
            Self::FI => "FI",
        }
    }

    /// Codes that make the installation unsatisfactory.
    pub const fn is_unsatisfactory(self) -> bool {
        matches!(self, Self::C1 | Self::C2 | Self::FI)
    }
}

impl fmt::Display for ClassificationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClassificationCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "C1" => Ok(Self::C1),
            "C2" => Ok(Self::C2),
            "C3" => Ok(Self::C3),
            "FI" => Ok(Self::FI),
            other => Err(Error::InvalidInput(format!(
                "Unknown classification code: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallAssessment {
    Satisfactory,
    Unsatisfactory,
}

impl OverallAssessment {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Satisfactory => "SATISFACTORY",
            Self::Unsatisfactory => "UNSATISFACTORY",
        }
    }
}

impl fmt::Display for OverallAssessment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive the overall assessment from the committed classification codes.
pub fn compute_overall_assessment(
    codes: impl IntoIterator<Item = ClassificationCode>,
) -> OverallAssessment {
    if codes
        .into_iter()
        .any(ClassificationCode::is_unsatisfactory)
    {
        OverallAssessment::Unsatisfactory
    } else {
        OverallAssessment::Satisfactory
    }
}
