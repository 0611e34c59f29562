//! Typed domain entities extracted from flock conversations.
//!
//! Every field is optional: an entity the user never mentioned is `None`,
//! never a sentinel string. Ages are bounded to the commercial rearing
//! window.

use serde::{Deserialize, Serialize};

/// Upper bound for a plausible flock age, in days.
pub const MAX_AGE_DAYS: u8 = 70;

/// Production species category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Species {
    /// Meat production (poulet de chair)
    Broiler,
    /// Egg production (pondeuse)
    Layer,
}

impl Species {
    pub fn as_str(&self) -> &'static str {
        match self {
            Species::Broiler => "broiler",
            Species::Layer => "layer",
        }
    }
}

/// Flock sex category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sex {
    Male,
    Female,
    /// Unsorted/mixed flock (troupeau mixte)
    AsHatched,
}

impl Sex {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sex::Male => "male",
            Sex::Female => "female",
            Sex::AsHatched => "as_hatched",
        }
    }
}

/// Genetic lines recognized by the extractor, canonical lowercase codes.
pub const KNOWN_LINES: &[&str] = &[
    "ross308", "ross708", "cobb500", "hubbard", "isabrown", "lohmann",
];

/// A genetic line/breed code (e.g. `ross308`, `cobb500`).
///
/// Only codes from [`KNOWN_LINES`] can be constructed; free-form breed
/// strings from user text go through the extractor's normalization first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Line(String);

impl Line {
    /// Build a line from a canonical code. Returns `None` for codes outside
    /// the recognized vocabulary.
    pub fn from_code(code: &str) -> Option<Self> {
        let normalized = code.to_lowercase();
        if KNOWN_LINES.contains(&normalized.as_str()) {
            Some(Line(normalized))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Names of the entity slots, used for missing-field tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Species,
    Line,
    Sex,
    AgeDays,
    Signs,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Species => "species",
            Field::Line => "line",
            Field::Sex => "sex",
            Field::AgeDays => "age_days",
            Field::Signs => "signs",
        }
    }
}

/// The working set of entities known for a conversation turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitySet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub species: Option<Species>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<Line>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sex: Option<Sex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_days: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signs: Option<String>,
}

impl EntitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a given slot holds a value.
    pub fn has(&self, field: Field) -> bool {
        match field {
            Field::Species => self.species.is_some(),
            Field::Line => self.line.is_some(),
            Field::Sex => self.sex.is_some(),
            Field::AgeDays => self.age_days.is_some(),
            Field::Signs => self.signs.is_some(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.species.is_none()
            && self.line.is_none()
            && self.sex.is_none()
            && self.age_days.is_none()
            && self.signs.is_none()
    }

    // Builder helpers, used mostly from tests and the request layer.

    pub fn with_species(mut self, species: Species) -> Self {
        self.species = Some(species);
        self
    }

    pub fn with_line(mut self, line: Line) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_sex(mut self, sex: Sex) -> Self {
        self.sex = Some(sex);
        self
    }

    /// Set the age if it is inside the plausible rearing window.
    /// Out-of-range ages are ignored, keeping the set invariant intact.
    pub fn with_age_days(mut self, age_days: u8) -> Self {
        if age_days <= MAX_AGE_DAYS {
            self.age_days = Some(age_days);
        }
        self
    }

    pub fn with_signs(mut self, signs: impl Into<String>) -> Self {
        self.signs = Some(signs.into());
        self
    }
}
