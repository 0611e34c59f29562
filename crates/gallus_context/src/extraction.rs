//! Ordered pattern extraction from raw flock-conversation text.
//!
//! Fast, deterministic extraction BEFORE any LLM call. Each extraction kind
//! carries a fixed, ordered rule list evaluated first-match-wins: specific
//! surface forms ("jour 14", "J14") sit ahead of generic ones ("14 j",
//! "3 semaines") so a generic pattern never shadows a specific one.
//!
//! All extraction is pure over the input text. A miss, or a match whose
//! parsed value fails validation (age 95 is outside the rearing window), is
//! an absent value. Nothing in here errors on malformed input.

use anyhow::{Context, Result};
use regex::Regex;

use crate::entities::{Line, Sex, Species, MAX_AGE_DAYS};

/// Which entity an extraction call is after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtractionKind {
    AgeDays,
    Sex,
    Line,
    Species,
    Signs,
}

impl ExtractionKind {
    /// Stable tag, part of the cache-key fingerprint.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionKind::AgeDays => "age_days",
            ExtractionKind::Sex => "sex",
            ExtractionKind::Line => "line",
            ExtractionKind::Species => "species",
            ExtractionKind::Signs => "signs",
        }
    }
}

/// A typed extraction result.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Age(u8),
    Sex(Sex),
    Line(Line),
    Species(Species),
    Sign(String),
}

impl ScalarValue {
    pub fn as_age(&self) -> Option<u8> {
        match self {
            ScalarValue::Age(days) => Some(*days),
            _ => None,
        }
    }

    pub fn as_sex(&self) -> Option<Sex> {
        match self {
            ScalarValue::Sex(sex) => Some(*sex),
            _ => None,
        }
    }

    pub fn as_line(&self) -> Option<Line> {
        match self {
            ScalarValue::Line(line) => Some(line.clone()),
            _ => None,
        }
    }

    pub fn as_species(&self) -> Option<Species> {
        match self {
            ScalarValue::Species(species) => Some(*species),
            _ => None,
        }
    }

    pub fn as_sign(&self) -> Option<String> {
        match self {
            ScalarValue::Sign(token) => Some(token.clone()),
            _ => None,
        }
    }
}

/// One age rule: a surface pattern and the day multiplier its captured
/// number carries (1 for day forms, 7 for week forms).
struct AgeRule {
    pattern: Regex,
    day_multiplier: u32,
}

/// Stateless extractor holding the compiled rule tables.
///
/// Rule order inside each table is part of the contract: evaluation stops at
/// the first rule that matches and validates.
pub struct PatternExtractor {
    age_rules: Vec<AgeRule>,
    sex_rules: Vec<(Regex, Sex)>,
    line_rules: Vec<(Regex, &'static str)>,
    species_rules: Vec<(Regex, Species)>,
    sign_rules: Vec<(Regex, &'static str)>,
}

impl PatternExtractor {
    pub fn new() -> Result<Self> {
        let age_rule = |pattern: &str, day_multiplier: u32| -> Result<AgeRule> {
            Ok(AgeRule {
                pattern: Regex::new(pattern)
                    .with_context(|| format!("Invalid age pattern: {pattern}"))?,
                day_multiplier,
            })
        };
        let rule = |pattern: &str| -> Result<Regex> {
            Regex::new(pattern).with_context(|| format!("Invalid pattern: {pattern}"))
        };

        Ok(Self {
            // Specific day forms first, bare-number day forms after, week
            // forms last so "21 jours" never routes through the multiplier.
            age_rules: vec![
                age_rule(r"(?i)\bjour\s*(\d{1,3})\b", 1)?,
                age_rule(r"(?i)\bj\s*(\d{1,3})\b", 1)?,
                age_rule(r"(?i)\b(\d{1,3})\s*(?:e|ème|eme)?\s*jours?\b", 1)?,
                age_rule(r"(?i)\b(\d{1,3})\s*j\b", 1)?,
                age_rule(r"(?i)\b(\d{1,2})\s*(?:semaines?|sem\.?|weeks?)\b", 7)?,
            ],
            // Mixed-flock vocabulary before female before male; "male" alone
            // must never win against a flock described as mixed.
            sex_rules: vec![
                (
                    rule(r"(?i)\bmixtes?\b|\bmixed\b|\bas[\s-]?hatched\b|\bnon[\s-]?sex[ée]s?\b")?,
                    Sex::AsHatched,
                ),
                (rule(r"(?i)\bfemelles?\b|\bfemales?\b|\bpoulettes?\b")?, Sex::Female),
                (rule(r"(?i)\bm[âa]les?\b|\bcoqs?\b")?, Sex::Male),
            ],
            line_rules: vec![
                (rule(r"(?i)\bross[\s-]*308\b")?, "ross308"),
                (rule(r"(?i)\bross[\s-]*708\b")?, "ross708"),
                (rule(r"(?i)\bcobb[\s-]*500\b")?, "cobb500"),
                (rule(r"(?i)\bhubbard\b")?, "hubbard"),
                (rule(r"(?i)\bisa[\s-]*brown\b")?, "isabrown"),
                (rule(r"(?i)\blohmann\b")?, "lohmann"),
            ],
            species_rules: vec![
                (
                    rule(r"(?i)\bpoulets?\s+de\s+chair\b|\bbroilers?\b|\bchair\b")?,
                    Species::Broiler,
                ),
                (
                    rule(r"(?i)\bpondeuses?\b|\bponte\b|\blayers?\b")?,
                    Species::Layer,
                ),
            ],
            // Obvious clinical vocabulary, tier 1 of the signs policy.
            // Multi-word forms before single-word ones.
            sign_rules: vec![
                (rule(r"(?i)\bbaisse\s+de\s+ponte\b|\begg\s+drop\b")?, "baisse_ponte"),
                (rule(r"(?i)\bmortalit[ée]s?\b|\bmortality\b")?, "mortalite"),
                (rule(r"(?i)\bboiteries?\b|\bboiteux\b|\blameness\b")?, "boiterie"),
                (rule(r"(?i)\bdiarrh[ée]es?\b|\bdiarrhea\b")?, "diarrhee"),
                (rule(r"(?i)\btoux\b|\bcough(?:ing)?\b")?, "toux"),
                (rule(r"(?i)\b[ée]ternuements?\b|\bsneez(?:e|es|ing)\b")?, "eternuements"),
                (rule(r"(?i)\bpicage\b|\bfeather\s+pecking\b")?, "picage"),
                (rule(r"(?i)\bprostration\b|\bprostr[ée]s?\b")?, "prostration"),
                (
                    rule(r"(?i)\bplumage\s+anormal\b|\bfeather\s+loss\b|\bd[ée]plumement\b")?,
                    "plumage_anormal",
                ),
                (rule(r"(?i)\bconvulsions?\b|\btremblements?\b")?, "signes_nerveux"),
            ],
        })
    }

    /// Extract one kind of entity from free text.
    pub fn extract(&self, text: &str, kind: ExtractionKind) -> Option<ScalarValue> {
        match kind {
            ExtractionKind::AgeDays => self.extract_age_days(text).map(ScalarValue::Age),
            ExtractionKind::Sex => self.normalize_sex(text).map(ScalarValue::Sex),
            ExtractionKind::Line => self.extract_line(text).map(ScalarValue::Line),
            ExtractionKind::Species => self.extract_species(text).map(ScalarValue::Species),
            ExtractionKind::Signs => self.extract_obvious_sign(text).map(ScalarValue::Sign),
        }
    }

    /// Age in days, validated against `[0, MAX_AGE_DAYS]`.
    ///
    /// A rule that matches but fails the range check does not win; later
    /// rules still get a chance, and a text with no valid age yields `None`.
    pub fn extract_age_days(&self, text: &str) -> Option<u8> {
        for rule in &self.age_rules {
            let Some(caps) = rule.pattern.captures(text) else {
                continue;
            };
            let Ok(raw) = caps[1].parse::<u32>() else {
                continue;
            };
            let Some(days) = raw.checked_mul(rule.day_multiplier) else {
                continue;
            };
            if days <= u32::from(MAX_AGE_DAYS) {
                return Some(days as u8);
            }
        }
        None
    }

    /// Sex category from flock vocabulary (French and English forms).
    pub fn normalize_sex(&self, text: &str) -> Option<Sex> {
        for (pattern, sex) in &self.sex_rules {
            if pattern.is_match(text) {
                return Some(*sex);
            }
        }
        None
    }

    /// Genetic line, normalized to its canonical code.
    pub fn extract_line(&self, text: &str) -> Option<Line> {
        for (pattern, code) in &self.line_rules {
            if pattern.is_match(text) {
                return Line::from_code(code);
            }
        }
        None
    }

    /// Production species (broiler vs layer).
    pub fn extract_species(&self, text: &str) -> Option<Species> {
        for (pattern, species) in &self.species_rules {
            if pattern.is_match(text) {
                return Some(*species);
            }
        }
        None
    }

    /// Tier 1 of the clinical-sign policy: the obvious vocabulary.
    ///
    /// The LLM fallback (tier 2) is orchestrated by the engine, not here;
    /// this stays pure.
    pub fn extract_obvious_sign(&self, text: &str) -> Option<String> {
        for (pattern, token) in &self.sign_rules {
            if pattern.is_match(text) {
                return Some((*token).to_string());
            }
        }
        None
    }
}

/// Normalize a free-form sign answer (typically from the LLM fallback) into
/// a short ASCII token, or `None` when the answer amounts to "no sign".
pub fn normalize_sign_token(raw: &str) -> Option<String> {
    const MAX_TOKEN_LEN: usize = 24;
    const NO_SIGN_ANSWERS: &[&str] = &["none", "aucun", "aucune", "rien", "unknown", "no_sign", "na", "n_a"];

    let mut token = String::new();
    for c in raw.trim().to_lowercase().chars() {
        let mapped = match c {
            'à' | 'â' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'î' | 'ï' => 'i',
            'ô' | 'ö' => 'o',
            'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            ' ' | '-' | '\'' => '_',
            other => other,
        };
        if mapped.is_ascii_alphanumeric() || mapped == '_' {
            token.push(mapped);
        }
        if token.len() >= MAX_TOKEN_LEN {
            break;
        }
    }

    let token = token.trim_matches('_').to_string();
    if token.is_empty() || NO_SIGN_ANSWERS.contains(&token.as_str()) {
        None
    } else {
        Some(token)
    }
}
