//! Three-group keyword matcher.
//!
//! Group C (port/location) is mandatory; a record passes when it hits C and at
//! least one of A (vessel type) or B (operator). Every keyword is tested, so
//! the score is the total number of distinct hits across groups.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use portwatch_core::{
    CategoryField, MatchResult, NormalizedRecord, StoredRecord, Verdict, UNKNOWN_TOKEN,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Characters of context kept either side of a hit.
pub const SNIPPET_CONTEXT: usize = 50;

#[derive(Debug, Error)]
pub enum KeywordConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing keyword groups: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid keyword {keyword:?}: {source}")]
    Pattern {
        keyword: String,
        #[source]
        source: regex::Error,
    },
    #[error("mandatory keyword group {0:?} is empty")]
    EmptyMandatoryGroup(GroupId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupId {
    VesselType,
    Operator,
    PortLocation,
}

#[derive(Debug, Clone, Deserialize)]
struct KeywordsFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    vessel_type: Vec<String>,
    #[serde(default)]
    operator: Vec<String>,
    #[serde(default)]
    port_location: Vec<String>,
}

#[derive(Debug, Clone)]
struct Keyword {
    text: String,
    pattern: Regex,
}

#[derive(Debug, Clone)]
pub struct KeywordGroup {
    id: GroupId,
    mandatory: bool,
    keywords: Vec<Keyword>,
}

impl KeywordGroup {
    pub fn new(id: GroupId, mandatory: bool, keywords: &[String]) -> Result<Self, KeywordConfigError> {
        let mut seen = HashSet::new();
        let mut compiled = Vec::new();
        for raw in keywords {
            let text = raw.trim();
            if text.is_empty() || !seen.insert(text.to_uppercase()) {
                continue;
            }
            let pattern = compile_keyword(text).map_err(|source| KeywordConfigError::Pattern {
                keyword: text.to_string(),
                source,
            })?;
            compiled.push(Keyword {
                text: text.to_string(),
                pattern,
            });
        }
        if mandatory && compiled.is_empty() {
            return Err(KeywordConfigError::EmptyMandatoryGroup(id));
        }
        Ok(Self {
            id,
            mandatory,
            keywords: compiled,
        })
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn is_mandatory(&self) -> bool {
        self.mandatory
    }

    pub fn keywords(&self) -> impl Iterator<Item = &str> {
        self.keywords.iter().map(|k| k.text.as_str())
    }

    /// Distinct hits in configuration order, each with the byte span of its
    /// first occurrence.
    fn hits<'a>(&'a self, text: &str) -> Vec<(&'a str, usize, usize)> {
        self.keywords
            .iter()
            .filter_map(|k| {
                let m = k.pattern.captures(text)?.get(1)?;
                Some((k.text.as_str(), m.start(), m.end()))
            })
            .collect()
    }
}

/// `*` matches any run of word characters; everything else is literal. A hit
/// must be bounded by the text edges or by non-alphanumeric characters.
fn compile_keyword(keyword: &str) -> Result<Regex, regex::Error> {
    let body = keyword
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"\w*");
    Regex::new(&format!(r"(?i)(?:^|[^\p{{L}}\p{{N}}])({body})(?:$|[^\p{{L}}\p{{N}}])"))
}

/// Groups A, B and C, compiled once.
#[derive(Debug, Clone)]
pub struct Matcher {
    vessel_type: KeywordGroup,
    operator: KeywordGroup,
    port_location: KeywordGroup,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntityHits {
    pub primary: Option<String>,
    pub all: Vec<String>,
}

impl EntityHits {
    fn from_hits(hits: Vec<String>) -> Self {
        Self {
            primary: hits.first().cloned(),
            all: hits,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractedEntities {
    pub vessel_type: EntityHits,
    pub operator: EntityHits,
    pub port_location: EntityHits,
}

impl Matcher {
    pub fn new(
        vessel_type: &[String],
        operator: &[String],
        port_location: &[String],
    ) -> Result<Self, KeywordConfigError> {
        Ok(Self {
            vessel_type: KeywordGroup::new(GroupId::VesselType, false, vessel_type)?,
            operator: KeywordGroup::new(GroupId::Operator, false, operator)?,
            port_location: KeywordGroup::new(GroupId::PortLocation, true, port_location)?,
        })
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, KeywordConfigError> {
        let file: KeywordsFile = serde_yaml::from_str(text)?;
        Self::new(&file.vessel_type, &file.operator, &file.port_location)
    }

    pub async fn load(path: &Path) -> Result<Self, KeywordConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| KeywordConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let matcher = Self::from_yaml_str(&text)?;
        info!(
            path = %path.display(),
            vessel_type = matcher.vessel_type.keywords.len(),
            operator = matcher.operator.keywords.len(),
            port_location = matcher.port_location.keywords.len(),
            "loaded keyword groups"
        );
        Ok(matcher)
    }

    pub fn groups(&self) -> [&KeywordGroup; 3] {
        [&self.vessel_type, &self.operator, &self.port_location]
    }

    pub fn evaluate(&self, record: &NormalizedRecord) -> MatchResult {
        let text = record.searchable_text();
        let a = self.vessel_type.hits(&text);
        let b = self.operator.hits(&text);
        let c = self.port_location.hits(&text);

        let groups_matched = [&a, &b, &c].iter().filter(|h| !h.is_empty()).count() as u8;
        let match_score = (a.len() + b.len() + c.len()) as u32;
        let verdict = if !c.is_empty() && (!a.is_empty() || !b.is_empty()) {
            Verdict::Pass
        } else {
            Verdict::Fail
        };

        let snippets = a
            .iter()
            .chain(&b)
            .chain(&c)
            .map(|(_, start, end)| snippet(&text, *start, *end))
            .collect();

        MatchResult {
            vessel_type_keywords: names(&a),
            operator_keywords: names(&b),
            port_location_keywords: names(&c),
            groups_matched,
            total_groups: 3,
            match_score,
            verdict,
            snippets,
        }
    }

    pub fn extract_entities(&self, record: &NormalizedRecord) -> ExtractedEntities {
        let result = self.evaluate(record);
        ExtractedEntities {
            vessel_type: EntityHits::from_hits(result.vessel_type_keywords),
            operator: EntityHits::from_hits(result.operator_keywords),
            port_location: EntityHits::from_hits(result.port_location_keywords),
        }
    }
}

fn names(hits: &[(&str, usize, usize)]) -> Vec<String> {
    hits.iter().map(|(k, _, _)| k.to_string()).collect()
}

fn snippet(text: &str, start: usize, end: usize) -> String {
    let from = text[..start]
        .char_indices()
        .rev()
        .take(SNIPPET_CONTEXT)
        .last()
        .map(|(i, _)| i)
        .unwrap_or(start);
    let to = text[end..]
        .char_indices()
        .nth(SNIPPET_CONTEXT)
        .map(|(i, _)| end + i)
        .unwrap_or(text.len());
    format!("...{}...", text[from..to].trim())
}

/// Sorted distinct values per categorical field, placeholders excluded.
pub fn filter_options(records: &[StoredRecord]) -> BTreeMap<CategoryField, Vec<String>> {
    CategoryField::ALL
        .into_iter()
        .map(|field| {
            let values = records
                .iter()
                .flat_map(|r| r.record.category(field))
                .filter(|v| v.as_str() != UNKNOWN_TOKEN)
                .cloned()
                .collect::<BTreeSet<_>>();
            (field, values.into_iter().collect())
        })
        .collect()
}
