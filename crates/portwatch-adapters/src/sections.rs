//! Section splitter for the weekly dry-bulk market report.
//!
//! A small state machine walks header and end-marker events in document order:
//! `SeekingHeader` until a vessel-class header opens a section, `InSection`
//! until the next header of another class, an end marker after the final
//! header, or the end of the document.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use scraper::Html;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Capesize,
    Panamax,
    UltramaxSupramax,
    Handysize,
}

impl SectionKind {
    fn from_header(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "capesize" => Some(SectionKind::Capesize),
            "panamax" => Some(SectionKind::Panamax),
            "ultramax" | "supramax" => Some(SectionKind::UltramaxSupramax),
            "handysize" => Some(SectionKind::Handysize),
            _ => None,
        }
    }
}

const BOILERPLATE: &[&str] = &[
    "This site uses cookies",
    "We use cookies to ensure that we give you the best experience on our website",
    "If you click \"Accept Cookies\", or continue without changing your settings, you consent to their use",
    "You can change your settings at any time",
    "Menu Home Who We Are",
    "Data Services",
    "Membership Services",
    "Media & Events",
    "Free Trial KYC Emissions",
    "What can we help you find?",
    "Previous Next Latest News Read More About",
    "Follow X LinkedIn Vimeo Instagram",
    "Data Policy Privacy Policy Terms and Conditions Baltic Rules Cookies Sitemap",
];

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(capesize|panamax|ultramax|supramax|handysize)\b")
            .expect("static header pattern")
    })
}

fn end_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(Previous|Next|Latest News|Read More)\b").expect("static end pattern")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Header(SectionKind),
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    SeekingHeader,
    InSection { kind: SectionKind, start: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportSections(BTreeMap<SectionKind, String>);

impl ReportSections {
    pub fn get(&self, kind: SectionKind) -> Option<&str> {
        self.0.get(&kind).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    fn fill(&mut self, kind: SectionKind, raw: &str) {
        if self.0.contains_key(&kind) {
            return;
        }
        let cleaned = clean_section(raw);
        if !cleaned.is_empty() {
            debug!(section = ?kind, chars = cleaned.len(), "extracted report section");
            self.0.insert(kind, cleaned);
        }
    }
}

pub fn parse_sections(text: &str) -> ReportSections {
    let mut events = header_re()
        .captures_iter(text)
        .filter_map(|caps| {
            let m = caps.get(1)?;
            SectionKind::from_header(m.as_str()).map(|kind| (m.start(), Event::Header(kind)))
        })
        .collect::<Vec<_>>();

    let last_header = events.last().map(|(pos, _)| *pos);
    if let Some(last_header) = last_header {
        events.extend(
            end_marker_re()
                .find_iter(text)
                .filter(|m| m.start() > last_header)
                .map(|m| (m.start(), Event::End)),
        );
    }
    events.sort_by_key(|(pos, _)| *pos);

    let mut sections = ReportSections::default();
    let mut state = ParserState::SeekingHeader;
    for (pos, event) in events {
        state = match (state, event) {
            (ParserState::SeekingHeader, Event::Header(kind)) => {
                ParserState::InSection { kind, start: pos }
            }
            (ParserState::SeekingHeader, Event::End) => ParserState::SeekingHeader,
            (open @ ParserState::InSection { kind, .. }, Event::Header(next)) if next == kind => open,
            (ParserState::InSection { kind, start }, Event::Header(next)) => {
                sections.fill(kind, &text[start..pos]);
                ParserState::InSection {
                    kind: next,
                    start: pos,
                }
            }
            (ParserState::InSection { kind, start }, Event::End) => {
                sections.fill(kind, &text[start..pos]);
                ParserState::SeekingHeader
            }
        };
    }
    if let ParserState::InSection { kind, start } = state {
        sections.fill(kind, &text[start..]);
    }
    sections
}

/// Visible text of an HTML page, scripts and styles excluded.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut parts = Vec::new();
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|p| p.value().as_element().map(|el| el.name().to_string()))
            .is_some_and(|name| matches!(name.as_str(), "script" | "style" | "noscript"));
        let trimmed = text.trim();
        if !hidden && !trimmed.is_empty() {
            parts.push(trimmed.to_string());
        }
    }
    parts.join(" ")
}

/// Splits a report that may be HTML or already plain text.
pub fn parse_report(content: &str) -> ReportSections {
    if content.trim_start().starts_with('<') {
        parse_sections(&html_to_text(content))
    } else {
        parse_sections(content)
    }
}

fn clean_section(raw: &str) -> String {
    let mut content = raw.to_string();
    for phrase in BOILERPLATE {
        content = content.replace(phrase, "");
    }
    content.split_whitespace().collect::<Vec<_>>().join(" ")
}
