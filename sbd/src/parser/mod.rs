//! Definition file parsing
//!
//! A definition file holds one candidate work item per line. Each line is tried
//! against the grammars in [`GrammarKind::ALL`] order and the first one that
//! matches and extracts an item wins. Lines nothing understands are collected
//! as [`ParseFailure`]s instead of aborting the file.

mod grammar;
mod resolve;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::WorkItem;
use crate::tables::Tables;

pub use grammar::{GrammarKind, LineParser};
pub use resolve::{apply_requirements, resolve_set, resolve_traits, strip_material};

/// Definition file extension
pub const DEFINITION_EXTENSION: &str = "alb";

/// Maximum characters of a failing line kept for reporting
const FAILURE_TEXT_LIMIT: usize = 80;

/// Errors reading a definition file
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Failed to read definition {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A line that no grammar could turn into a work item
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: unrecognized definition '{text}'")]
pub struct ParseFailure {
    /// 1-based line number
    pub line: usize,
    /// Line text, truncated
    pub text: String,
}

/// Result of parsing a whole definition
#[derive(Debug, Clone, Default)]
pub struct ParseReport {
    /// Unique items in file order, ids assigned from 1
    pub items: Vec<WorkItem>,
    /// Lines that matched no grammar
    pub failures: Vec<ParseFailure>,
    /// Items discarded as duplicates of an earlier item
    pub duplicates: Vec<WorkItem>,
}

impl ParseReport {
    /// The first unparsed line, if any
    pub fn first_failure(&self) -> Option<&ParseFailure> {
        self.failures.first()
    }
}

/// Ordered set of line grammars plus the lookup tables they resolve against
#[derive(Debug, Clone)]
pub struct ParserChain {
    parsers: Vec<LineParser>,
    tables: Tables,
}

impl ParserChain {
    pub fn new(tables: Tables) -> Result<Self, regex::Error> {
        let parsers = GrammarKind::ALL
            .into_iter()
            .map(LineParser::new)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { parsers, tables })
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    /// Parse a single line with the first grammar that accepts it
    pub fn parse_line(&self, line: &str) -> Option<(GrammarKind, WorkItem)> {
        self.parsers
            .iter()
            .filter(|p| p.is_valid(line))
            .find_map(|p| p.process(line, &self.tables).map(|item| (p.kind(), item)))
    }

    /// Parse definition text
    ///
    /// Blank lines and lines starting with `#` or `//` are skipped. Item ids
    /// are assigned in file order starting at 1, before duplicates are removed.
    pub fn parse_str(&self, content: &str) -> ParseReport {
        let mut items = Vec::new();
        let mut failures = Vec::new();
        let mut next_id = 1;

        for (index, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if is_skipped(line) {
                continue;
            }
            match self.parse_line(line) {
                Some((kind, mut item)) => {
                    item.id = next_id;
                    next_id += 1;
                    debug!(line = index + 1, %kind, id = item.id, "ParserChain::parse_str: matched");
                    items.push(item);
                }
                None => {
                    let failure = ParseFailure {
                        line: index + 1,
                        text: truncate(line, FAILURE_TEXT_LIMIT),
                    };
                    warn!(line = failure.line, "Unparsed definition line: {}", failure.text);
                    failures.push(failure);
                }
            }
        }

        let (items, duplicates) = detect_duplicates(items);
        ParseReport {
            items,
            failures,
            duplicates,
        }
    }

    /// Read and parse a definition file
    pub fn parse_file(&self, path: impl AsRef<Path>) -> Result<ParseReport, ParseError> {
        let path = path.as_ref();
        debug!(?path, "ParserChain::parse_file: called");
        let content = std::fs::read_to_string(path).map_err(|source| ParseError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let report = self.parse_str(&content);
        info!(
            items = report.items.len(),
            failures = report.failures.len(),
            duplicates = report.duplicates.len(),
            "Parsed definition {}",
            path.display()
        );
        Ok(report)
    }
}

fn is_skipped(line: &str) -> bool {
    line.is_empty() || line.starts_with('#') || line.starts_with("//")
}

fn truncate(line: &str, limit: usize) -> String {
    if line.chars().count() <= limit {
        line.to_string()
    } else {
        let mut text: String = line.chars().take(limit).collect();
        text.push_str("...");
        text
    }
}

type DuplicateKey = (String, String, u32, u32, Vec<u32>);

fn duplicate_key(item: &WorkItem) -> DuplicateKey {
    (
        item.character.clone(),
        item.item_name.clone(),
        item.material_id,
        item.set_id,
        item.sorted_requirements(),
    )
}

/// Split items into first occurrences and later duplicates
///
/// Two items are duplicates when character, name, material, set and the
/// sorted requirement list are all equal.
pub fn detect_duplicates(items: Vec<WorkItem>) -> (Vec<WorkItem>, Vec<WorkItem>) {
    let mut seen: HashSet<DuplicateKey> = HashSet::new();
    let mut unique = Vec::with_capacity(items.len());
    let mut duplicates = Vec::new();

    for item in items {
        if seen.insert(duplicate_key(&item)) {
            unique.push(item);
        } else {
            debug!(id = item.id, item = %item.item_name, "detect_duplicates: dropped");
            duplicates.push(item);
        }
    }
    (unique, duplicates)
}

/// Resolve a definition name to a file under `dir`
///
/// The extension is normalized so `Suit`, `Suit.alb` and `Suit.ALB` all map to
/// `Suit.alb`. Names that could escape `dir` resolve to `None`.
pub fn definition_path(dir: impl AsRef<Path>, name: &str) -> Option<PathBuf> {
    let name = name.trim();
    let stem = match name.rsplit_once('.') {
        Some((stem, ext)) if ext.eq_ignore_ascii_case(DEFINITION_EXTENSION) => stem,
        _ => name,
    };
    if stem.is_empty() || stem.contains(['/', '\\']) || stem.contains("..") {
        return None;
    }
    Some(dir.as_ref().join(format!("{stem}.{DEFINITION_EXTENSION}")))
}
