//! Definition line grammars
//!
//! Each supported export format is one [`GrammarKind`]. A [`LineParser`] pairs
//! the kind with its compiled expression; the chain tries them in order.

use regex::{Captures, Regex};
use tracing::debug;

use crate::domain::WorkItem;
use crate::tables::Tables;

use super::resolve::apply_requirements;

/// VGI suit export:
/// `Character, Item, [Set Name Set,] AL n, cantrips..., Wield Lvl n, Diff n, BU n`
const VGI_SUIT_PATTERN: &str = concat!(
    r"(?P<character>[A-Za-z0-9\-'_ ]+), (?P<item>[A-Za-z0-9 ']+), ",
    r"(?P<set>[A-Za-z0-9' ]* Set){0,1},? ?",
    r"AL (?P<armorlevel>[0-9]*), (?P<cantrips>[A-Za-z0-9 ,]+), ",
    r"Wield Lvl (?P<wieldreq>[0-9]*), Diff (?P<diff>[0-9]+), BU (?P<burden>[0-9]+)",
);

/// Mag-Tools style export with optional trailing attributes:
/// `Character, Item, [Set Set,] [AL n,] cantrips, [Wield Lvl n,] [... to Activate,]
/// [Diff n,] [Craft n,] [Value n,] [BU n,] [rating]`
const MAG_PATTERN: &str = concat!(
    r"(?P<character>[A-Za-z0-9\-'_ ]+), (?P<item>[A-Za-z0-9 ']+,) ?",
    r"(?P<set>[A-Za-z0-9' ]* Set, ?)?",
    r"(AL (?P<armorlevel>[0-9]*), ?)?",
    r"(?P<cantrips>[A-Za-z ,]+,) ",
    r"(Wield Lvl (?P<wieldreq>[0-9]*),)? ?",
    r"([A-Za-z0-9 ]+ to Activate, ?)?",
    r"(Diff (?P<diff>[0-9]+), ?)?",
    r"(Craft (?P<craft>[0-9]+), ?)?",
    r"(Value (?P<value>[0-9,]+),)? ?",
    r"(BU (?P<burden>[0-9]+),?)? ?",
    r"\[?(?P<rating>[A-Z0-9]+)?\]?",
);

/// Supported definition formats, in trial order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrammarKind {
    VgiSuit,
    Mag,
}

impl GrammarKind {
    /// All grammars in the order they are tried
    pub const ALL: [GrammarKind; 2] = [GrammarKind::VgiSuit, GrammarKind::Mag];

    fn pattern(&self) -> &'static str {
        match self {
            Self::VgiSuit => VGI_SUIT_PATTERN,
            Self::Mag => MAG_PATTERN,
        }
    }
}

impl std::fmt::Display for GrammarKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VgiSuit => write!(f, "vgi-suit"),
            Self::Mag => write!(f, "mag"),
        }
    }
}

/// One compiled grammar
#[derive(Debug, Clone)]
pub struct LineParser {
    kind: GrammarKind,
    regex: Regex,
}

impl LineParser {
    pub fn new(kind: GrammarKind) -> Result<Self, regex::Error> {
        Ok(Self {
            kind,
            regex: Regex::new(kind.pattern())?,
        })
    }

    pub fn kind(&self) -> GrammarKind {
        self.kind
    }

    /// Whether the line is in this grammar's format
    pub fn is_valid(&self, line: &str) -> bool {
        !line.trim().is_empty() && self.regex.is_match(line)
    }

    /// Extract a work item; id is left at 0 for the caller to assign
    pub fn process(&self, line: &str, tables: &Tables) -> Option<WorkItem> {
        let caps = self.regex.captures(line)?;

        let character = text(&caps, "character").trim().to_string();
        let item_name = match self.kind {
            GrammarKind::VgiSuit => text(&caps, "item").trim().to_string(),
            GrammarKind::Mag => text(&caps, "item").replace(',', "").trim().to_string(),
        };
        if character.is_empty() || item_name.is_empty() {
            debug!(kind = %self.kind, "LineParser::process: empty character or item");
            return None;
        }

        let mut item = WorkItem::new(0, character, item_name);
        item.armor_level = number(&caps, "armorlevel");
        item.wield_level = number(&caps, "wieldreq");
        item.difficulty = number(&caps, "diff");
        item.craft = number(&caps, "craft");
        item.value = number(&caps, "value");
        item.burden = number(&caps, "burden");

        let mut clause = text(&caps, "cantrips").to_string();
        let set = text(&caps, "set").trim().trim_end_matches(',').trim();
        if !set.is_empty() {
            clause.push(',');
            clause.push_str(set);
        }

        apply_requirements(&mut item, &clause, tables);
        Some(item)
    }
}

fn text<'h>(caps: &Captures<'h>, name: &str) -> &'h str {
    caps.name(name).map(|m| m.as_str()).unwrap_or("")
}

/// Optional numeric capture; absent or unparseable means 0
fn number(caps: &Captures<'_>, name: &str) -> u32 {
    text(caps, name).replace(',', "").parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser(kind: GrammarKind) -> LineParser {
        LineParser::new(kind).unwrap()
    }

    #[test]
    fn test_all_patterns_compile() {
        for kind in GrammarKind::ALL {
            assert!(LineParser::new(kind).is_ok(), "{kind} failed to compile");
        }
    }

    #[test]
    fn test_vgi_suit_with_set() {
        let p = parser(GrammarKind::VgiSuit);
        let line = "Mule One, Gold Ring, Weave of Alchemy Set, AL 0, Epic Strength, Major Focus, Wield Lvl 150, Diff 300, BU 50";
        assert!(p.is_valid(line));
        let item = p.process(line, &Tables::builtin()).unwrap();
        assert_eq!(item.character, "Mule One");
        assert_eq!(item.item_name, "Ring");
        assert_eq!(item.material_id, 60);
        assert_eq!(item.set_id, 49);
        assert_eq!(item.requirements, vec![2576, 2579]);
        assert_eq!(item.wield_level, 150);
        assert_eq!(item.difficulty, 300);
        assert_eq!(item.burden, 50);
    }

    #[test]
    fn test_vgi_suit_without_set() {
        let p = parser(GrammarKind::VgiSuit);
        let line = "Mule-Two, Golden Ring, AL 12, Epic Willpower, Wield Lvl 0, Diff 10, BU 5";
        let item = p.process(line, &Tables::builtin()).unwrap();
        assert_eq!(item.character, "Mule-Two");
        assert_eq!(item.item_name, "Golden Ring");
        assert_eq!(item.material_id, 0);
        assert_eq!(item.set_id, 0);
        assert_eq!(item.armor_level, 12);
        assert_eq!(item.requirements, vec![2577]);
    }

    #[test]
    fn test_vgi_suit_rejects_mag_line() {
        let p = parser(GrammarKind::VgiSuit);
        assert!(!p.is_valid("Mule, Ring, Epic Strength, [R5]"));
        assert!(!p.is_valid("   "));
    }

    #[test]
    fn test_mag_full_line() {
        let p = parser(GrammarKind::Mag);
        let line = "Mule Two, Iron Breastplate, Defender's Set, AL 500, Epic Invulnerability, Major Strength, Wield Lvl 180, Diff 350, Craft 9, Value 12,500, BU 800, [R5]";
        assert!(p.is_valid(line));
        let item = p.process(line, &Tables::builtin()).unwrap();
        assert_eq!(item.character, "Mule Two");
        assert_eq!(item.item_name, "Breastplate");
        assert_eq!(item.material_id, 61);
        assert_eq!(item.set_id, 16);
        assert_eq!(item.armor_level, 500);
        assert_eq!(item.requirements, vec![4667, 2583]);
        assert_eq!(item.wield_level, 180);
        assert_eq!(item.difficulty, 350);
        assert_eq!(item.craft, 9);
        assert_eq!(item.value, 12_500);
        assert_eq!(item.burden, 800);
    }

    #[test]
    fn test_mag_minimal_line_numeric_fields_default_zero() {
        let p = parser(GrammarKind::Mag);
        let line = "Alt, Silver Bracelet, Epic Focus, Legendary Willpower, ";
        let item = p.process(line, &Tables::builtin()).unwrap();
        assert_eq!(item.item_name, "Bracelet");
        assert_eq!(item.material_id, 63);
        assert_eq!(item.requirements, vec![2572, 3966]);
        assert_eq!(item.armor_level, 0);
        assert_eq!(item.value, 0);
        assert_eq!(item.burden, 0);
    }

    #[test]
    fn test_number_helper() {
        let re = Regex::new(r"(?P<n>[0-9,]+)?x").unwrap();
        let caps = re.captures("1,234x").unwrap();
        assert_eq!(number(&caps, "n"), 1234);
        let caps = re.captures("x").unwrap();
        assert_eq!(number(&caps, "n"), 0);
        assert_eq!(number(&caps, "missing"), 0);
    }
}
