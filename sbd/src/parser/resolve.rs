//! Name resolution within a matched definition line
//!
//! Turns the free-text requirement clause and item name into table ids.

use tracing::debug;

use crate::domain::WorkItem;
use crate::tables::Tables;

/// Resolve requirements, material and set for a freshly matched item
///
/// `clause` is the comma separated requirement text with any set name appended.
pub fn apply_requirements(item: &mut WorkItem, clause: &str, tables: &Tables) {
    item.requirements = resolve_traits(clause, tables);
    strip_material(item, tables);
    item.set_id = resolve_set(clause, tables).unwrap_or(0);
    debug!(
        character = %item.character,
        item = %item.item_name,
        material_id = item.material_id,
        set_id = item.set_id,
        requirements = ?item.requirements,
        "apply_requirements: resolved"
    );
}

/// Trait ids for each comma separated token; unknown names are dropped
pub fn resolve_traits(clause: &str, tables: &Tables) -> Vec<u32> {
    clause
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .filter_map(|token| tables.trait_id(token))
        .collect()
}

/// Strip a leading material name from the item name
///
/// The material must be a whole word: "Gold Ring" becomes material Gold and
/// name "Ring", while "Golden Ring" is left alone.
pub fn strip_material(item: &mut WorkItem, tables: &Tables) {
    for (id, name) in tables.materials() {
        let Some(word) = item.item_name.get(..name.len()) else {
            continue;
        };
        if word.eq_ignore_ascii_case(name) && item.item_name[name.len()..].starts_with(' ') {
            item.material_id = *id;
            item.item_name = item.item_name[name.len() + 1..].to_string();
            return;
        }
    }
}

/// Find the set named in a requirement clause
///
/// Candidates are tried longest name first. For each candidate, the first
/// case-insensitive occurrence of `"<name> Set"` and then `"<name>"` is
/// accepted only when bounded by a comma, a space or the string edge on both
/// sides. The first bounded match wins.
pub fn resolve_set(clause: &str, tables: &Tables) -> Option<u32> {
    let hay = clause.to_ascii_lowercase();
    let bytes = hay.as_bytes();

    for (id, name) in tables.sets_longest_first() {
        let name = name.to_ascii_lowercase();
        for pattern in [format!("{name} set"), name.clone()] {
            let Some(index) = hay.find(&pattern) else {
                continue;
            };
            let end = index + pattern.len();
            let start_bounded = index == 0 || matches!(bytes[index - 1], b',' | b' ');
            let end_bounded = end >= bytes.len() || matches!(bytes[end], b',' | b' ');
            if start_bounded && end_bounded {
                return Some(*id);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::TablesFile;

    fn tables() -> Tables {
        Tables::builtin()
    }

    fn item(name: &str) -> WorkItem {
        WorkItem::new(1, "Alice", name)
    }

    #[test]
    fn test_material_stripped_on_word_boundary() {
        let mut w = item("Gold Ring");
        strip_material(&mut w, &tables());
        assert_eq!(w.item_name, "Ring");
        assert_eq!(w.material_id, 60);
    }

    #[test]
    fn test_material_not_stripped_from_partial_word() {
        let mut w = item("Golden Ring");
        strip_material(&mut w, &tables());
        assert_eq!(w.item_name, "Golden Ring");
        assert_eq!(w.material_id, 0);
    }

    #[test]
    fn test_material_case_insensitive_multiword() {
        let mut w = item("black opal Necklace");
        strip_material(&mut w, &tables());
        assert_eq!(w.item_name, "Necklace");
        assert_eq!(w.material_id, 16);
    }

    #[test]
    fn test_material_name_alone_is_kept() {
        let mut w = item("Gold");
        strip_material(&mut w, &tables());
        assert_eq!(w.item_name, "Gold");
        assert_eq!(w.material_id, 0);
    }

    #[test]
    fn test_traits_unknown_dropped() {
        let ids = resolve_traits("Epic Strength, Bogus Thing,,Major Focus ", &tables());
        assert_eq!(ids, vec![2576, 2579]);
    }

    #[test]
    fn test_set_prefers_longest() {
        let t = tables();
        assert_eq!(resolve_set("Epic Strength,Weave of Alchemy Set", &t), Some(49));
        assert_eq!(resolve_set("Epic Strength,Alchemy Set", &t), Some(35));
    }

    #[test]
    fn test_set_both_candidates_present_longer_wins() {
        let t = tables();
        assert_eq!(resolve_set("Alchemy Set,Weave of Alchemy Set", &t), Some(49));
    }

    #[test]
    fn test_set_requires_boundaries() {
        let t = Tables::from_file(TablesFile {
            sets: [(22, "Swift".to_string())].into_iter().collect(),
            ..Default::default()
        });
        assert_eq!(resolve_set("Epic Swiftness", &t), None);
        assert_eq!(resolve_set("Epic Strength,Swift Set", &t), Some(22));
        assert_eq!(resolve_set("swift", &t), Some(22));
    }

    #[test]
    fn test_set_none() {
        assert_eq!(resolve_set("Epic Strength, Major Focus", &tables()), None);
        assert_eq!(resolve_set("", &tables()), None);
    }

    #[test]
    fn test_apply_requirements() {
        let mut w = item("Iron Breastplate");
        apply_requirements(&mut w, "Epic Invulnerability, Major Strength,Defender's Set", &tables());
        assert_eq!(w.item_name, "Breastplate");
        assert_eq!(w.material_id, 61);
        assert_eq!(w.set_id, 16);
        assert_eq!(w.requirements, vec![4667, 2583]);
    }
}
