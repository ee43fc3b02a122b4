//! Lookup tables for materials, armor sets and traits
//!
//! The parser resolves names found in definition lines against these tables.
//! A built-in set covers the common names; a YAML file with the same shape
//! can replace any of the three maps.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Errors loading a tables file
#[derive(Debug, Error)]
pub enum TableError {
    #[error("Failed to read tables file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse tables file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// On-disk shape of a tables file
///
/// ```yaml
/// materials:
///   60: Gold
/// sets:
///   49: Weave of Alchemy
/// traits:
///   2576: Epic Strength
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TablesFile {
    pub materials: BTreeMap<u32, String>,
    pub sets: BTreeMap<u32, String>,
    pub traits: BTreeMap<u32, String>,
}

/// Resolved lookup tables
#[derive(Debug, Clone)]
pub struct Tables {
    /// Material id and name, in table order
    materials: Vec<(u32, String)>,
    /// Set id and name, longest name first
    sets: Vec<(u32, String)>,
    /// Lowercased trait name to id
    traits: HashMap<String, u32>,
}

impl Default for Tables {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Tables {
    /// Build tables from explicit maps
    pub fn from_file(file: TablesFile) -> Self {
        let materials = file.materials.into_iter().collect();
        let mut sets: Vec<(u32, String)> = file.sets.into_iter().collect();
        // Stable sort keeps id order among equal lengths
        sets.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
        let traits = file
            .traits
            .into_iter()
            .map(|(id, name)| (name.trim().to_ascii_lowercase(), id))
            .collect();
        Self {
            materials,
            sets,
            traits,
        }
    }

    /// Load tables from a YAML file, falling back to built-ins for empty sections
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TableError> {
        let path = path.as_ref();
        debug!(?path, "Tables::load: called");
        let content = std::fs::read_to_string(path).map_err(|source| TableError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut file: TablesFile = serde_yaml::from_str(&content).map_err(|source| TableError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        let builtin = builtin_file();
        if file.materials.is_empty() {
            file.materials = builtin.materials;
        }
        if file.sets.is_empty() {
            file.sets = builtin.sets;
        }
        if file.traits.is_empty() {
            file.traits = builtin.traits;
        }

        let tables = Self::from_file(file);
        info!(
            materials = tables.materials.len(),
            sets = tables.sets.len(),
            traits = tables.traits.len(),
            "Loaded lookup tables from {}",
            path.display()
        );
        Ok(tables)
    }

    /// The built-in tables
    pub fn builtin() -> Self {
        Self::from_file(builtin_file())
    }

    /// Materials in table order
    pub fn materials(&self) -> &[(u32, String)] {
        &self.materials
    }

    /// Sets ordered longest name first
    pub fn sets_longest_first(&self) -> &[(u32, String)] {
        &self.sets
    }

    /// Trait id for a name, case-insensitive
    pub fn trait_id(&self, name: &str) -> Option<u32> {
        self.traits.get(&name.trim().to_ascii_lowercase()).copied()
    }
}

fn to_map(entries: &[(u32, &str)]) -> BTreeMap<u32, String> {
    entries.iter().map(|(id, name)| (*id, (*name).to_string())).collect()
}

fn builtin_file() -> TablesFile {
    TablesFile {
        materials: to_map(BUILTIN_MATERIALS),
        sets: to_map(BUILTIN_SETS),
        traits: to_map(BUILTIN_TRAITS),
    }
}

const BUILTIN_MATERIALS: &[(u32, &str)] = &[
    (1, "Ceramic"),
    (2, "Porcelain"),
    (4, "Linen"),
    (5, "Satin"),
    (6, "Silk"),
    (7, "Velvet"),
    (8, "Wool"),
    (10, "Agate"),
    (11, "Amber"),
    (12, "Amethyst"),
    (13, "Aquamarine"),
    (14, "Azurite"),
    (15, "Black Garnet"),
    (16, "Black Opal"),
    (17, "Bloodstone"),
    (18, "Carnelian"),
    (19, "Citrine"),
    (20, "Diamond"),
    (21, "Emerald"),
    (22, "Fire Opal"),
    (23, "Green Garnet"),
    (24, "Green Jade"),
    (25, "Hematite"),
    (26, "Imperial Topaz"),
    (27, "Jet"),
    (28, "Lapis Lazuli"),
    (29, "Lavender Jade"),
    (30, "Malachite"),
    (31, "Moonstone"),
    (32, "Onyx"),
    (33, "Opal"),
    (34, "Peridot"),
    (35, "Red Garnet"),
    (36, "Red Jade"),
    (37, "Rose Quartz"),
    (38, "Ruby"),
    (39, "Sapphire"),
    (40, "Smokey Quartz"),
    (41, "Sunstone"),
    (42, "Tiger Eye"),
    (43, "Tourmaline"),
    (44, "Turquoise"),
    (45, "White Jade"),
    (46, "White Quartz"),
    (47, "White Sapphire"),
    (48, "Yellow Garnet"),
    (49, "Yellow Topaz"),
    (50, "Zircon"),
    (51, "Ivory"),
    (52, "Leather"),
    (53, "Armoredillo Hide"),
    (54, "Gromnie Hide"),
    (55, "Reed Shark Hide"),
    (57, "Brass"),
    (58, "Bronze"),
    (59, "Copper"),
    (60, "Gold"),
    (61, "Iron"),
    (62, "Pyreal"),
    (63, "Silver"),
    (64, "Steel"),
    (66, "Alabaster"),
    (67, "Granite"),
    (68, "Marble"),
    (69, "Obsidian"),
    (70, "Sandstone"),
    (71, "Serpentine"),
    (73, "Ebony"),
    (74, "Mahogany"),
    (75, "Oak"),
    (76, "Pine"),
    (77, "Teak"),
];

const BUILTIN_SETS: &[(u32, &str)] = &[
    (13, "Soldier's"),
    (14, "Adept's"),
    (15, "Archer's"),
    (16, "Defender's"),
    (17, "Tinker's"),
    (18, "Crafter's"),
    (19, "Hearty"),
    (20, "Dexterous"),
    (21, "Wise"),
    (22, "Swift"),
    (23, "Hardened"),
    (24, "Reinforced"),
    (25, "Interlocking"),
    (26, "Flame Proof"),
    (27, "Acid Proof"),
    (28, "Cold Proof"),
    (29, "Lightning Proof"),
    (35, "Alchemy"),
    (49, "Weave of Alchemy"),
    (50, "Weave of Arcane Lore"),
    (51, "Weave of Armor Tinkering"),
    (52, "Weave of Assess Person"),
    (58, "Weave of Creature Enchantment"),
    (60, "Weave of Fletching"),
    (62, "Weave of Item Enchantment"),
    (65, "Weave of Life Magic"),
    (67, "Weave of Magic Defense"),
    (71, "Weave of War Magic"),
    (77, "Weave of Void Magic"),
];

const BUILTIN_TRAITS: &[(u32, &str)] = &[
    (2576, "Epic Strength"),
    (2574, "Epic Endurance"),
    (2573, "Epic Coordination"),
    (2575, "Epic Quickness"),
    (2572, "Epic Focus"),
    (2577, "Epic Willpower"),
    (3965, "Legendary Strength"),
    (3963, "Legendary Endurance"),
    (3962, "Legendary Coordination"),
    (3964, "Legendary Quickness"),
    (3961, "Legendary Focus"),
    (3966, "Legendary Willpower"),
    (2583, "Major Strength"),
    (2581, "Major Endurance"),
    (2580, "Major Coordination"),
    (2582, "Major Quickness"),
    (2579, "Major Focus"),
    (2584, "Major Willpower"),
    (4667, "Epic Invulnerability"),
    (4668, "Epic Impregnability"),
    (4669, "Epic Magic Resistance"),
    (2604, "Major Invulnerability"),
    (2605, "Major Impregnability"),
    (2606, "Major Magic Resistance"),
    (4680, "Epic Armor"),
    (4681, "Legendary Armor"),
    (2591, "Major Armor"),
    (4700, "Epic War Magic Aptitude"),
    (4701, "Legendary War Magic Aptitude"),
    (4702, "Epic Life Magic Aptitude"),
    (4703, "Legendary Life Magic Aptitude"),
    (4704, "Epic Void Magic Aptitude"),
    (4705, "Legendary Void Magic Aptitude"),
    (4710, "Epic Alchemical Prowess"),
    (4711, "Legendary Alchemical Prowess"),
    (4720, "Epic Mana Conversion Prowess"),
    (4721, "Legendary Mana Conversion Prowess"),
];
