//! Figure catalog lookups.
//!
//! Keys in the catalog document are `0x`-prefixed lowercase hex, e.g.
//! `"0x0741000000200002"` for a figure or `"0x074"` for a game series.

use crate::constants::*;
use crate::decoded::DecryptedImage;
use crate::error::Result;
use crate::image::{FigureId, TagImage};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Alternate ids for figures that shipped twice, mapped to the canonical id.
pub const VARIANT_REMAP: [(&str, &str); 11] = [
    ("0741000000000002", "0741000000200002"),
    ("0008000000000002", "0008000000030002"),
    ("0581000000000002", "05810000001c0002"),
    ("2281000000000002", "2281000002510002"),
    ("0742000000000002", "07420000001f0002"),
    ("1919000000000002", "1919000000090002"),
    ("0781000000000002", "0781000000330002"),
    ("0003000000000002", "0003000000020002"),
    ("0100000000000002", "0100000000040002"),
    ("34c0000000000002", "34c0000002530002"),
    ("2104000000000002", "2104000002520002"),
];

const VARIANT_SUFFIX: &str = " (N2)";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FigureEntry {
    pub name: String,
    /// Region code to release date, when known
    #[serde(default)]
    pub release: HashMap<String, Option<String>>,
}

impl FigureEntry {
    pub fn is_variant(&self) -> bool {
        self.name.ends_with(VARIANT_SUFFIX)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    amiibo_series: HashMap<String, String>,
    #[serde(default, rename = "amiibos")]
    figures: HashMap<String, FigureEntry>,
    #[serde(default)]
    characters: HashMap<String, String>,
    #[serde(default)]
    game_series: HashMap<String, String>,
    #[serde(default)]
    types: HashMap<String, String>,
}

fn key(hex: &str) -> String {
    format!("0x{hex}")
}

impl Catalog {
    pub fn from_json(json: &str) -> Result<Self> {
        let mut catalog: Catalog = serde_json::from_str(json)?;
        catalog.apply_variants();
        info!("Loaded catalog with {} figures", catalog.figures.len());
        Ok(catalog)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    fn apply_variants(&mut self) {
        for (alternate, canonical) in VARIANT_REMAP {
            if let Some(entry) = self.figures.get(&key(canonical)).cloned() {
                let entry = FigureEntry {
                    name: format!("{}{VARIANT_SUFFIX}", entry.name),
                    release: entry.release,
                };
                self.figures.insert(key(alternate), entry);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.figures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.figures.is_empty()
    }

    pub fn figure(&self, id: &FigureId) -> Option<&FigureEntry> {
        self.figures.get(&key(&id.hex()))
    }

    pub fn figure_name(&self, id: &FigureId) -> Option<&str> {
        self.figure(id).map(|e| e.name.as_str())
    }

    /// Suppressed for variant entries.
    pub fn game_series_name(&self, id: &FigureId) -> Option<&str> {
        if self.figure(id)?.is_variant() {
            return None;
        }
        self.game_series.get(&key(&id.game_series_hex())).map(String::as_str)
    }

    /// Suppressed for variant entries.
    pub fn amiibo_series_name(&self, id: &FigureId) -> Option<&str> {
        if self.figure(id)?.is_variant() {
            return None;
        }
        self.amiibo_series.get(&key(&id.amiibo_series_hex())).map(String::as_str)
    }

    pub fn character_name(&self, id: &FigureId) -> Option<&str> {
        self.characters.get(&key(&id.character_hex())).map(String::as_str)
    }

    pub fn type_name(&self, id: &FigureId) -> Option<&str> {
        self.types.get(&key(&id.type_hex())).map(String::as_str)
    }

    /// Figures of one character, sorted by id.
    pub fn figures_for_character(&self, character_hex: &str) -> Vec<(FigureId, &FigureEntry)> {
        let prefix = key(&character_hex.to_lowercase());
        let mut figures: Vec<_> = self
            .figures
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, e)| FigureId::from_hex(k).ok().map(|id| (id, e)))
            .collect();
        figures.sort_by_key(|(id, _)| *id);
        figures
    }

    /// Nickname if the figure has one, else the catalog name, else the raw id.
    pub fn display_name(&self, image: &TagImage, decrypted: Option<&DecryptedImage>) -> String {
        if let Some(nickname) = decrypted.map(DecryptedImage::nickname).filter(|n| !n.is_empty()) {
            return nickname;
        }
        let id = image.figure_id();
        match self.figure_name(&id) {
            Some(name) => name.to_string(),
            None => id.to_string(),
        }
    }

    /// Index the dumps found under `dir` by figure id. The first readable dump
    /// of each catalogued figure wins; unknown figures are skipped.
    pub fn index_dumps(&self, dir: impl AsRef<Path>) -> Result<BTreeMap<FigureId, PathBuf>> {
        let mut index = BTreeMap::new();
        let mut pending = vec![dir.as_ref().to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries: Vec<_> = std::fs::read_dir(&dir)?.collect::<std::io::Result<_>>()?;
            entries.sort_by_key(|e| e.path());
            for entry in entries {
                let path = entry.path();
                let meta = entry.metadata()?;
                if meta.is_dir() {
                    pending.push(path);
                    continue;
                }
                if !ACCEPTED_SIZES.contains(&(meta.len() as usize)) {
                    continue;
                }
                let Ok(image) = std::fs::read(&path).map_err(Into::into).and_then(|b| TagImage::load(&b)) else {
                    debug!("Skipping unreadable dump {}", path.display());
                    continue;
                };
                let id = image.figure_id();
                if self.figure(&id).is_some() {
                    index.entry(id).or_insert(path);
                }
            }
        }
        Ok(index)
    }
}

/// `icon_<head>-<tail>`, using the canonical id for variants.
pub fn artwork_file_name(id: &FigureId) -> String {
    let hex = id.hex();
    let hex = VARIANT_REMAP
        .iter()
        .find(|(alternate, _)| *alternate == hex)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(hex);
    format!("icon_{}-{}", &hex[0..8], &hex[8..16])
}

/// Path of the artwork in `dir`, only if the file exists.
pub fn artwork_path(dir: impl AsRef<Path>, id: &FigureId) -> Option<PathBuf> {
    let path = dir.as_ref().join(artwork_file_name(id));
    path.is_file().then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "amiibo_series": {"0x00": "Super Smash Bros."},
        "amiibos": {
            "0x0741000000200002": {"name": "Dark Pit", "release": {"na": "2015-04-03", "jp": null}},
            "0x0000000000000002": {"name": "Mario", "release": {}}
        },
        "characters": {"0x0741": "Dark Pit"},
        "game_series": {"0x074": "Kid Icarus"},
        "types": {"0x00": "Figure"}
    }"#;

    #[test]
    fn test_variant_entries_are_added() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        assert_eq!(catalog.len(), 3);

        let variant = FigureId::from_hex("0741000000000002").unwrap();
        assert_eq!(catalog.figure_name(&variant), Some("Dark Pit (N2)"));
        assert_eq!(catalog.game_series_name(&variant), None);
        assert_eq!(catalog.amiibo_series_name(&variant), None);

        let canonical = FigureId::from_hex("0741000000200002").unwrap();
        assert_eq!(catalog.game_series_name(&canonical), Some("Kid Icarus"));
        assert_eq!(catalog.amiibo_series_name(&canonical), Some("Super Smash Bros."));
        assert_eq!(catalog.character_name(&canonical), Some("Dark Pit"));
        assert_eq!(catalog.type_name(&canonical), Some("Figure"));
    }

    #[test]
    fn test_artwork_names() {
        let variant = FigureId::from_hex("0741000000000002").unwrap();
        assert_eq!(artwork_file_name(&variant), "icon_07410000-00200002");
        let mario = FigureId::from_hex("0000000000000002").unwrap();
        assert_eq!(artwork_file_name(&mario), "icon_00000000-00000002");
        assert!(artwork_path(std::env::temp_dir().join("no-such-artwork-dir"), &mario).is_none());
    }

    #[test]
    fn test_display_name_falls_back_to_id() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        let unknown = TagImage::load(&[0u8; IMAGE_SIZE])
            .unwrap()
            .with_field(FIGURE_ID, &[0x12, 0x34, 0, 0, 0, 0, 0, 0x02]);
        assert_eq!(catalog.display_name(&unknown, None), "0x1234000000000002");

        let mario = unknown.with_field(FIGURE_ID, &[0, 0, 0, 0, 0, 0, 0, 0x02]);
        assert_eq!(catalog.display_name(&mario, None), "Mario");
    }

    #[test]
    fn test_figures_for_character() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        let figures = catalog.figures_for_character("0741");
        assert_eq!(figures.len(), 2);
        assert_eq!(figures[0].0.hex(), "0741000000000002");
    }
}
