//! The recipe document shared by the analyzer, extractor and patcher.
//!
//! A single JSON file carries everything: the protection's anchor addresses,
//! one entry per protected function with its extraction addresses and
//! captured value, and the address lists the patcher neutralizes statically.
//! The extractor mutates nothing but `Value` fields; saves go through a
//! sibling temp file so a kill between iterations cannot corrupt the
//! document.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::ser::PrettyFormatter;
use tracing::debug;

use crate::error::{Error, Result};
use crate::pe::Va;

/// Extraction and patch parameters of one protected function.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PatchSpec {
    /// Byte the patcher overwrites.
    #[serde(rename = "Prologue")]
    pub prologue: Va,
    /// Address execution is redirected to during extraction.
    #[serde(rename = "EIP")]
    pub eip: Va,
    /// Software breakpoint address.
    #[serde(rename = "BP")]
    pub bp: Va,
    /// Captured value; zero until extracted.
    #[serde(rename = "Value")]
    pub value: Va,
    /// Patch template, 1..=4 for runtime-capture variants.
    #[serde(rename = "Type")]
    pub patch_type: u32,
}

/// One `ConstantOrStolen` entry, encoded as `{ "0xFUNC": { ... } }`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecipeEntry {
    pub func: Va,
    pub patch: PatchSpec,
}

impl RecipeEntry {
    /// Whether a value has already been captured for this entry.
    pub fn is_extracted(&self) -> bool {
        !self.patch.value.is_zero()
    }

    /// Entries need non-zero addresses and a runtime-capture type to be
    /// usable by the extractor.
    pub fn is_valid(&self) -> bool {
        !self.func.is_zero()
            && !self.patch.eip.is_zero()
            && !self.patch.bp.is_zero()
            && (1..=4).contains(&self.patch.patch_type)
    }
}

impl Serialize for RecipeEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.func, &self.patch)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for RecipeEntry {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let map = BTreeMap::<Va, PatchSpec>::deserialize(deserializer)?;
        let (func, patch) = map
            .into_iter()
            .next()
            .ok_or_else(|| serde::de::Error::custom("empty recipe entry"))?;
        Ok(Self { func, patch })
    }
}

/// The whole recipe document. Field order matches the on-disk layout.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Recipe {
    #[serde(rename = "Init")]
    pub init: Va,
    #[serde(rename = "RegisterThread")]
    pub register_thread: Va,
    #[serde(rename = "Terminate")]
    pub terminate: Va,
    /// 1 for the legacy protection, 2 for modern.
    #[serde(rename = "Version")]
    pub version: u32,
    /// When set, the extractor relaunches the host after every capture.
    #[serde(rename = "ShouldRestart", default)]
    pub should_restart: bool,
    #[serde(rename = "ConstantOrStolen")]
    pub constant_or_stolen: Vec<RecipeEntry>,
    #[serde(rename = "Integrity", default)]
    pub integrity: Vec<Va>,
    #[serde(rename = "TestSecret", default)]
    pub test_secret: Vec<Va>,
}

impl Recipe {
    /// Number of entries whose value has not been captured yet.
    pub fn unextracted(&self) -> usize {
        self.constant_or_stolen
            .iter()
            .filter(|entry| !entry.is_extracted())
            .count()
    }

    /// Parse a recipe from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(Error::ParseError)
    }

    /// Serialize with four-space indentation.
    pub fn to_json(&self) -> String {
        let mut out = Vec::new();
        let formatter = PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut serializer)
            .expect("recipe serialization is infallible");
        String::from_utf8(out).expect("serde_json emits UTF-8")
    }
}

/// A recipe bound to its on-disk location.
pub struct RecipeFile {
    path: PathBuf,
    pub recipe: Recipe,
}

impl RecipeFile {
    /// Read and parse the recipe at `path`.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let text = fs::read_to_string(&path).map_err(Error::ReadError)?;
        let recipe = Recipe::from_json(&text)?;

        debug!(
            "loaded recipe from {} ({} entries, {} unextracted)",
            path.display(),
            recipe.constant_or_stolen.len(),
            recipe.unextracted()
        );

        Ok(Self { path, recipe })
    }

    /// Create a new recipe file in memory; written on first [`Self::save`].
    pub fn create(path: impl Into<PathBuf>, recipe: Recipe) -> Self {
        Self {
            path: path.into(),
            recipe,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Set the `Value` field of the entry at `index`.
    pub fn set_value(&mut self, index: usize, value: u32) {
        if let Some(entry) = self.recipe.constant_or_stolen.get_mut(index) {
            entry.patch.value = Va(value);
        }
    }

    /// Write the document back, surviving a process kill mid-save: the new
    /// content goes to a sibling file which then replaces the original.
    pub fn save(&self) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, self.recipe.to_json()).map_err(Error::WriteError)?;
        fs::rename(&tmp, &self.path).map_err(Error::WriteError)?;
        Ok(())
    }
}
