//! The full signature pass over a protected binary.
//!
//! Ties the scanner and the instruction analyzer together: detects the
//! protection generation, locates the anchor routines, classifies every
//! protected function and assembles the recipe document.

use std::collections::HashSet;

use tracing::{info, warn};

use crate::analyzer::{Analyzer, ProtectedFunc};
use crate::patterns;
use crate::pe::{PeImage, Va};
use crate::recipe::{PatchSpec, Recipe, RecipeEntry};
use crate::scanner;

/// Progress stage during the analysis pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressStage {
    ScanningSignatures,
    AnalyzingCode,
    Complete,
}

impl ProgressStage {
    /// Get a human-readable name for the stage.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ScanningSignatures => "Scanning signatures",
            Self::AnalyzingCode => "Analyzing code",
            Self::Complete => "Complete",
        }
    }
}

/// Progress information during analysis.
#[derive(Clone, Debug)]
pub struct ProgressInfo {
    pub stage: ProgressStage,
    /// Bytes processed within the current stage.
    pub current: usize,
    pub total: usize,
}

/// Progress callback type.
pub type ProgressCallback = Box<dyn Fn(&ProgressInfo) + Send + Sync>;

/// Configuration for the analysis pass.
#[derive(Default)]
pub struct AnalysisConfig {
    pub progress_callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for AnalysisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisConfig")
            .field("progress_callback", &self.progress_callback.is_some())
            .finish()
    }
}

/// Result of the analysis pass.
pub struct AnalysisReport {
    pub recipe: Recipe,
    pub legacy: bool,
}

impl AnalysisReport {
    /// Number of distinct protected functions recorded with the given patch
    /// type.
    pub fn unique_funcs(&self, patch_type: u32) -> usize {
        self.recipe
            .constant_or_stolen
            .iter()
            .filter(|entry| entry.patch.patch_type == patch_type)
            .map(|entry| entry.func)
            .collect::<HashSet<_>>()
            .len()
    }
}

/// Run the whole signature pass over a loaded image.
pub fn analyze(image: &PeImage, config: &AnalysisConfig) -> AnalysisReport {
    let code = image.code();
    let report = |info: &ProgressInfo| {
        if let Some(callback) = &config.progress_callback {
            callback(info);
        }
    };

    report(&ProgressInfo {
        stage: ProgressStage::ScanningSignatures,
        current: 0,
        total: code.len(),
    });

    // The legacy trampoline only ever sits at the very top of the section.
    let window = &code[..patterns::LEGACY_MARKER_WINDOW.min(code.len())];
    let legacy = scanner::find_first(patterns::LEGACY_MARKER, window).is_some();
    if legacy {
        warn!("older CEG version found");
    }

    let init = find_anchor(image, patterns::INIT_PATTERNS, code, "init");
    let terminate = find_anchor(image, patterns::TERMINATE_PATTERNS, code, "terminate");

    let register_thread_candidates = find_all_offsets(patterns::REGISTER_THREAD_PATTERNS, code);
    let protected = find_all_offsets(patterns::PROTECT_PATTERNS, code);
    info!(
        "{} protected stub candidates, {} register thread candidates",
        protected.len(),
        register_thread_candidates.len()
    );

    let output = Analyzer::new(image, legacy, protected, register_thread_candidates).run(
        |current, total| {
            report(&ProgressInfo {
                stage: ProgressStage::AnalyzingCode,
                current,
                total,
            });
        },
    );

    if let Some(register_thread) = output.register_thread {
        info!("found CEG register thread function: {register_thread}");
    }

    let integrity = find_all_vas(image, patterns::INTEGRITY_PATTERNS, code);
    let test_secret = find_all_vas(image, patterns::TEST_SECRET_PATTERNS, code);

    let recipe = Recipe {
        init,
        register_thread: output.register_thread.unwrap_or_default(),
        terminate,
        version: if legacy { 1 } else { 2 },
        should_restart: false,
        constant_or_stolen: entries_from_records(output.records),
        integrity,
        test_secret,
    };

    report(&ProgressInfo {
        stage: ProgressStage::Complete,
        current: code.len(),
        total: code.len(),
    });

    AnalysisReport { recipe, legacy }
}

/// First hit over a pattern set, converted to an image VA; the zero sentinel
/// when nothing matched.
fn find_anchor(image: &PeImage, pattern_set: &[&str], code: &[u8], what: &str) -> Va {
    match scanner::find_first_of(pattern_set, code) {
        Some(offset) => {
            let va = image.code_offset_to_va(offset);
            info!("found CEG {what} function: {va}");
            va
        }
        None => {
            warn!("CEG {what} function not found");
            Va(0)
        }
    }
}

fn find_all_offsets(pattern_set: &[&str], code: &[u8]) -> HashSet<usize> {
    pattern_set
        .iter()
        .flat_map(|pattern| scanner::find_all(pattern, code))
        .collect()
}

fn find_all_vas(image: &PeImage, pattern_set: &[&str], code: &[u8]) -> Vec<Va> {
    let mut vas: Vec<Va> = find_all_offsets(pattern_set, code)
        .into_iter()
        .map(|offset| image.code_offset_to_va(offset))
        .collect();
    vas.sort();
    vas
}

/// Order records by patch type then address and strip them down to recipe
/// entries.
fn entries_from_records(mut records: Vec<ProtectedFunc>) -> Vec<RecipeEntry> {
    records.sort_by_key(|record| (record.variant.patch_type(), record.func, record.prologue));

    records
        .into_iter()
        .map(|record| RecipeEntry {
            func: record.func,
            patch: PatchSpec {
                prologue: record.prologue,
                eip: record.eip,
                bp: record.bp,
                value: Va(0),
                patch_type: record.variant.patch_type(),
            },
        })
        .collect()
}
