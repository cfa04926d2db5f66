//! Prologue rewriting of the protected binary.
//!
//! Consumes a recipe and the on-disk binary, overwriting every recorded
//! function with a direct return of its captured value (or a forced truthy
//! return for the protection's own helpers). A pure file-to-file transform;
//! the live process is never touched.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::Result;
use crate::pe::{PeImage, Va};
use crate::recipe::Recipe;

/// One location to rewrite.
#[derive(Clone, Debug)]
pub struct PatchTarget {
    /// Address the target was recorded under, for log lines.
    pub address: Va,
    /// Byte the patch is written at.
    pub prologue: Va,
    /// Patch template: 0 forces a truthy return, 1..=3 return the captured
    /// value, 4 jumps to it.
    pub patch_type: u32,
    /// Captured value; ignored for type 0.
    pub value: Va,
}

/// Gather every patch the recipe implies: the protected functions, the
/// `Init`/`Terminate` anchors and the integrity/test-secret helpers. The
/// first patch recorded for a given location wins.
pub fn collect_targets(recipe: &Recipe) -> Vec<PatchTarget> {
    let mut targets = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut push = |target: PatchTarget| {
        if seen.insert(target.prologue) {
            targets.push(target);
        }
    };

    let neutralize = |address: Va| PatchTarget {
        address,
        prologue: address,
        patch_type: 0,
        value: Va(0),
    };

    push(neutralize(recipe.init));
    push(neutralize(recipe.terminate));

    for entry in &recipe.constant_or_stolen {
        push(PatchTarget {
            address: entry.func,
            prologue: entry.patch.prologue,
            patch_type: entry.patch.patch_type,
            value: entry.patch.value,
        });
    }

    for &address in recipe.test_secret.iter().chain(&recipe.integrity) {
        push(neutralize(address));
    }

    targets
}

/// Applies patches to a loaded image.
pub struct Patcher {
    image: PeImage,
}

impl Patcher {
    pub fn new(image: PeImage) -> Self {
        Self { image }
    }

    /// Apply all targets, returning the number actually written. Individual
    /// failures are logged and skipped.
    pub fn apply(&mut self, targets: &[PatchTarget]) -> usize {
        targets
            .iter()
            .filter(|target| self.apply_one(target))
            .count()
    }

    fn apply_one(&mut self, target: &PatchTarget) -> bool {
        if target.prologue.0 < self.image.image_base() {
            return false;
        }

        let offset = self.image.va_to_file_offset(target.prologue) as usize;
        if offset == 0 || offset + 5 >= self.image.bytes().len() {
            warn!(
                "skipping patch at {}: unresolvable file offset",
                target.prologue
            );
            return false;
        }

        let bytes = self.image.bytes_mut();
        match target.patch_type {
            // mov al, 1; ret
            0 => {
                bytes[offset..offset + 3].copy_from_slice(&[0xB0, 0x01, 0xC3]);
            }
            // mov eax, value; ret
            1..=3 => {
                bytes[offset] = 0xB8;
                bytes[offset + 1..offset + 5].copy_from_slice(&target.value.0.to_le_bytes());
                bytes[offset + 5] = 0xC3;
            }
            // jmp value
            4 => {
                let rel = target.value.0.wrapping_sub(target.prologue.0.wrapping_add(5));
                bytes[offset] = 0xE9;
                bytes[offset + 1..offset + 5].copy_from_slice(&rel.to_le_bytes());
            }
            other => {
                warn!("skipping patch at {}: unknown type {other}", target.prologue);
                return false;
            }
        }

        debug!(
            "patched {} at file offset 0x{offset:x} (type {})",
            target.address, target.patch_type
        );
        true
    }

    /// Write the patched buffer to `<stem>_noceg.<ext>` beside the input.
    pub fn save(&self, original: &Path) -> Result<PathBuf> {
        let stem = original
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = original
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        let path = original.with_file_name(format!("{stem}_noceg{extension}"));
        std::fs::write(&path, self.image.bytes())?;
        Ok(path)
    }

    pub fn image(&self) -> &PeImage {
        &self.image
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::test_image;
    use crate::recipe::{PatchSpec, RecipeEntry};

    const IMAGE_BASE: u32 = 0x0040_0000;

    fn patcher(code_len: usize) -> Patcher {
        let image =
            PeImage::parse(test_image::build(IMAGE_BASE, &vec![0u8; code_len], false, false))
                .unwrap();
        Patcher::new(image)
    }

    fn target(prologue: u32, patch_type: u32, value: u32) -> PatchTarget {
        PatchTarget {
            address: Va(prologue),
            prologue: Va(prologue),
            patch_type,
            value: Va(value),
        }
    }

    #[test]
    fn test_constant_patch() {
        let mut patcher = patcher(0x100);
        // VA 0x00401010 -> file offset 0x410.
        let applied = patcher.apply(&[target(0x0040_1010, 1, 0xDEAD_BEEF)]);
        assert_eq!(applied, 1);

        let bytes = patcher.image().bytes();
        assert_eq!(
            &bytes[0x410..0x416],
            &[0xB8, 0xEF, 0xBE, 0xAD, 0xDE, 0xC3]
        );
    }

    #[test]
    fn test_truthy_patch() {
        let mut patcher = patcher(0x100);
        let applied = patcher.apply(&[target(0x0040_1020, 0, 0)]);
        assert_eq!(applied, 1);
        assert_eq!(&patcher.image().bytes()[0x420..0x423], &[0xB0, 0x01, 0xC3]);
    }

    #[test]
    fn test_relative_jump_patch() {
        // Large section so VA 0x00500000 resolves to file offset 0xFF400.
        let mut patcher = patcher(0xFF800);
        let applied = patcher.apply(&[target(0x0050_0000, 4, 0x0060_0000)]);
        assert_eq!(applied, 1);

        let bytes = patcher.image().bytes();
        assert_eq!(bytes[0xFF400], 0xE9);
        let rel = i32::from_le_bytes(bytes[0xFF401..0xFF405].try_into().unwrap());
        assert_eq!(rel, 0x000F_FFFB);
        // Decoding the written displacement lands back on the value.
        assert_eq!((0x0050_0000u32 + 5).wrapping_add(rel as u32), 0x0060_0000);
    }

    #[test]
    fn test_skips_unresolvable_offsets() {
        let mut patcher = patcher(0x100);
        let applied = patcher.apply(&[
            // Below the image base.
            target(0x1000, 1, 1),
            // Between sections: sentinel offset.
            target(0x0040_0800, 1, 1),
            // Too close to the end of the file.
            target(0x0040_10FD, 1, 1),
        ]);
        assert_eq!(applied, 0);
    }

    #[test]
    fn test_idempotence() {
        let targets = [
            target(0x0040_1000, 1, 0x1234_5678),
            target(0x0040_1040, 4, 0x0040_1000),
            target(0x0040_1080, 0, 0),
        ];

        let mut first = patcher(0x100);
        first.apply(&targets);
        let once = first.image().bytes().to_vec();

        first.apply(&targets);
        assert_eq!(first.image().bytes(), &once[..]);
    }

    #[test]
    fn test_collect_targets_order_and_dedup() {
        let recipe = Recipe {
            init: Va(0x0040_5000),
            register_thread: Va(0x0040_6000),
            terminate: Va(0x0040_7000),
            version: 2,
            should_restart: false,
            constant_or_stolen: vec![RecipeEntry {
                func: Va(0x0040_1000),
                patch: PatchSpec {
                    prologue: Va(0x0040_1000),
                    eip: Va(0x0040_1000),
                    bp: Va(0x0040_1010),
                    value: Va(0xCAFE_BABE),
                    patch_type: 1,
                },
            }],
            integrity: vec![Va(0x0040_8000), Va(0x0040_5000)],
            test_secret: vec![Va(0x0040_9000)],
        };

        let targets = collect_targets(&recipe);
        // Init appears once even though it is also listed under Integrity.
        assert_eq!(targets.len(), 5);
        assert_eq!(targets[0].prologue, Va(0x0040_5000));
        assert_eq!(targets[0].patch_type, 0);
        assert!(targets.iter().any(|t| t.prologue == Va(0x0040_1000) && t.patch_type == 1));
        // The register thread anchor is left alone.
        assert!(!targets.iter().any(|t| t.prologue == Va(0x0040_6000)));
    }
}
