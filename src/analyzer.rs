//! Instruction-level analysis of CEG call sites.
//!
//! Walks the code section one byte at a time, decoding a 32-bit instruction
//! at every offset, and classifies each call/jump/`mov eax, imm` whose target
//! is a known protected stub. The one-byte advance is deliberate: the
//! protection's call sites may sit inside other valid decodes, so advancing
//! by instruction length would miss them.

use std::collections::HashSet;

use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};
use tracing::debug;

use crate::patterns::{FINALIZE_CRC, STUB_SCAN_SIZE};
use crate::pe::{PeImage, Va};
use crate::scanner;

/// Classification of a protected function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Variant {
    /// Modern constant function: call site followed by `ret` or `mov`, or a
    /// short jump over the call.
    ConstantV2,
    /// Legacy stolen function dispatched through `call eax`.
    StolenV1,
    /// Stolen function dispatched through `jmp eax`.
    StolenV2,
    /// Modern stolen function patched at the enclosing caller's prologue.
    StolenV3,
}

impl Variant {
    /// Patch type recorded in the recipe.
    pub fn patch_type(self) -> u32 {
        match self {
            Variant::ConstantV2 => 1,
            Variant::StolenV1 => 2,
            Variant::StolenV2 => 3,
            Variant::StolenV3 => 4,
        }
    }

    /// Label used in console summaries.
    pub fn label(self) -> &'static str {
        match self {
            Variant::ConstantV2 => "(constant)",
            Variant::StolenV1 => "(stolen) (v1)",
            Variant::StolenV2 => "(stolen) (v2)",
            Variant::StolenV3 => "(stolen) (v3)",
        }
    }

    /// De-duplication priority; higher wins when the same target was
    /// classified more than once.
    fn rank(self) -> u8 {
        match self {
            Variant::ConstantV2 => 3,
            Variant::StolenV3 => 2,
            Variant::StolenV1 => 1,
            Variant::StolenV2 => 0,
        }
    }
}

/// One classified protected function, all addresses in image space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtectedFunc {
    /// Start of the protected stub.
    pub func: Va,
    /// Byte the patcher overwrites. Differs from `func` only for
    /// [`Variant::StolenV3`], where it is the enclosing caller's prologue.
    pub prologue: Va,
    /// Address execution is redirected to during extraction.
    pub eip: Va,
    /// Address of the software breakpoint that captures the result. Zero when
    /// no finalize-CRC landmark was found.
    pub bp: Va,
    pub variant: Variant,
}

/// Output of one analysis pass.
pub struct AnalyzerOutput {
    pub records: Vec<ProtectedFunc>,
    /// First call target that matched a register-thread candidate.
    pub register_thread: Option<Va>,
}

/// Decode a single instruction at `offset`, with branch targets expressed as
/// code-section offsets.
fn decode_at(code: &[u8], offset: usize) -> Option<Instruction> {
    if offset >= code.len() {
        return None;
    }

    let mut decoder = Decoder::with_ip(32, &code[offset..], offset as u64, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return None;
    }

    let instruction = decoder.decode();
    (!instruction.is_invalid()).then_some(instruction)
}

/// Analyzer over one code section.
pub struct Analyzer<'a> {
    image: &'a PeImage,
    code: &'a [u8],
    legacy: bool,
    protected: HashSet<usize>,
    register_thread_candidates: HashSet<usize>,
    register_thread: Option<usize>,
    records: Vec<ProtectedFunc>,
}

impl<'a> Analyzer<'a> {
    /// Create an analyzer. `protected` and `register_thread_candidates` are
    /// code-section offsets produced by the signature scans.
    pub fn new(
        image: &'a PeImage,
        legacy: bool,
        protected: HashSet<usize>,
        register_thread_candidates: HashSet<usize>,
    ) -> Self {
        Self {
            image,
            code: image.code(),
            legacy,
            protected,
            register_thread_candidates,
            register_thread: None,
            records: Vec::new(),
        }
    }

    /// Run the pass. `progress` receives `(bytes_done, bytes_total)`.
    pub fn run(mut self, mut progress: impl FnMut(usize, usize)) -> AnalyzerOutput {
        let total = self.code.len();

        for offset in 0..total {
            if offset % 0x1_0000 == 0 {
                progress(offset, total);
            }

            let Some(instruction) = decode_at(self.code, offset) else {
                continue;
            };

            let Some(target) = self.call_target(&instruction) else {
                continue;
            };

            if self.register_thread.is_none()
                && !self.register_thread_candidates.is_empty()
                && self.register_thread_candidates.contains(&target)
            {
                debug!(
                    "register thread anchor at {}",
                    self.image.code_offset_to_va(target)
                );
                self.register_thread = Some(target);
            }

            if self.protected.contains(&target) {
                self.classify(offset, target);
            }
        }

        progress(total, total);

        AnalyzerOutput {
            records: dedup(self.records),
            register_thread: self.register_thread.map(|o| self.image.code_offset_to_va(o)),
        }
    }

    /// Extract the target offset of the instruction shapes of interest:
    /// `call imm`, `jmp imm`, and `mov eax, imm32` (where the immediate is an
    /// image VA).
    fn call_target(&self, instruction: &Instruction) -> Option<usize> {
        match instruction.mnemonic() {
            Mnemonic::Call | Mnemonic::Jmp
                if instruction.op0_kind() == OpKind::NearBranch32 =>
            {
                Some(instruction.near_branch_target() as usize)
            }
            Mnemonic::Mov
                if instruction.op0_kind() == OpKind::Register
                    && instruction.op0_register() == Register::EAX
                    && instruction.op1_kind() == OpKind::Immediate32 =>
            {
                self.image.va_to_code_offset(Va(instruction.immediate32()))
            }
            _ => None,
        }
    }

    /// Classify one call site whose target is a protected stub.
    ///
    /// The protection's calls are always 5-byte near forms, so the byte after
    /// the call sits at `call_site + 5`.
    fn classify(&mut self, call_site: usize, target: usize) {
        let next = call_site + 5;
        if next + 2 > self.code.len() {
            return;
        }

        if self.legacy {
            self.classify_legacy(call_site, target, next);
        } else {
            let bp = self.find_finalize_crc(target);
            self.classify_modern(call_site, target, next, bp);
        }
    }

    /// Locate the finalize-CRC sub-routine inside the stub and derive the
    /// breakpoint address from the matched pattern's offset. First matching
    /// pattern wins.
    fn find_finalize_crc(&self, target: usize) -> Option<usize> {
        let end = (target + STUB_SCAN_SIZE).min(self.code.len());
        let window = &self.code[target..end];

        FINALIZE_CRC.iter().find_map(|(pattern, offset)| {
            scanner::find_first(pattern, window).map(|hit| target + hit + *offset as usize)
        })
    }

    fn classify_modern(&mut self, call_site: usize, target: usize, next: usize, bp: Option<usize>) {
        let func = self.image.code_offset_to_va(target);
        let eip = self.image.code_offset_to_va(call_site);
        let bp = bp.map(|o| self.image.code_offset_to_va(o)).unwrap_or_default();

        let (variant, prologue) = match (self.code[next], self.code[next + 1]) {
            (0xC3, _) | (0x89, _) => (Variant::ConstantV2, func),
            (0xFF, 0xE0) => (Variant::StolenV2, func),
            _ if self.code[call_site] == 0xEB => (Variant::ConstantV2, func),
            _ => {
                let prologue = self
                    .find_prologue(call_site)
                    .map(|o| self.image.code_offset_to_va(o))
                    .unwrap_or(func);
                (Variant::StolenV3, prologue)
            }
        };

        self.records.push(ProtectedFunc {
            func,
            prologue,
            eip,
            bp,
            variant,
        });
    }

    fn classify_legacy(&mut self, call_site: usize, target: usize, next: usize) {
        let func = self.image.code_offset_to_va(target);
        let bp = self.image.code_offset_to_va(next + 2);

        match (self.code[next], self.code[next + 1]) {
            // call eax
            (0xFF, 0xD0) => {
                // A push ecx right before the call belongs to the stub's
                // calling sequence and must be replayed.
                let eip = if call_site > 0 && self.code[call_site - 1] == 0x51 {
                    call_site - 1
                } else {
                    call_site
                };

                self.records.push(ProtectedFunc {
                    func,
                    prologue: func,
                    eip: self.image.code_offset_to_va(eip),
                    bp,
                    variant: Variant::StolenV1,
                });
            }
            // jmp eax
            (0xFF, 0xE0) => {
                self.records.push(ProtectedFunc {
                    func,
                    prologue: func,
                    eip: self.image.code_offset_to_va(call_site),
                    bp,
                    variant: Variant::StolenV2,
                });
            }
            _ => {}
        }
    }

    /// Scan backwards from the call site for the enclosing function's
    /// `push ebp; mov ebp, esp` prologue.
    fn find_prologue(&self, call_site: usize) -> Option<usize> {
        let start = call_site.saturating_sub(STUB_SCAN_SIZE);

        for offset in (start..call_site).rev() {
            let Some(push) = decode_at(self.code, offset) else {
                continue;
            };

            if push.mnemonic() != Mnemonic::Push
                || push.op0_kind() != OpKind::Register
                || push.op0_register() != Register::EBP
            {
                continue;
            }

            if let Some(mov) = decode_at(self.code, offset + push.len()) {
                if mov.mnemonic() == Mnemonic::Mov
                    && mov.op0_kind() == OpKind::Register
                    && mov.op1_kind() == OpKind::Register
                    && mov.op0_register() == Register::EBP
                    && mov.op1_register() == Register::ESP
                {
                    return Some(offset);
                }
            }
        }

        None
    }
}

/// Collapse duplicate classifications.
///
/// Records are grouped by `func`; the variant with the highest priority wins
/// and every record of the winning variant is kept (a StolenV3 target can be
/// reached from several call sites, each with its own prologue to patch).
/// Identical records collapse to one.
pub fn dedup(records: Vec<ProtectedFunc>) -> Vec<ProtectedFunc> {
    use std::collections::HashMap;

    let mut winner: HashMap<Va, Variant> = HashMap::new();
    for record in &records {
        winner
            .entry(record.func)
            .and_modify(|variant| {
                if record.variant.rank() > variant.rank() {
                    *variant = record.variant;
                }
            })
            .or_insert(record.variant);
    }

    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| {
            record.variant == winner[&record.func]
                && seen.insert((record.func, record.prologue, record.eip, record.bp))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::{test_image, PeImage};

    const IMAGE_BASE: u32 = 0x0040_0000;

    fn image_with_code(code: Vec<u8>) -> PeImage {
        PeImage::parse(test_image::build(IMAGE_BASE, &code, false, false)).unwrap()
    }

    fn analyze(
        image: &PeImage,
        legacy: bool,
        protected: &[usize],
        candidates: &[usize],
    ) -> AnalyzerOutput {
        Analyzer::new(
            image,
            legacy,
            protected.iter().copied().collect(),
            candidates.iter().copied().collect(),
        )
        .run(|_, _| {})
    }

    /// Place the first finalize-CRC shape at `at`, with concrete filler for
    /// the wildcard positions.
    fn write_finalize_crc(code: &mut [u8], at: usize) {
        let bytes = [
            0xE8, 0x00, 0x00, 0x00, 0x00, // call
            0x8D, 0x44, 0x24, 0x10, 0x90, 0x90, // lea + filler
            0xE8, 0x00, 0x00, 0x00, 0x00, // call
            0x8B, 0x0D, 0x00, 0x00, 0x00, 0x00, // mov ecx, [global]
            0x8B, // mov ...
        ];
        code[at..at + bytes.len()].copy_from_slice(&bytes);
    }

    #[test]
    fn test_constant_v2_classification() {
        let mut code = vec![0u8; 0x200];
        // call stub; ret
        code[0..5].copy_from_slice(&[0xE8, 0x06, 0x00, 0x00, 0x00]);
        code[5] = 0xC3;
        // Finalize-CRC landmark inside the stub; pattern offset 16 puts the
        // breakpoint 40 bytes into the stub.
        write_finalize_crc(&mut code, 0x0B + 24);

        let image = image_with_code(code);
        let out = analyze(&image, false, &[0x0B], &[]);

        assert_eq!(out.records.len(), 1);
        let record = &out.records[0];
        assert_eq!(record.variant, Variant::ConstantV2);
        assert_eq!(record.func, Va(0x0040_100B));
        assert_eq!(record.prologue, Va(0x0040_100B));
        assert_eq!(record.eip, Va(0x0040_1000));
        assert_eq!(record.bp, Va(0x0040_1033));
    }

    #[test]
    fn test_stolen_v1_legacy_classification() {
        let mut code = vec![0u8; 0x200];
        // push ecx; call stub; call eax
        code[0x100..0x108]
            .copy_from_slice(&[0x51, 0xE8, 0x04, 0x00, 0x00, 0x00, 0xFF, 0xD0]);

        let image = image_with_code(code);
        let out = analyze(&image, true, &[0x10A], &[]);

        assert_eq!(out.records.len(), 1);
        let record = &out.records[0];
        assert_eq!(record.variant, Variant::StolenV1);
        assert_eq!(record.func, Va(0x0040_110A));
        assert_eq!(record.eip, Va(0x0040_1100), "push ecx is part of the call sequence");
        assert_eq!(record.bp, Va(0x0040_1108));
    }

    #[test]
    fn test_stolen_v1_without_push_ecx() {
        let mut code = vec![0u8; 0x200];
        // call stub; call eax (no preceding push ecx)
        code[0x100..0x107]
            .copy_from_slice(&[0xE8, 0x05, 0x00, 0x00, 0x00, 0xFF, 0xD0]);

        let image = image_with_code(code);
        let out = analyze(&image, true, &[0x10A], &[]);

        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].eip, Va(0x0040_1100));
    }

    #[test]
    fn test_stolen_v3_backward_prologue() {
        let mut code = vec![0u8; 0x200];
        // Enclosing caller's prologue, 64 bytes before the call site.
        code[0x40..0x43].copy_from_slice(&[0x55, 0x8B, 0xEC]);
        // call stub; nop (none of the special shapes)
        code[0x80..0x85].copy_from_slice(&[0xE8, 0x7B, 0x00, 0x00, 0x00]);
        code[0x85] = 0x90;

        let image = image_with_code(code);
        let out = analyze(&image, false, &[0x100], &[]);

        assert_eq!(out.records.len(), 1);
        let record = &out.records[0];
        assert_eq!(record.variant, Variant::StolenV3);
        assert_eq!(record.func, Va(0x0040_1100));
        assert_eq!(record.prologue, Va(0x0040_1040));
        assert_eq!(record.eip, Va(0x0040_1080));
    }

    #[test]
    fn test_jmp_eax_modern_is_stolen_v2() {
        let mut code = vec![0u8; 0x200];
        code[0x10..0x15].copy_from_slice(&[0xE8, 0x6B, 0x00, 0x00, 0x00]);
        code[0x15..0x17].copy_from_slice(&[0xFF, 0xE0]);
        write_finalize_crc(&mut code, 0x80);

        let image = image_with_code(code);
        let out = analyze(&image, false, &[0x80], &[]);

        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].variant, Variant::StolenV2);
    }

    #[test]
    fn test_register_thread_anchor_first_occurrence() {
        let mut code = vec![0u8; 0x200];
        // Two calls to candidate offsets; only the first becomes the anchor.
        code[0x00..0x05].copy_from_slice(&[0xE8, 0xFB, 0x00, 0x00, 0x00]); // -> 0x100
        code[0x10..0x15].copy_from_slice(&[0xE8, 0x3B, 0x01, 0x00, 0x00]); // -> 0x150

        let image = image_with_code(code);
        let out = analyze(&image, false, &[], &[0x100, 0x150]);

        assert_eq!(out.register_thread, Some(Va(0x0040_1100)));
    }

    #[test]
    fn test_mov_eax_immediate_target() {
        let mut code = vec![0u8; 0x200];
        // mov eax, 0x00401100; the immediate is an image VA.
        code[0x20] = 0xB8;
        code[0x21..0x25].copy_from_slice(&0x0040_1100u32.to_le_bytes());
        code[0x25..0x27].copy_from_slice(&[0xFF, 0xE0]);

        let image = image_with_code(code);
        let out = analyze(&image, true, &[0x100], &[]);

        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].variant, Variant::StolenV2);
        assert_eq!(out.records[0].func, Va(0x0040_1100));
    }

    #[test]
    fn test_dedup_priority_and_totality() {
        let record = |func: u32, variant| ProtectedFunc {
            func: Va(func),
            prologue: Va(func),
            eip: Va(func + 0x10),
            bp: Va(func + 0x20),
            variant,
        };

        let records = vec![
            record(0x1000, Variant::StolenV2),
            record(0x1000, Variant::ConstantV2),
            record(0x2000, Variant::StolenV2),
            record(0x3000, Variant::StolenV3),
            record(0x3000, Variant::StolenV2),
            // Same target, same variant, distinct prologue: both kept.
            ProtectedFunc {
                prologue: Va(0x3100),
                ..record(0x3000, Variant::StolenV3)
            },
        ];

        let deduped = dedup(records);

        // Each func maps to exactly one variant.
        for func in [0x1000u32, 0x2000, 0x3000] {
            let variants: HashSet<Variant> = deduped
                .iter()
                .filter(|r| r.func == Va(func))
                .map(|r| r.variant)
                .collect();
            assert_eq!(variants.len(), 1, "func 0x{func:x} in more than one variant");
        }

        assert!(deduped
            .iter()
            .any(|r| r.func == Va(0x1000) && r.variant == Variant::ConstantV2));
        assert!(deduped
            .iter()
            .any(|r| r.func == Va(0x2000) && r.variant == Variant::StolenV2));
        assert_eq!(
            deduped
                .iter()
                .filter(|r| r.func == Va(0x3000) && r.variant == Variant::StolenV3)
                .count(),
            2
        );
    }
}
