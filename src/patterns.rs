//! Byte signatures for the CEG protection family.
//!
//! All patterns are in the wildcarded text form consumed by
//! [`crate::scanner`]. Sets with multiple entries cover the variations the
//! protection shipped over the years; order matters where a first-match rule
//! applies.

/// Marker distinguishing the legacy protection: a `push ecx; mov eax, imm;
/// call eax; pop ecx; jmp eax` trampoline placed at the very top of the code
/// section.
pub const LEGACY_MARKER: &str = "51 B8 ?? ?? ?? ?? FF D0 59 FF E0";

/// Window at the start of the code section searched for [`LEGACY_MARKER`].
pub const LEGACY_MARKER_WINDOW: usize = 0x20;

/// Bytes scanned inside a protected stub (and backwards from a call site)
/// when looking for landmarks.
pub const STUB_SCAN_SIZE: usize = 300;

/// Finalize-CRC sub-routine shapes, paired with the offset from the match to
/// the instruction where a breakpoint captures the computed value in `eax`.
///
/// Each shape is a `call` into the hashing helper followed by a `lea` of
/// varying width, a second `call`, and either the `mov ecx, [global]; mov`
/// tail or a `pop edi` epilogue. The first matching shape wins.
pub const FINALIZE_CRC: [(&str, u32); 6] = [
    ("E8 ?? ?? ?? ?? 8D ?? ?? ?? ?? ?? E8 ?? ?? ?? ?? 8B 0D ?? ?? ?? ?? 8B", 16),
    ("E8 ?? ?? ?? ?? 8D ?? ?? E8 ?? ?? ?? ?? 8B 0D ?? ?? ?? ?? 8B", 13),
    ("E8 ?? ?? ?? ?? 8D ?? ?? ?? E8 ?? ?? ?? ?? 8B 0D ?? ?? ?? ?? 8B", 14),
    ("E8 ?? ?? ?? ?? 8D ?? ?? E8 ?? ?? ?? ?? 5F", 13),
    ("E8 ?? ?? ?? ?? 8D ?? ?? ?? ?? ?? E8 ?? ?? ?? ?? 5F", 16),
    ("E8 ?? ?? ?? ?? 8D ?? ?? ?? E8 ?? ?? ?? ?? 5F", 14),
];

/// Entry of the protection's one-time initialization routine. The newer
/// toolchain emits a full SEH frame with the security cookie; the older one a
/// plain frame with a guarded flag check.
pub const INIT_PATTERNS: &[&str] = &[
    "55 8B EC 6A FF 68 ?? ?? ?? ?? 64 A1 00 00 00 00 50 83 EC ?? A1 ?? ?? ?? ?? 33 C5 50 8D 45 F4",
    "55 8B EC 83 EC ?? 80 3D ?? ?? ?? ?? 00 75 ?? 56 E8 ?? ?? ?? ?? 8B F0 85 F6",
];

/// Entry of the protection's terminate routine.
pub const TERMINATE_PATTERNS: &[&str] = &[
    "55 8B EC 83 EC ?? A1 ?? ?? ?? ?? 33 C5 89 45 FC 56 E8 ?? ?? ?? ?? 8B F0 85 F6 74",
    "55 8B EC 80 3D ?? ?? ?? ?? 00 74 ?? 6A 00 E8 ?? ?? ?? ?? 83 C4 04",
];

/// Entry of the per-thread registration helper. Both shapes start by pulling
/// the TEB thread id out of `fs:`.
pub const REGISTER_THREAD_PATTERNS: &[&str] = &[
    "55 8B EC 51 64 A1 24 00 00 00 8B 0D ?? ?? ?? ?? 3B C1 74",
    "64 A1 24 00 00 00 56 8B 35 ?? ?? ?? ?? 3B C6 75",
];

/// Entry shapes of protected stubs. The protection copies one of these
/// prologues into every per-copy stub it emits.
pub const PROTECT_PATTERNS: &[&str] = &[
    "55 8B EC 83 EC ?? 53 56 57 8B 3D ?? ?? ?? ?? 85 FF 0F 84 ?? ?? ?? ??",
    "55 8B EC 81 EC ?? ?? 00 00 53 56 8B 35 ?? ?? ?? ?? 57 85 F6 74 ??",
];

/// Integrity-check helpers. Never executed by the extractor; the patcher
/// forces them truthy.
pub const INTEGRITY_PATTERNS: &[&str] = &[
    "55 8B EC 81 EC ?? ?? 00 00 A1 ?? ?? ?? ?? 33 C5 89 45 FC 53 8B 5D 08 56 57",
];

/// Test-secret helpers, same treatment as the integrity checks.
pub const TEST_SECRET_PATTERNS: &[&str] = &[
    "55 8B EC 83 EC ?? A1 ?? ?? ?? ?? 33 C5 89 45 ?? 56 57 6A ?? 8D 45 ?? 50",
];
