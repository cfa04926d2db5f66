//! # noceg
//!
//! Defeats the CEG per-copy executable protection on 32-bit Windows
//! binaries in three phases sharing one JSON recipe:
//!
//! 1. The **signatures** pass scans a protected binary for the protection's
//!    entry points and every protected function, classifies each one by its
//!    surrounding instruction pattern and records how to extract its runtime
//!    value.
//! 2. The **extractor** (this library built as a DLL and dropped in as the
//!    Steam API) runs inside the protected process, drives each protected
//!    stub to its finalization point with a breakpoint/trap-flag state
//!    machine and writes the captured values back into the recipe.
//! 3. The **patcher** rewrites each protected function's prologue so it
//!    returns its captured value directly.
//!
//! ## Usage as DLL
//!
//! Rename the original `steam_api.dll` to `steam_api_org.dll` and place the
//! built library next to it as `steam_api.dll`; all Steam API exports are
//! forwarded. Extraction starts automatically on attach, reading
//! `noceg.json` from the host executable's directory.

#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod analysis;
pub mod analyzer;
pub mod error;
pub mod handler;
pub mod patcher;
pub mod patterns;
pub mod pe;
pub mod recipe;
pub mod scanner;

#[cfg(target_os = "windows")]
pub mod breakpoint;
#[cfg(all(target_os = "windows", target_arch = "x86"))]
pub mod extract;
#[cfg(target_os = "windows")]
pub mod proxy;
#[cfg(target_os = "windows")]
pub mod restart;

pub use analysis::{analyze, AnalysisConfig, AnalysisReport, ProgressInfo, ProgressStage};
pub use analyzer::{ProtectedFunc, Variant};
pub use error::{Error, Result};
pub use patcher::{collect_targets, Patcher};
pub use pe::{PeImage, Va};
pub use recipe::{Recipe, RecipeFile};

// DLL entry point for Windows
#[cfg(all(target_os = "windows", target_arch = "x86"))]
#[no_mangle]
pub extern "system" fn DllMain(
    hinst_dll: *mut std::ffi::c_void,
    fdw_reason: u32,
    _lpv_reserved: *mut std::ffi::c_void,
) -> i32 {
    const DLL_PROCESS_ATTACH: u32 = 1;
    const DLL_PROCESS_DETACH: u32 = 0;

    match fdw_reason {
        DLL_PROCESS_ATTACH => on_attach(hinst_dll),
        DLL_PROCESS_DETACH => proxy::shutdown(),
        _ => {}
    }

    1 // TRUE
}

#[cfg(all(target_os = "windows", target_arch = "x86"))]
fn on_attach(hinst_dll: *mut std::ffi::c_void) {
    use std::sync::Once;

    use tracing::{error, info};
    use windows::Win32::Foundation::HMODULE;
    use windows::Win32::System::LibraryLoader::{DisableThreadLibraryCalls, GetModuleFileNameA};

    static ONCE: Once = Once::new();

    unsafe {
        let _ = DisableThreadLibraryCalls(HMODULE(hinst_dll));
    }

    configure_logging();
    info!("CEG resolver by iArtorias (https://github.com/iArtorias).");

    // Synchronize with a predecessor instance, then make the proxied API
    // available before the host calls into it.
    restart::wait_for_predecessor();
    proxy::initialize();

    ONCE.call_once(|| {
        let mut path = [0u8; 260];
        let length = unsafe { GetModuleFileNameA(None, &mut path) } as usize;
        if length == 0 {
            error!("could not obtain the full module path");
            std::process::exit(1);
        }

        let host = std::path::PathBuf::from(String::from_utf8_lossy(&path[..length]).into_owned());
        let recipe_path = host
            .parent()
            .map(|dir| dir.join("noceg.json"))
            .unwrap_or_else(|| "noceg.json".into());

        if let Err(err) = extract::Extractor::initialize(&recipe_path) {
            error!("failed to initialize the extractor: {err}");
            std::process::exit(1);
        }
    });
}

#[cfg(all(target_os = "windows", target_arch = "x86"))]
fn configure_logging() {
    let Ok(file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open("noceg.log")
    else {
        return;
    };

    let _ = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(file))
        .try_init();
}
