//! In-process extraction of CEG values.
//!
//! Runs inside the protected process as a loaded library. The iteration loop
//! walks the recipe's `ConstantOrStolen` array in index order; for each
//! unextracted entry it arms the breakpoint, raises the custom exception and
//! lets the handler drive the protection stub to its finalization point. The
//! captured value is persisted before the index ever advances, so an
//! interrupted run resumes at the first entry whose value is still zero.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use tracing::{error, info, warn};
use windows::core::s;
use windows::Win32::System::Diagnostics::Debug::{
    AddVectoredExceptionHandler, RaiseException, CONTEXT,
};
use windows::Win32::System::Threading::ExitProcess;
use windows::Win32::UI::WindowsAndMessaging::{MessageBoxA, MB_ICONINFORMATION, MB_OK};

use crate::breakpoint::Breakpoint;
use crate::error::{Error, Result};
use crate::handler::{self, StateMachine, CUSTOM_EXCEPTION_CODE};
use crate::recipe::RecipeFile;
use crate::restart;

static INSTANCE: OnceLock<Extractor> = OnceLock::new();

/// The process-wide extractor instance, if initialization succeeded.
pub fn instance() -> Option<&'static Extractor> {
    INSTANCE.get()
}

/// All extraction state, owned by library initialization and reached by the
/// exception handler through [`instance`].
pub struct Extractor {
    machine: Mutex<StateMachine>,
    breakpoint: Mutex<Breakpoint>,
    recipe: Mutex<RecipeFile>,
    current_index: AtomicUsize,
    /// Anchor address, validated non-zero at initialize time.
    register_thread: u32,
    restart_pending: AtomicBool,
    saved_context: Mutex<Option<CONTEXT>>,
}

impl Extractor {
    /// Set up the extractor and hand control to the protection.
    ///
    /// Installs the vectored exception handler at head-of-chain, loads the
    /// recipe, refuses to run without the `Init` and `RegisterThread`
    /// anchors, then invokes `Init`. A truthy return starts the iteration
    /// loop, which does not come back on success.
    pub fn initialize(recipe_path: &Path) -> Result<()> {
        unsafe {
            AddVectoredExceptionHandler(1, Some(handler::ceg_exception_handler));
        }

        let file = RecipeFile::load(recipe_path)?;

        let init = file.recipe.init;
        if init.is_zero() {
            return Err(Error::InitFunctionNotFound);
        }

        let register_thread = file.recipe.register_thread;
        if register_thread.is_zero() {
            return Err(Error::RegisterThreadFunctionNotFound);
        }

        let extractor = Self {
            machine: Mutex::new(StateMachine::new()),
            breakpoint: Mutex::new(Breakpoint::new()),
            recipe: Mutex::new(file),
            current_index: AtomicUsize::new(0),
            register_thread: register_thread.0,
            restart_pending: AtomicBool::new(false),
            saved_context: Mutex::new(None),
        };

        let extractor = match INSTANCE.set(extractor) {
            Ok(()) => INSTANCE.get().expect("instance was just set"),
            Err(_) => {
                warn!("extractor already initialized");
                return Ok(());
            }
        };

        info!("calling CEG init at {init}");
        let init_fn: extern "system" fn() -> bool =
            unsafe { std::mem::transmute(init.0 as usize) };
        if init_fn() {
            extractor.process_entries();
        }

        Ok(())
    }

    /// Run a closure against the state machine.
    pub fn machine<R>(&self, f: impl FnOnce(&mut StateMachine) -> R) -> R {
        f(&mut self.machine.lock().expect("state machine poisoned"))
    }

    /// Snapshot the CPU context at the raise site so the protection's own
    /// control flow can be resumed after the capture.
    pub fn save_context(&self, ctx: &CONTEXT) {
        *self.saved_context.lock().expect("context poisoned") = Some(*ctx);
    }

    pub fn restart_pending(&self) -> bool {
        self.restart_pending.load(Ordering::SeqCst)
    }

    /// Walk the recipe from the current index and launch the next extraction.
    ///
    /// Raising the custom exception transfers control into the protection
    /// stub; the statement after the raise is only reached once the capture
    /// for that entry completed and the saved context was restored. Extracted
    /// entries are skipped on re-entry, which makes the loop idempotent.
    pub fn process_entries(&self) {
        let total = {
            let file = self.recipe.lock().expect("recipe poisoned");
            file.recipe.constant_or_stolen.len()
        };

        let start = self.current_index.load(Ordering::SeqCst);
        for index in start..total {
            let entry = {
                let file = self.recipe.lock().expect("recipe poisoned");
                file.recipe.constant_or_stolen[index].clone()
            };

            if entry.is_extracted() {
                continue;
            }
            if !entry.is_valid() {
                warn!("skipping invalid entry at index '{index}'");
                continue;
            }

            self.current_index.store(index, Ordering::SeqCst);
            info!(
                "processing entry '{index}': func {}, eip {}, bp {}",
                entry.func, entry.patch.eip, entry.patch.bp
            );

            self.machine(|machine| {
                machine.begin(entry.func.0, entry.patch.eip.0, entry.patch.bp.0)
            });
            self.breakpoint
                .lock()
                .expect("breakpoint poisoned")
                .arm(entry.patch.bp.0 as usize);

            // Legacy stolen functions run without thread registration; the
            // protection expects it before every other variant.
            if entry.patch.patch_type != 2 {
                self.call_register_thread();
            }

            unsafe {
                RaiseException(CUSTOM_EXCEPTION_CODE, 0, None);
            }
        }

        info!("all entries processed");
        unsafe {
            MessageBoxA(
                None,
                s!("Successfully finished the task!"),
                s!("NoCEG"),
                MB_OK | MB_ICONINFORMATION,
            );
            ExitProcess(1);
        }
    }

    fn call_register_thread(&self) {
        // Non-zero by the initialize-time anchor check.
        let register_thread: extern "system" fn() -> bool =
            unsafe { std::mem::transmute(self.register_thread as usize) };
        register_thread();
    }

    /// Breakpoint hit at the armed address: persist the captured value and
    /// either continue with the next entry or stage a process restart.
    pub fn capture(&self, ctx: &mut CONTEXT) {
        self.breakpoint
            .lock()
            .expect("breakpoint poisoned")
            .disarm();

        let value = ctx.Eax;
        info!("breakpoint hit, EAX value is '0x{value:08X}'");

        let index = self.current_index.load(Ordering::SeqCst);
        let should_restart = {
            let mut file = self.recipe.lock().expect("recipe poisoned");
            file.set_value(index, value);
            if let Err(err) = file.save() {
                warn!("failed to update an entry inside 'noceg.json': {err}");
            }
            file.recipe.should_restart
        };

        if should_restart {
            info!("setting the restart flag");
            self.restart_pending.store(true, Ordering::SeqCst);
            ctx.Eip = restart_and_exit as usize as u32;
            return;
        }

        if let Some(saved) = *self.saved_context.lock().expect("context poisoned") {
            *ctx = saved;
        }

        self.current_index.store(index + 1, Ordering::SeqCst);
        self.process_entries();
    }
}

/// Landing routine for the restart path. The handler points EIP here after a
/// capture; once the respawn is issued, falling off the end lands in an
/// invalid continuation and the illegal-instruction path performs the exit.
pub extern "system" fn restart_and_exit() {
    if let Some(extractor) = instance() {
        if extractor.restart_pending() {
            if let Err(err) = restart::self_restart() {
                error!("error restarting app: {err}");
            }
        }
    }
}
