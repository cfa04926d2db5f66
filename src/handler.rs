//! The extraction state machine and its exception handler.
//!
//! Extraction drives the protection through a raised software exception: the
//! handler redirects the instruction pointer into the stub, verifies arrival
//! with a single step, and captures the computed value when the armed
//! breakpoint fires. The machine itself is platform-neutral; only the
//! vectored handler that feeds it OS exception codes is Windows-specific.

/// Exception code used as the rendezvous between the iteration loop and the
/// handler. One code at both the raise site and the check.
pub const CUSTOM_EXCEPTION_CODE: u32 = 0xCEAD_DEAD;

/// x86 EFlags trap flag.
pub const TRAP_FLAG: u32 = 0x100;

/// Where the extraction currently stands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    /// Breakpoint armed, custom exception not yet seen.
    AwaitingRedirect,
    /// Instruction pointer moved into the stub; waiting for the single step
    /// to confirm it arrived.
    AwaitingStepVerify,
    /// Stub running; waiting for the breakpoint at its finalization point.
    AwaitingBreakpointHit,
}

/// What the exception handler should do with the current event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Move the instruction pointer to `to` and set the trap flag.
    Redirect { to: u32 },
    /// The stub was entered as expected; clear the trap flag.
    ClearTrap,
    /// Not ours to act on, but execution continues.
    Continue,
    /// The breakpoint fired at the armed address; capture the accumulator.
    Capture,
    /// Decline the exception to the next handler.
    Decline,
}

/// Extraction state for one entry.
#[derive(Debug, Default)]
pub struct StateMachine {
    phase: Phase,
    /// Start of the protected stub; single-step verification address.
    pub target: u32,
    /// Address the instruction pointer is redirected to.
    pub redirect: u32,
    /// Armed breakpoint address.
    pub breakpoint: u32,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Stage the addresses for the next entry.
    pub fn begin(&mut self, target: u32, redirect: u32, breakpoint: u32) {
        self.target = target;
        self.redirect = redirect;
        self.breakpoint = breakpoint;
        self.phase = Phase::AwaitingRedirect;
    }

    /// The custom exception arrived: redirect into the stub.
    pub fn on_custom_exception(&mut self) -> Decision {
        self.phase = Phase::AwaitingStepVerify;
        Decision::Redirect { to: self.redirect }
    }

    /// A single step fired. Only the step that lands on the stub entry
    /// matters; everything else is passed through untouched.
    pub fn on_single_step(&mut self, eip: u32) -> Decision {
        if self.phase == Phase::AwaitingStepVerify && eip == self.target {
            self.phase = Phase::AwaitingBreakpointHit;
            Decision::ClearTrap
        } else {
            Decision::Continue
        }
    }

    /// A breakpoint fired. Ours iff it is at the armed address.
    pub fn on_breakpoint(&mut self, eip: u32) -> Decision {
        if self.breakpoint != 0 && eip == self.breakpoint {
            self.phase = Phase::Idle;
            Decision::Capture
        } else {
            Decision::Decline
        }
    }
}

#[cfg(all(target_os = "windows", target_arch = "x86"))]
pub use veh::ceg_exception_handler;

#[cfg(all(target_os = "windows", target_arch = "x86"))]
mod veh {
    use tracing::{info, warn};
    use windows::Win32::System::Diagnostics::Debug::EXCEPTION_POINTERS;
    use windows::Win32::System::Threading::ExitProcess;

    use super::{Decision, CUSTOM_EXCEPTION_CODE, TRAP_FLAG};
    use crate::extract;

    const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
    const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

    const EXCEPTION_BREAKPOINT: u32 = 0x8000_0003;
    const EXCEPTION_SINGLE_STEP: u32 = 0x8000_0004;
    const EXCEPTION_ILLEGAL_INSTRUCTION: u32 = 0xC000_001D;

    /// The vectored exception handler, registered at head-of-chain.
    pub unsafe extern "system" fn ceg_exception_handler(
        exception_info: *mut EXCEPTION_POINTERS,
    ) -> i32 {
        let Some(extractor) = extract::instance() else {
            return EXCEPTION_CONTINUE_SEARCH;
        };

        let ctx = &mut *(*exception_info).ContextRecord;
        let code = (*(*exception_info).ExceptionRecord).ExceptionCode.0 as u32;

        match code {
            CUSTOM_EXCEPTION_CODE => {
                info!("custom exception reached '0x{CUSTOM_EXCEPTION_CODE:08X}'");

                extractor.save_context(ctx);
                let decision = extractor.machine(|machine| machine.on_custom_exception());
                if let Decision::Redirect { to } = decision {
                    info!("changing EIP to '0x{to:08X}'");
                    ctx.Eip = to;
                    ctx.EFlags |= TRAP_FLAG;
                }

                EXCEPTION_CONTINUE_EXECUTION
            }

            EXCEPTION_SINGLE_STEP => {
                let decision = extractor.machine(|machine| machine.on_single_step(ctx.Eip));
                if decision == Decision::ClearTrap {
                    info!("target CEG function reached '0x{:08X}'", ctx.Eip);
                    ctx.EFlags &= !TRAP_FLAG;
                }

                EXCEPTION_CONTINUE_EXECUTION
            }

            EXCEPTION_BREAKPOINT => {
                let decision = extractor.machine(|machine| machine.on_breakpoint(ctx.Eip));
                if decision == Decision::Capture {
                    extractor.capture(ctx);
                    EXCEPTION_CONTINUE_EXECUTION
                } else {
                    EXCEPTION_CONTINUE_SEARCH
                }
            }

            EXCEPTION_ILLEGAL_INSTRUCTION => {
                if extractor.restart_pending() {
                    warn!("caught an illegal instruction, forcing exit");
                    ExitProcess(1);
                }

                EXCEPTION_CONTINUE_SEARCH
            }

            _ => EXCEPTION_CONTINUE_SEARCH,
        }
    }
}
