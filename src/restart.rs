//! Singleton-mutex-guarded process respawn.
//!
//! Some protection stubs cannot resume cleanly after running in-process, so
//! the extractor can relaunch the host executable and let the next iteration
//! happen in a fresh process. The named mutex serializes successive
//! instances: a new process waits on it before touching the recipe.

use tracing::info;
use windows::core::{s, PCSTR, PSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows::Win32::System::LibraryLoader::GetModuleFileNameA;
use windows::Win32::System::Threading::{
    CreateMutexA, CreateProcessA, ReleaseMutex, WaitForSingleObject, INFINITE,
    PROCESS_CREATION_FLAGS, PROCESS_INFORMATION, STARTUPINFOA,
};

use crate::error::{Error, Result};

/// Closes the wrapped handle when dropped.
struct HandleGuard(HANDLE);

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }
}

/// Spawn a fresh copy of the host executable, holding `Global\NoCEG` for the
/// duration so two extractors never race on the same recipe.
pub fn self_restart() -> Result<()> {
    unsafe {
        let mutex = CreateMutexA(None, false, s!("Global\\NoCEG"))
            .map_err(|_| Error::MutexCreateFailed)?;
        let _mutex_guard = HandleGuard(mutex);

        if WaitForSingleObject(mutex, 0) != WAIT_OBJECT_0 {
            return Err(Error::MutexCreateFailed);
        }

        let mut path = [0u8; 260];
        let length = GetModuleFileNameA(None, &mut path) as usize;
        if length == 0 {
            let _ = ReleaseMutex(mutex);
            return Err(Error::GetModuleNameFailed);
        }

        let startup = STARTUPINFOA {
            cb: std::mem::size_of::<STARTUPINFOA>() as u32,
            ..Default::default()
        };
        let mut process = PROCESS_INFORMATION::default();

        let spawned = CreateProcessA(
            PCSTR(path.as_ptr()),
            PSTR::null(),
            None,
            None,
            false,
            PROCESS_CREATION_FLAGS(0),
            None,
            PCSTR::null(),
            &startup,
            &mut process,
        );
        if spawned.is_err() {
            let _ = ReleaseMutex(mutex);
            return Err(Error::CreateProcessFailed);
        }

        let _process_guard = HandleGuard(process.hProcess);
        let _thread_guard = HandleGuard(process.hThread);

        info!("spawned a fresh instance of the host process");
        let _ = ReleaseMutex(mutex);
    }

    Ok(())
}

/// Block until a predecessor instance releases `Global\NoCEG`. Called on
/// attach so a restarted process starts work only after the old one is gone.
pub fn wait_for_predecessor() {
    unsafe {
        if let Ok(mutex) = CreateMutexA(None, false, s!("Global\\NoCEG")) {
            let _guard = HandleGuard(mutex);
            WaitForSingleObject(mutex, INFINITE);
            let _ = ReleaseMutex(mutex);
        }
    }
}
