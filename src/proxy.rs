//! Forwarded Steam API surface.
//!
//! The extractor library is dropped in as `steam_api.dll`, so every export
//! the host program expects has to exist. Each forward lazily resolves the
//! same-named entry point in the renamed original (`steam_api_org.dll`) and
//! tail-calls it.

use std::ffi::{c_char, c_void};
use std::sync::Mutex;

use tracing::{error, warn};
use windows::core::PCSTR;
use windows::Win32::Foundation::{FreeLibrary, HMODULE};
use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryA};

const ORIGINAL_DLL: &str = "steam_api_org.dll\0";

/// Handle to the original dynamic library, stored as a raw address so the
/// wrapper can live in a static.
struct DllWrapper {
    module: usize,
}

impl DllWrapper {
    fn load() -> Option<Self> {
        let module = unsafe { LoadLibraryA(PCSTR(ORIGINAL_DLL.as_ptr())) };
        match module {
            Ok(module) => Some(Self {
                module: module.0 as usize,
            }),
            Err(err) => {
                error!("failed to load the original library '{ORIGINAL_DLL}': {err}");
                None
            }
        }
    }

    fn handle(&self) -> HMODULE {
        HMODULE(self.module as *mut std::ffi::c_void)
    }
}

static WRAPPER: Mutex<Option<DllWrapper>> = Mutex::new(None);

/// Load the original library once. Safe to call repeatedly.
pub fn initialize() {
    let mut wrapper = WRAPPER.lock().expect("proxy state poisoned");
    if wrapper.is_none() {
        *wrapper = DllWrapper::load();
    }
}

/// Unload the original library.
pub fn shutdown() {
    if let Some(wrapper) = WRAPPER.lock().expect("proxy state poisoned").take() {
        unsafe {
            let _ = FreeLibrary(wrapper.handle());
        }
    }
}

/// Resolve an export of the original library by NUL-terminated name.
pub(crate) fn resolve(name: &'static str) -> usize {
    initialize();

    let wrapper = WRAPPER.lock().expect("proxy state poisoned");
    let Some(wrapper) = wrapper.as_ref() else {
        return 0;
    };

    match unsafe { GetProcAddress(wrapper.handle(), PCSTR(name.as_ptr())) } {
        Some(proc) => proc as usize,
        None => {
            warn!(
                "function '{}' not found in '{ORIGINAL_DLL}'",
                name.trim_end_matches('\0')
            );
            0
        }
    }
}

/// Define one forwarded export. The resolved address is cached per export;
/// an unresolvable export returns a zeroed value instead of calling through.
macro_rules! forward_export {
    ($name:ident ( $($arg:ident : $ty:ty),* ) -> $ret:ty) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name($($arg: $ty),*) -> $ret {
            static SLOT: std::sync::OnceLock<usize> = std::sync::OnceLock::new();
            let address =
                *SLOT.get_or_init(|| crate::proxy::resolve(concat!(stringify!($name), "\0")));
            if address == 0 {
                return std::mem::zeroed();
            }

            let target: unsafe extern "C" fn($($ty),*) -> $ret =
                std::mem::transmute(address);
            target($($arg),*)
        }
    };
}

forward_export!(SteamAPI_GetHSteamPipe() -> u32);
forward_export!(SteamAPI_GetHSteamUser() -> u32);
forward_export!(SteamAPI_Init() -> bool);
forward_export!(SteamAPI_InitSafe() -> bool);
forward_export!(SteamAPI_IsSteamRunning() -> bool);
forward_export!(SteamAPI_Shutdown() -> ());
forward_export!(SteamAPI_RunCallbacks() -> ());
forward_export!(SteamAPI_RestartAppIfNecessary(app_id: u32) -> bool);
forward_export!(SteamAPI_SetMiniDumpComment(message: *const c_char) -> ());
forward_export!(SteamAPI_WriteMiniDump(exception_code: u32, exception_info: *mut c_void, build_id: u32) -> ());
forward_export!(SteamAPI_RegisterCallback(callback: *mut c_void, id: i32) -> ());
forward_export!(SteamAPI_UnregisterCallback(callback: *mut c_void) -> ());
forward_export!(SteamAPI_RegisterCallResult(callback: *mut c_void, api_call: u64) -> ());
forward_export!(SteamAPI_UnregisterCallResult(callback: *mut c_void, api_call: u64) -> ());
forward_export!(SteamClient() -> *mut c_void);
forward_export!(SteamUser() -> *mut c_void);
forward_export!(SteamFriends() -> *mut c_void);
forward_export!(SteamUtils() -> *mut c_void);
forward_export!(SteamMasterServerUpdater() -> *mut c_void);
forward_export!(SteamMatchmaking() -> *mut c_void);
forward_export!(SteamMatchmakingServers() -> *mut c_void);
forward_export!(SteamUserStats() -> *mut c_void);
forward_export!(SteamApps() -> *mut c_void);
forward_export!(SteamNetworking() -> *mut c_void);
forward_export!(SteamRemoteStorage() -> *mut c_void);
forward_export!(SteamScreenshots() -> *mut c_void);
forward_export!(SteamGameServer() -> *mut c_void);
forward_export!(SteamGameServerNetworking() -> *mut c_void);
forward_export!(SteamGameServerUtils() -> *mut c_void);
forward_export!(SteamGameServer_BSecure() -> bool);
forward_export!(SteamGameServer_GetSteamID() -> u64);
forward_export!(SteamGameServer_Init(ip: u32, steam_port: u16, game_port: u16, query_port: u16, server_mode: i32, version: *const c_char) -> bool);
forward_export!(SteamGameServer_Shutdown() -> ());
forward_export!(SteamGameServer_RunCallbacks() -> ());
forward_export!(SteamGameServerStats() -> *mut c_void);
