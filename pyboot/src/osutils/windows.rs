// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Win32 implementations of the platform port: executable resolution,
//! user-restricted temp directories, DLL search path, console handling,
//! and the child-process lifecycle with session-shutdown plumbing.

use {
    crate::{
        context::{ProcessContext, ASYNC_STATE},
        error::{BootloaderError, Result},
    },
    slog::{debug, warn},
    std::{
        ffi::{OsStr, OsString},
        io,
        os::windows::ffi::{OsStrExt, OsStringExt},
        path::{Path, PathBuf},
        process::Command,
        sync::atomic::Ordering,
    },
    winapi::{
        shared::minwindef::{BOOL, DWORD, FALSE, LPARAM, LRESULT, TRUE, UINT, WPARAM},
        um::{
            accctrl::{EXPLICIT_ACCESS_W, NO_INHERITANCE, SET_ACCESS, TRUSTEE_IS_SID, TRUSTEE_IS_USER, TRUSTEE_W},
            aclapi::SetEntriesInAclW,
            consoleapi::SetConsoleCtrlHandler,
            fileapi::CreateDirectoryW,
            handleapi::CloseHandle,
            libloaderapi::{GetModuleFileNameW, GetModuleHandleW, LoadLibraryExW, SetDllDirectoryW},
            minwinbase::SECURITY_ATTRIBUTES,
            processthreadsapi::{GetCurrentProcess, GetCurrentProcessId, OpenProcessToken},
            securitybaseapi::{GetTokenInformation, InitializeSecurityDescriptor, SetSecurityDescriptorDacl},
            winbase::{LocalAlloc, LocalFree, LOAD_LIBRARY_SEARCH_DEFAULT_DIRS, LPTR},
            wincon::{GetConsoleWindow, CTRL_CLOSE_EVENT, CTRL_LOGOFF_EVENT, CTRL_SHUTDOWN_EVENT},
            winnt::{
                TokenUser, GENERIC_ALL, HANDLE, PSECURITY_DESCRIPTOR, SECURITY_DESCRIPTOR_MIN_LENGTH,
                SECURITY_DESCRIPTOR_REVISION, TOKEN_QUERY, TOKEN_USER,
            },
            winuser::{
                CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW, GetMessageW,
                PostMessageW, RegisterClassExW, ShowWindow, TranslateMessage, MSG, SW_HIDE,
                SW_SHOWMINNOACTIVE, WM_ENDSESSION, WM_QUERYENDSESSION, WNDCLASSEXW,
            },
        },
    },
};

fn wide(value: &OsStr) -> Vec<u16> {
    value.encode_wide().chain(std::iter::once(0)).collect()
}

/// Resolve the executable path via `GetModuleFileNameW`, following a
/// symbolic link when the image was launched through one. The extended
/// path prefix is stripped so it never shows up in `sys.executable` or
/// the application root.
pub fn resolve_executable() -> Result<PathBuf> {
    let mut buffer = vec![0u16; 4096];
    let len = unsafe {
        GetModuleFileNameW(std::ptr::null_mut(), buffer.as_mut_ptr(), buffer.len() as DWORD)
    };
    if len == 0 {
        return Err(BootloaderError::PlatformFailure {
            context: "resolving executable path",
            reason: "GetModuleFileNameW failed".to_string(),
        });
    }

    let mut path = PathBuf::from(OsString::from_wide(&buffer[..len as usize]));

    if let Ok(metadata) = std::fs::symlink_metadata(&path) {
        if metadata.file_type().is_symlink() {
            path = std::fs::canonicalize(&path)
                .map_err(|e| BootloaderError::platform("resolving executable symlink", e))?;
        }
    }

    let text = path.as_os_str().to_string_lossy();
    if let Some(stripped) = text.strip_prefix(r"\\?\") {
        path = PathBuf::from(stripped);
    }

    Ok(path)
}

/// Security attributes restricting a directory to the current user.
/// Required by `CreateDirectoryW` for the application directory and all
/// sub-directories created during extraction.
pub struct SecurityAttributes {
    pub attributes: SECURITY_ATTRIBUTES,
    descriptor: PSECURITY_DESCRIPTOR,
    acl: *mut winapi::um::winnt::ACL,
    token_user: Vec<u8>,
}

unsafe impl Send for SecurityAttributes {}

impl SecurityAttributes {
    pub fn new() -> Result<Self> {
        unsafe {
            let mut token: HANDLE = std::ptr::null_mut();
            if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
                return Err(platform_error("opening process token"));
            }

            let mut needed: DWORD = 0;
            GetTokenInformation(token, TokenUser, std::ptr::null_mut(), 0, &mut needed);
            let mut token_user = vec![0u8; needed as usize];
            let ok = GetTokenInformation(
                token,
                TokenUser,
                token_user.as_mut_ptr() as *mut _,
                needed,
                &mut needed,
            );
            CloseHandle(token);
            if ok == 0 {
                return Err(platform_error("querying token user"));
            }

            let user_sid = (*(token_user.as_ptr() as *const TOKEN_USER)).User.Sid;

            let mut access: EXPLICIT_ACCESS_W = std::mem::zeroed();
            access.grfAccessPermissions = GENERIC_ALL;
            access.grfAccessMode = SET_ACCESS;
            access.grfInheritance = NO_INHERITANCE;
            access.Trustee = TRUSTEE_W {
                pMultipleTrustee: std::ptr::null_mut(),
                MultipleTrusteeOperation: 0,
                TrusteeForm: TRUSTEE_IS_SID,
                TrusteeType: TRUSTEE_IS_USER,
                ptstrName: user_sid as *mut _,
            };

            let mut acl: *mut winapi::um::winnt::ACL = std::ptr::null_mut();
            if SetEntriesInAclW(1, &mut access, std::ptr::null_mut(), &mut acl) != 0 {
                return Err(platform_error("building owner-only ACL"));
            }

            let descriptor = LocalAlloc(LPTR, SECURITY_DESCRIPTOR_MIN_LENGTH);
            if descriptor.is_null()
                || InitializeSecurityDescriptor(descriptor, SECURITY_DESCRIPTOR_REVISION) == 0
                || SetSecurityDescriptorDacl(descriptor, TRUE, acl, FALSE) == 0
            {
                if !descriptor.is_null() {
                    LocalFree(descriptor);
                }
                LocalFree(acl as *mut _);
                return Err(platform_error("initializing security descriptor"));
            }

            Ok(Self {
                attributes: SECURITY_ATTRIBUTES {
                    nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as DWORD,
                    lpSecurityDescriptor: descriptor,
                    bInheritHandle: FALSE,
                },
                descriptor,
                acl,
                token_user,
            })
        }
    }
}

impl Drop for SecurityAttributes {
    fn drop(&mut self) {
        unsafe {
            LocalFree(self.descriptor);
            LocalFree(self.acl as *mut _);
        }
        self.token_user.clear();
    }
}

fn platform_error(context: &'static str) -> BootloaderError {
    BootloaderError::PlatformFailure {
        context,
        reason: io::Error::last_os_error().to_string(),
    }
}

/// Create a user-restricted `_MEI<6 digits>` directory under `base`.
pub fn make_private_temp_dir(base: &Path, ctx: &mut ProcessContext) -> io::Result<PathBuf> {
    let security = match ctx.security_attributes.as_mut() {
        Some(security) => security,
        None => return Err(io::Error::new(io::ErrorKind::Other, "no security descriptor")),
    };

    let pid = unsafe { GetCurrentProcessId() };
    for attempt in 0..100u32 {
        let candidate = base.join(format!("_MEI{:06}", (pid.wrapping_mul(100) + attempt) % 1_000_000));
        let candidate_w = wide(candidate.as_os_str());

        let created = unsafe {
            CreateDirectoryW(candidate_w.as_ptr(), &mut security.attributes as *mut _)
        };
        if created != 0 {
            return Ok(candidate);
        }
    }

    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        "could not find a free _MEI directory name",
    ))
}

/// Grace period for file locks held by just-exited processes or
/// third-party components (anti-virus, shell extensions) before the
/// removal is retried.
pub fn mitigate_locked_directory(path: &Path) {
    let _ = path;
    std::thread::sleep(std::time::Duration::from_millis(500));
}

/// Restrict the process DLL search path to the application root.
pub fn set_dll_directory(dir: &Path) -> Result<()> {
    let dir_w = wide(dir.as_os_str());
    if unsafe { SetDllDirectoryW(dir_w.as_ptr()) } == 0 {
        return Err(platform_error("setting DLL search directory"));
    }
    Ok(())
}

/// Pre-load system copies of the VC runtime DLLs into the single-file
/// parent, before the DLL search path starts pointing at the
/// application directory. Keeps injected third-party DLLs from pinning
/// the *bundled* copies, which would make cleanup fail.
pub fn preload_system_vc_runtime(log: &slog::Logger) {
    unsafe { SetDllDirectoryW(std::ptr::null()) };

    for name in ["VCRUNTIME140.dll", "VCRUNTIME140_1.dll"] {
        let name_w = wide(OsStr::new(name));
        let handle = unsafe {
            LoadLibraryExW(
                name_w.as_ptr(),
                std::ptr::null_mut(),
                LOAD_LIBRARY_SEARCH_DEFAULT_DIRS,
            )
        };
        if handle.is_null() {
            debug!(log, "no system copy of {} to pre-load", name);
        } else {
            debug!(log, "pre-loaded system copy of {}", name);
        }
    }
}

pub fn hide_console() {
    let window = unsafe { GetConsoleWindow() };
    if !window.is_null() {
        unsafe { ShowWindow(window, SW_HIDE) };
    }
}

pub fn minimize_console() {
    let window = unsafe { GetConsoleWindow() };
    if !window.is_null() {
        unsafe { ShowWindow(window, SW_SHOWMINNOACTIVE) };
    }
}

/// Pump one empty message through the GUI queue so the OS dismisses the
/// "program is starting" cursor of windowed builds.
pub fn dismiss_startup_cursor() {
    unsafe {
        let mut msg: MSG = std::mem::zeroed();
        PostMessageW(std::ptr::null_mut(), 0, 0, 0);
        GetMessageW(&mut msg, std::ptr::null_mut(), 0, 0);
    }
}

unsafe extern "system" fn console_ctrl_handler(ctrl_type: DWORD) -> BOOL {
    match ctrl_type {
        CTRL_CLOSE_EVENT | CTRL_LOGOFF_EVENT | CTRL_SHUTDOWN_EVENT => {
            ASYNC_STATE.shutdown_requested.store(true, Ordering::Release);
            TRUE
        }
        _ => FALSE,
    }
}

unsafe extern "system" fn shutdown_window_proc(
    hwnd: winapi::shared::windef::HWND,
    msg: UINT,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    match msg {
        WM_QUERYENDSESSION => {
            ASYNC_STATE.shutdown_requested.store(true, Ordering::Release);
            TRUE as LRESULT
        }
        WM_ENDSESSION => {
            ASYNC_STATE.shutdown_requested.store(true, Ordering::Release);
            0
        }
        _ => DefWindowProcW(hwnd, msg, wparam, lparam),
    }
}

/// Run an invisible top-level window on a helper thread so session-end
/// messages reach the waiting parent. When a shutdown is signalled the
/// helper terminates the child, which unblocks the main wait and routes
/// execution through the regular cleanup path.
fn spawn_shutdown_listener(log: &slog::Logger) {
    let log = log.clone();

    std::thread::spawn(move || unsafe {
        let class_name = wide(OsStr::new("pyboot-shutdown-window"));
        let mut class: WNDCLASSEXW = std::mem::zeroed();
        class.cbSize = std::mem::size_of::<WNDCLASSEXW>() as UINT;
        class.lpfnWndProc = Some(shutdown_window_proc);
        class.hInstance = GetModuleHandleW(std::ptr::null());
        class.lpszClassName = class_name.as_ptr();

        if RegisterClassExW(&class) == 0 {
            warn!(log, "could not register shutdown window class");
            return;
        }

        let window = CreateWindowExW(
            0,
            class_name.as_ptr(),
            std::ptr::null(),
            0,
            0,
            0,
            0,
            0,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            class.hInstance,
            std::ptr::null_mut(),
        );
        if window.is_null() {
            warn!(log, "could not create shutdown window");
            return;
        }

        let mut msg: MSG = std::mem::zeroed();
        while GetMessageW(&mut msg, std::ptr::null_mut(), 0, 0) > 0 {
            TranslateMessage(&msg);
            DispatchMessageW(&msg);

            if ASYNC_STATE.shutdown_requested.load(Ordering::Acquire) {
                let pid = ASYNC_STATE.child_pid.load(Ordering::Acquire);
                if pid > 0 {
                    let child = winapi::um::processthreadsapi::OpenProcess(
                        winapi::um::winnt::PROCESS_TERMINATE,
                        FALSE,
                        pid as DWORD,
                    );
                    if !child.is_null() {
                        winapi::um::processthreadsapi::TerminateProcess(child, 1);
                        CloseHandle(child);
                    }
                }
                break;
            }
        }

        DestroyWindow(window);
    });
}

/// Spawn the main application process and wait for it, watching for
/// console and session shutdown events in the meantime.
pub fn spawn_and_wait_child(ctx: &mut ProcessContext) -> Result<i32> {
    unsafe { SetConsoleCtrlHandler(Some(console_ctrl_handler), TRUE) };
    spawn_shutdown_listener(&ctx.log);

    let argv = ctx.effective_argv().to_vec();
    let mut command = Command::new(&ctx.executable);
    if argv.len() > 1 {
        command.args(&argv[1..]);
    }

    debug!(ctx.log, "spawning child process");
    let mut child = command
        .spawn()
        .map_err(|e| BootloaderError::ChildSpawnFailure(e.to_string()))?;

    ASYNC_STATE
        .child_pid
        .store(child.id() as i32, Ordering::Release);

    let status = child.wait().map_err(|e| BootloaderError::PlatformFailure {
        context: "waiting for child process",
        reason: e.to_string(),
    });

    ASYNC_STATE.child_pid.store(0, Ordering::Release);

    let status = status?;
    Ok(status.code().unwrap_or(-1))
}
