// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! AppleEvent bridge surface for darwin app bundles.
//!
//! The bridge itself (event handler installation, conversion of odoc /
//! GURL events into arguments) is an external collaborator; what the
//! bootloader owns is the argv filtering, the bounded event drain at
//! startup, and the synthetic activation event that replaces the one
//! the drain consumed.

use std::ffi::OsString;

/// How long launch events are drained before the interpreter starts.
pub const EVENT_DRAIN_TIMEOUT_SECS: f64 = 0.25;

/// Drop the process-serial-number argument (`-psn_X_YYYYY`) that the
/// darwin launcher appends when an app bundle is started from the
/// Finder. Returns `None` when nothing had to be filtered, so callers
/// only carry a rewritten argv when one is actually needed.
pub fn filter_psn_argument(argv: &[OsString]) -> Option<Vec<OsString>> {
    let has_psn = argv
        .iter()
        .any(|arg| arg.to_string_lossy().starts_with("-psn_"));
    if !has_psn {
        return None;
    }

    Some(
        argv.iter()
            .filter(|arg| !arg.to_string_lossy().starts_with("-psn_"))
            .cloned()
            .collect(),
    )
}

#[cfg(all(target_os = "macos", feature = "windowed"))]
mod bridge {
    use {super::EVENT_DRAIN_TIMEOUT_SECS, slog::debug, std::ffi::OsString};

    #[allow(non_camel_case_types)]
    type OSStatus = i32;

    #[repr(C)]
    struct AEDesc {
        descriptor_type: u32,
        data_handle: *mut core::ffi::c_void,
    }

    const K_CORE_EVENT_CLASS: u32 = u32::from_be_bytes(*b"aevt");
    const K_AE_OPEN_APPLICATION: u32 = u32::from_be_bytes(*b"oapp");
    const TYPE_PROCESS_SERIAL_NUMBER: u32 = u32::from_be_bytes(*b"psn ");

    #[repr(C)]
    struct ProcessSerialNumber {
        high: u32,
        low: u32,
    }

    const K_CURRENT_PROCESS: u32 = 2;

    extern "C" {
        fn AECreateDesc(
            type_code: u32,
            data: *const core::ffi::c_void,
            data_size: isize,
            result: *mut AEDesc,
        ) -> OSStatus;
        fn AECreateAppleEvent(
            event_class: u32,
            event_id: u32,
            target: *const AEDesc,
            return_id: i16,
            transaction_id: i32,
            result: *mut AEDesc,
        ) -> OSStatus;
        fn AESendMessage(
            event: *const AEDesc,
            reply: *mut AEDesc,
            send_mode: i32,
            timeout_ticks: i64,
        ) -> OSStatus;
        fn AEDisposeDesc(desc: *mut AEDesc) -> OSStatus;

        fn CFRunLoopRunInMode(
            mode: *const core::ffi::c_void,
            seconds: f64,
            return_after_source_handled: u8,
        ) -> i32;
        static kCFRunLoopDefaultMode: *const core::ffi::c_void;
    }

    /// Drain pending launch events for at most the configured window,
    /// letting installed handlers convert them into arguments.
    pub fn drain_launch_events(log: &slog::Logger, argv: &mut Vec<OsString>) {
        let _ = argv;
        debug!(log, "draining launch events");
        unsafe {
            CFRunLoopRunInMode(kCFRunLoopDefaultMode, EVENT_DRAIN_TIMEOUT_SECS, 0);
        }
    }

    /// Submit a synthetic activation (`oapp`) event to ourselves. The
    /// drain above consumes whatever activation event launched the app,
    /// which confuses some UI toolkits unless it is replaced.
    pub fn submit_activation_event(log: &slog::Logger) {
        debug!(log, "submitting synthetic activation event");
        unsafe {
            let psn = ProcessSerialNumber {
                high: 0,
                low: K_CURRENT_PROCESS,
            };

            let mut target = AEDesc {
                descriptor_type: 0,
                data_handle: std::ptr::null_mut(),
            };
            if AECreateDesc(
                TYPE_PROCESS_SERIAL_NUMBER,
                &psn as *const _ as *const _,
                std::mem::size_of::<ProcessSerialNumber>() as isize,
                &mut target,
            ) != 0
            {
                return;
            }

            let mut event = AEDesc {
                descriptor_type: 0,
                data_handle: std::ptr::null_mut(),
            };
            if AECreateAppleEvent(
                K_CORE_EVENT_CLASS,
                K_AE_OPEN_APPLICATION,
                &target,
                -1, // kAutoGenerateReturnID
                0,  // kAnyTransactionID
                &mut event,
            ) == 0
            {
                AESendMessage(&event, std::ptr::null_mut(), 1, 60);
                AEDisposeDesc(&mut event);
            }

            AEDisposeDesc(&mut target);
        }
    }
}

/// Turn the single-file parent into a background process so only the
/// child shows up in the Dock. No-op outside windowed darwin builds.
pub fn transform_process_to_background() {
    #[cfg(all(target_os = "macos", feature = "windowed"))]
    unsafe {
        #[repr(C)]
        struct ProcessSerialNumber {
            high: u32,
            low: u32,
        }

        extern "C" {
            fn TransformProcessType(psn: *const ProcessSerialNumber, transform_state: u32) -> i32;
        }

        const K_CURRENT_PROCESS: u32 = 2;
        const K_PROCESS_TRANSFORM_TO_BACKGROUND_APPLICATION: u32 = 2;

        let psn = ProcessSerialNumber {
            high: 0,
            low: K_CURRENT_PROCESS,
        };
        TransformProcessType(&psn, K_PROCESS_TRANSFORM_TO_BACKGROUND_APPLICATION);
    }
}

/// Run argv emulation for a windowed darwin build: drain launch events
/// into arguments, then restore an activation event. No-op elsewhere.
pub fn run_argv_emulation(log: &slog::Logger, argv: &mut Vec<OsString>) {
    #[cfg(all(target_os = "macos", feature = "windowed"))]
    {
        bridge::drain_launch_events(log, argv);
        bridge::submit_activation_event(log);
    }

    #[cfg(not(all(target_os = "macos", feature = "windowed")))]
    {
        let _ = (log, argv);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<OsString> {
        values.iter().map(OsString::from).collect()
    }

    #[test]
    fn psn_argument_is_filtered() {
        let argv = args(&["/Applications/App.app/Contents/MacOS/app", "-psn_0_12345"]);
        let rewritten = filter_psn_argument(&argv).unwrap();
        assert_eq!(
            rewritten,
            args(&["/Applications/App.app/Contents/MacOS/app"])
        );
    }

    #[test]
    fn other_arguments_survive_filtering() {
        let argv = args(&["app", "-psn_0_1", "--flag", "value"]);
        let rewritten = filter_psn_argument(&argv).unwrap();
        assert_eq!(rewritten, args(&["app", "--flag", "value"]));
    }

    #[test]
    fn no_rewrite_without_psn() {
        let argv = args(&["app", "--flag"]);
        assert!(filter_psn_argument(&argv).is_none());
    }
}
