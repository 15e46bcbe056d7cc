//! Process scaffolding that Desktop Duplication expects: a multi-threaded COM apartment and
//! a window (message-only, never shown) tying the process to the interactive desktop.

use deskrec_core::CaptureError;
use tracing::debug;
use windows::core::{w, PCWSTR};
use windows::Win32::Foundation::{HINSTANCE, HWND, LPARAM, LRESULT, WPARAM};
use windows::Win32::System::Com::{CoInitializeEx, CoUninitialize, COINIT_MULTITHREADED};
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DefWindowProcW, DestroyWindow, RegisterClassW, HMENU, HWND_MESSAGE,
    WINDOW_EX_STYLE, WINDOW_STYLE, WNDCLASSW,
};

const CLASS_NAME: PCWSTR = w!("DeskrecSessionWindow");

/// Held for the lifetime of a recording; undoes its setup on drop.
pub struct SessionScaffold {
    hwnd: HWND,
}

impl SessionScaffold {
    pub fn enter() -> Result<Self, CaptureError> {
        // S_FALSE (already initialised on this thread) still needs its CoUninitialize.
        unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) }
            .ok()
            .map_err(|e| CaptureError::Device { reason: format!("CoInitializeEx: {e}") })?;

        match create_message_window() {
            Ok(hwnd) => {
                debug!("Session scaffold ready (hwnd {:?})", hwnd);
                Ok(Self { hwnd })
            }
            Err(e) => {
                unsafe { CoUninitialize() };
                Err(CaptureError::Device { reason: format!("CreateWindowExW: {e}") })
            }
        }
    }
}

impl Drop for SessionScaffold {
    fn drop(&mut self) {
        unsafe {
            let _ = DestroyWindow(self.hwnd);
            CoUninitialize();
        }
    }
}

fn create_message_window() -> windows::core::Result<HWND> {
    unsafe {
        let instance: HINSTANCE = GetModuleHandleW(None)?.into();
        let class = WNDCLASSW {
            lpfnWndProc: Some(wnd_proc),
            hInstance: instance,
            lpszClassName: CLASS_NAME,
            ..Default::default()
        };
        // Fails harmlessly when the class is already registered by an earlier scaffold.
        RegisterClassW(&class);

        CreateWindowExW(
            WINDOW_EX_STYLE(0),
            CLASS_NAME,
            w!("deskrec"),
            WINDOW_STYLE(0),
            0,
            0,
            0,
            0,
            HWND_MESSAGE,
            HMENU::default(),
            instance,
            None,
        )
    }
}

unsafe extern "system" fn wnd_proc(hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    DefWindowProcW(hwnd, msg, wparam, lparam)
}
