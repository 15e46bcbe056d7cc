//! deskrec-capture-windows: DXGI Desktop Duplication capture source.
//!
//! On non-Windows targets a stub is compiled that refuses to open, so the workspace still
//! builds and the [`SyntheticSource`] remains available.
//!
//! # Windows pipeline
//!
//! ```text
//! CreateDXGIFactory1 → EnumAdapters1 × EnumOutputs (AttachedToDesktop)
//!   │  D3D11CreateDevice(adapter, VIDEO_SUPPORT | BGRA_SUPPORT)
//!   ▼
//! IDXGIOutput1::DuplicateOutput → IDXGIOutputDuplication
//!   │  AcquireNextFrame(timeout)
//!   ▼
//! ID3D11Texture2D (GPU) → CopyResource → staging texture → Flush + event query → Map
//!   │
//!   ▼
//! StagingBuffer (row pitch ≥ width × 4) ─ drop → Unmap;  ReleaseFrame()
//! ```

mod synthetic;

pub use synthetic::{SyntheticFrame, SyntheticSource};

// ── Platform split ─────────────────────────────────────────────────────────────

#[cfg(target_os = "windows")]
mod dxgi;
#[cfg(target_os = "windows")]
mod session;
#[cfg(target_os = "windows")]
pub use dxgi::{DesktopDuplication, DuplicatedFrame};
#[cfg(target_os = "windows")]
pub use session::SessionScaffold;

#[cfg(not(target_os = "windows"))]
mod stub;
#[cfg(not(target_os = "windows"))]
pub use stub::{DesktopDuplication, DuplicatedFrame, SessionScaffold};
