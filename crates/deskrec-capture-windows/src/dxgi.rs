//! DXGI Desktop Duplication capture implementation.
//!
//! Requires Windows 8+ and a process that owns an interactive desktop session
//! (see [`crate::SessionScaffold`]).
//!
//! # Threading model
//!
//! Everything here is synchronous and single-threaded: `AcquireNextFrame` blocks the
//! caller up to the timeout, and the staging copy is waited on before mapping.

use std::ffi::c_void;
use std::thread;
use std::time::{Duration, Instant};

use deskrec_core::{
    Acquired, AdapterInfo, CaptureError, CapturedFrame, FrameSource, FrameTransfer, Resolution,
    StagingBuffer,
};
use tracing::{debug, info, warn};
use windows::core::Interface;
use windows::Win32::Foundation::{BOOL, HMODULE};
use windows::Win32::Graphics::Direct3D::D3D_DRIVER_TYPE_UNKNOWN;
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11Query, ID3D11Texture2D,
    D3D11_CPU_ACCESS_READ, D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_CREATE_DEVICE_VIDEO_SUPPORT,
    D3D11_MAPPED_SUBRESOURCE, D3D11_MAP_READ, D3D11_QUERY_DESC, D3D11_QUERY_EVENT,
    D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC, D3D11_USAGE_STAGING,
};
use windows::Win32::Graphics::Dxgi::Common::DXGI_SAMPLE_DESC;
use windows::Win32::Graphics::Dxgi::{
    CreateDXGIFactory1, IDXGIAdapter, IDXGIAdapter1, IDXGIFactory1, IDXGIOutput, IDXGIOutput1,
    IDXGIOutputDuplication, IDXGIResource, DXGI_ERROR_ACCESS_LOST, DXGI_ERROR_NOT_FOUND,
    DXGI_ERROR_WAIT_TIMEOUT, DXGI_OUTDUPL_FRAME_INFO,
};

/// Upper bound on how long a staging copy may take to complete.
const COPY_DEADLINE: Duration = Duration::from_secs(1);

// ── DuplicatedFrame ───────────────────────────────────────────────────────────

/// The desktop image handed out by `AcquireNextFrame`. Valid until `release()`.
pub struct DuplicatedFrame {
    texture: ID3D11Texture2D,
    desc:    D3D11_TEXTURE2D_DESC,
    accumulated_frames: u32,
}

impl DuplicatedFrame {
    /// Desktop updates folded into this frame since the previous acquisition.
    pub fn accumulated_frames(&self) -> u32 {
        self.accumulated_frames
    }
}

impl CapturedFrame for DuplicatedFrame {
    fn resolution(&self) -> Resolution {
        Resolution::new(self.desc.Width, self.desc.Height)
    }
}

// ── DesktopDuplication ────────────────────────────────────────────────────────

pub struct DesktopDuplication {
    device:      ID3D11Device,
    context:     ID3D11DeviceContext,
    duplication: IDXGIOutputDuplication,
    copy_done:   ID3D11Query,
    staging:     Option<(ID3D11Texture2D, D3D11_TEXTURE2D_DESC)>,
    resolution:  Resolution,
    adapter:     AdapterInfo,
    holding_frame: bool,
}

impl DesktopDuplication {
    /// Duplicate the first desktop-attached output, walking adapters and their outputs in
    /// the order DXGI reports them.
    ///
    /// Every candidate that fails is recorded; if none succeeds the whole list is returned in
    /// [`CaptureError::NoDuplicableOutput`].
    pub fn open_first_attached() -> Result<Self, CaptureError> {
        let factory: IDXGIFactory1 = unsafe { CreateDXGIFactory1() }
            .map_err(|e| CaptureError::Device { reason: format!("CreateDXGIFactory1: {e}") })?;

        let mut attempts = Vec::new();
        for a in 0u32.. {
            let adapter = match unsafe { factory.EnumAdapters1(a) } {
                Ok(adapter) => adapter,
                Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => break,
                Err(e) => {
                    attempts.push(format!("adapter {a}: EnumAdapters1: {e}"));
                    continue;
                }
            };

            let mut outputs = 0;
            for o in 0u32.. {
                let output = match unsafe { adapter.EnumOutputs(o) } {
                    Ok(output) => output,
                    Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => break,
                    Err(e) => {
                        attempts.push(format!("adapter {a} output {o}: EnumOutputs: {e}"));
                        continue;
                    }
                };
                outputs += 1;

                match Self::duplicate(&adapter, &output) {
                    Ok(dup) => {
                        info!(
                            "Duplicating adapter {a} output {o} ({}) at {}",
                            dup.adapter.description, dup.resolution
                        );
                        return Ok(dup);
                    }
                    Err(reason) => {
                        warn!("Adapter {a} output {o} not usable: {reason}");
                        attempts.push(format!("adapter {a} output {o}: {reason}"));
                    }
                }
            }
            if outputs == 0 {
                attempts.push(format!("adapter {a}: no outputs"));
            }
        }

        Err(CaptureError::NoDuplicableOutput { attempts })
    }

    /// Create a device on `adapter` and a duplication of `output` from it.
    fn duplicate(adapter: &IDXGIAdapter1, output: &IDXGIOutput) -> Result<Self, String> {
        let desc = unsafe { output.GetDesc() }.map_err(|e| format!("GetDesc: {e}"))?;
        if !desc.AttachedToDesktop.as_bool() {
            return Err("not attached to the desktop".to_owned());
        }
        let output1: IDXGIOutput1 = output.cast().map_err(|e| format!("IDXGIOutput1: {e}"))?;

        let (device, context) = create_device(adapter).map_err(|e| format!("D3D11CreateDevice: {e}"))?;
        let duplication = unsafe { output1.DuplicateOutput(&device) }
            .map_err(|e| format!("DuplicateOutput: {e}"))?;

        let dupl_desc = unsafe { duplication.GetDesc() };
        let resolution = Resolution::new(dupl_desc.ModeDesc.Width, dupl_desc.ModeDesc.Height);

        let mut copy_done: Option<ID3D11Query> = None;
        let query_desc = D3D11_QUERY_DESC { Query: D3D11_QUERY_EVENT, MiscFlags: 0 };
        unsafe { device.CreateQuery(&query_desc, Some(&mut copy_done)) }
            .map_err(|e| format!("CreateQuery: {e}"))?;
        let copy_done = copy_done.ok_or("CreateQuery returned no query")?;

        let adapter_desc = unsafe { adapter.GetDesc1() }.map_err(|e| format!("GetDesc1: {e}"))?;
        let luid = adapter_desc.AdapterLuid;
        let adapter = AdapterInfo {
            luid: ((luid.HighPart as i64) << 32) | luid.LowPart as i64,
            description: wide_to_string(&adapter_desc.Description),
        };

        Ok(Self {
            device,
            context,
            duplication,
            copy_done,
            staging: None,
            resolution,
            adapter,
            holding_frame: false,
        })
    }

    /// A staging texture matching `desc`, reused while the frame description is unchanged.
    fn staging_for(&mut self, desc: &D3D11_TEXTURE2D_DESC) -> Result<ID3D11Texture2D, CaptureError> {
        if let Some((texture, cached)) = &self.staging {
            if cached.Width == desc.Width && cached.Height == desc.Height && cached.Format == desc.Format {
                return Ok(texture.clone());
            }
        }

        let staging_desc = D3D11_TEXTURE2D_DESC {
            Width:          desc.Width,
            Height:         desc.Height,
            MipLevels:      1,
            ArraySize:      1,
            Format:         desc.Format,
            SampleDesc:     DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Usage:          D3D11_USAGE_STAGING,
            BindFlags:      0,
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            MiscFlags:      0,
        };
        let mut texture: Option<ID3D11Texture2D> = None;
        unsafe { self.device.CreateTexture2D(&staging_desc, None, Some(&mut texture)) }
            .map_err(|e| CaptureError::CopyFailed { reason: format!("CreateTexture2D: {e}") })?;
        let texture = texture.ok_or_else(|| CaptureError::CopyFailed {
            reason: "CreateTexture2D returned no texture".to_owned(),
        })?;

        debug!("Staging texture created {}×{}", desc.Width, desc.Height);
        self.staging = Some((texture.clone(), staging_desc));
        Ok(texture)
    }

    /// Block until every command issued so far, including the staging copy, has executed.
    fn wait_for_copy(&self) -> Result<(), CaptureError> {
        unsafe {
            self.context.End(&self.copy_done);
            self.context.Flush();
        }

        let started = Instant::now();
        loop {
            let mut done = BOOL(0);
            let polled = unsafe {
                self.context.GetData(
                    &self.copy_done,
                    Some(&mut done as *mut BOOL as *mut c_void),
                    std::mem::size_of::<BOOL>() as u32,
                    0,
                )
            };
            if copy_completed(polled, done)? {
                return Ok(());
            }
            if started.elapsed() > COPY_DEADLINE {
                return Err(CaptureError::BarrierTimeout { ms: COPY_DEADLINE.as_millis() as u64 });
            }
            thread::yield_now();
        }
    }
}

impl FrameSource for DesktopDuplication {
    type Frame = DuplicatedFrame;

    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn adapter(&self) -> Option<AdapterInfo> {
        Some(self.adapter.clone())
    }

    fn acquire(&mut self, timeout: Duration) -> Result<Acquired<DuplicatedFrame>, CaptureError> {
        if self.holding_frame {
            return Err(CaptureError::FrameOutstanding);
        }

        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let mut frame_info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource: Option<IDXGIResource> = None;
        match unsafe { self.duplication.AcquireNextFrame(timeout_ms, &mut frame_info, &mut resource) } {
            Ok(()) => {}
            Err(e) if e.code() == DXGI_ERROR_WAIT_TIMEOUT => return Ok(Acquired::Timeout),
            Err(e) if e.code() == DXGI_ERROR_ACCESS_LOST => return Err(CaptureError::AccessLost),
            Err(e) => return Err(CaptureError::AcquireFailed { reason: e.to_string() }),
        }
        self.holding_frame = true;

        // The frame is held from here on; give it back if it cannot be handed out.
        let texture = match resource.map(|r| r.cast::<ID3D11Texture2D>()) {
            Some(Ok(texture)) => texture,
            Some(Err(e)) => {
                let _ = self.release();
                return Err(CaptureError::AcquireFailed { reason: format!("ID3D11Texture2D: {e}") });
            }
            None => {
                let _ = self.release();
                return Err(CaptureError::AcquireFailed { reason: "no desktop resource".to_owned() });
            }
        };

        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.GetDesc(&mut desc) };

        Ok(Acquired::Frame(DuplicatedFrame {
            texture,
            desc,
            accumulated_frames: frame_info.AccumulatedFrames,
        }))
    }

    fn release(&mut self) -> Result<(), CaptureError> {
        if !self.holding_frame {
            return Err(CaptureError::NoFrameOutstanding);
        }
        self.holding_frame = false;
        unsafe { self.duplication.ReleaseFrame() }.map_err(|e| {
            if e.code() == DXGI_ERROR_ACCESS_LOST {
                CaptureError::AccessLost
            } else {
                CaptureError::ReleaseFailed { reason: e.to_string() }
            }
        })
    }
}

impl FrameTransfer for DesktopDuplication {
    fn copy_to_staging(&mut self, frame: &DuplicatedFrame) -> Result<StagingBuffer<'_>, CaptureError> {
        let staging = self.staging_for(&frame.desc)?;

        unsafe { self.context.CopyResource(&staging, &frame.texture) };
        self.wait_for_copy()?;

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe { self.context.Map(&staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped)) }
            .map_err(|e| CaptureError::MapFailed { reason: e.to_string() })?;

        let row_pitch = mapped.RowPitch as usize;
        let len = row_pitch * frame.desc.Height as usize;
        // SAFETY: the subresource stays mapped until the returned buffer unmaps it on drop.
        let data = unsafe { std::slice::from_raw_parts(mapped.pData as *const u8, len) };

        if frame.accumulated_frames > 1 {
            debug!("Frame folds {} desktop updates", frame.accumulated_frames);
        }

        let context = &self.context;
        Ok(StagingBuffer::new(data, row_pitch, frame.resolution())
            .on_unmap(move || unsafe { context.Unmap(&staging, 0) }))
    }
}

impl Drop for DesktopDuplication {
    fn drop(&mut self) {
        if self.holding_frame {
            let _ = unsafe { self.duplication.ReleaseFrame() };
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn create_device(adapter: &IDXGIAdapter1) -> windows::core::Result<(ID3D11Device, ID3D11DeviceContext)> {
    let adapter: IDXGIAdapter = adapter.cast()?;
    let mut device: Option<ID3D11Device> = None;
    let mut context: Option<ID3D11DeviceContext> = None;
    unsafe {
        D3D11CreateDevice(
            &adapter,
            D3D_DRIVER_TYPE_UNKNOWN,
            HMODULE::default(),
            D3D11_CREATE_DEVICE_VIDEO_SUPPORT | D3D11_CREATE_DEVICE_BGRA_SUPPORT,
            None,
            D3D11_SDK_VERSION,
            Some(&mut device),
            None,
            Some(&mut context),
        )?;
    }
    match (device, context) {
        (Some(device), Some(context)) => Ok((device, context)),
        _ => Err(windows::core::Error::from(windows::Win32::Foundation::E_POINTER)),
    }
}

/// Interpret one poll of the copy event query. A pending query (S_FALSE) polls as `Ok` with
/// `done` still unset.
fn copy_completed(polled: windows::core::Result<()>, done: BOOL) -> Result<bool, CaptureError> {
    match polled {
        Ok(()) => Ok(done.as_bool()),
        Err(e) => Err(CaptureError::CopyFailed { reason: format!("GetData: {e}") }),
    }
}

fn wide_to_string(wide: &[u16]) -> String {
    let end = wide.iter().position(|&c| c == 0).unwrap_or(wide.len());
    String::from_utf16_lossy(&wide[..end])
}
