//! GStreamer encode-and-mux session writing one MP4 file.
//!
//! Encoder priority (first factory found wins):
//! - H.264: `mfh264enc` (Media Foundation), `nvh264enc` (NVENC), `x264enc` (software)
//! - H.265: `mfh265enc`, `nvh265enc`, `x265enc`
//!
//! Pipeline:
//! ```text
//! appsrc (BGRx, bottom-up rows)
//!   → videoflip method=vertical-flip
//!   → videoconvert
//!   → <encoder> bitrate=<kbit/s>
//!   → h264parse | h265parse
//!   → capsfilter (output descriptor)
//!   → mp4mux
//!   → filesink
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use deskrec_core::{
    AdapterInfo, EncodeError, EncodeSink, MediaSample, PixelFormat, RowOrder, SessionSpec,
    StreamDescriptor, StreamFormat, VideoCodec,
};
use gstreamer::{self as gst, prelude::*};
use gstreamer_app::AppSrc;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

/// How long finalize waits for the muxer to write the index after end-of-stream.
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(30);

/// GStreamer context type through which D3D11 elements pick their adapter.
const D3D11_DEVICE_CONTEXT: &str = "gst.d3d11.device.handle";

/// Raw frames appsrc may hold before `push_buffer` blocks.
const QUEUED_FRAMES: usize = 3;

// ── Encoder selection ─────────────────────────────────────────────────────────

fn encoder_candidates(codec: VideoCodec) -> &'static [&'static str] {
    match codec {
        VideoCodec::H264 => &["mfh264enc", "nvh264enc", "x264enc"],
        VideoCodec::H265 => &["mfh265enc", "nvh265enc", "x265enc"],
    }
}

fn pick_encoder(codec: VideoCodec) -> Result<&'static str, EncodeError> {
    for name in encoder_candidates(codec) {
        if gst::ElementFactory::find(name).is_some() {
            info!("[GstEncodeSink] Using encoder: {}", name);
            return Ok(name);
        }
        debug!("[GstEncodeSink] {} not available", name);
    }
    Err(EncodeError::EncoderUnavailable { codec })
}

fn parser_for(codec: VideoCodec) -> &'static str {
    match codec {
        VideoCodec::H264 => "h264parse",
        VideoCodec::H265 => "h265parse",
    }
}

fn encoder_settings(encoder: &str, bitrate_kbps: u32, key_int: u32) -> String {
    match encoder {
        "x264enc" => format!(
            "bitrate={bitrate_kbps} speed-preset=veryfast key-int-max={key_int}"
        ),
        "x265enc" => format!(
            "bitrate={bitrate_kbps} speed-preset=veryfast key-int-max={key_int}"
        ),
        "nvh264enc" | "nvh265enc" => format!("bitrate={bitrate_kbps} gop-size={key_int}"),
        _ => format!("bitrate={bitrate_kbps}"),
    }
}

/// The `gst-launch` description of the encode pipeline. Caps and the output location are set
/// on the parsed elements afterwards.
fn describe_pipeline(
    encoder: &str,
    codec: VideoCodec,
    bitrate_bps: u32,
    row_order: RowOrder,
    frames_per_second: u32,
) -> String {
    let bitrate_kbps = (bitrate_bps / 1000).max(1);
    let key_int = frames_per_second.saturating_mul(2).max(1);
    let flip = match row_order {
        RowOrder::BottomUp => "! videoflip method=vertical-flip ",
        RowOrder::TopDown => "",
    };
    format!(
        "appsrc name=src format=time {flip}\
         ! videoconvert \
         ! {encoder} {settings} \
         ! {parser} \
         ! capsfilter name=outcaps \
         ! mp4mux \
         ! filesink name=out",
        settings = encoder_settings(encoder, bitrate_kbps, key_int),
        parser = parser_for(codec),
    )
}

fn input_caps(input: &StreamDescriptor, format: PixelFormat) -> Result<gst::Caps, EncodeError> {
    let video_format = match format {
        PixelFormat::Bgra8 => gst_video::VideoFormat::Bgra,
        PixelFormat::Bgrx8 => gst_video::VideoFormat::Bgrx,
    };
    let rate = input.frame_rate;
    gst_video::VideoInfo::builder(video_format, input.resolution.width, input.resolution.height)
        .fps(gst::Fraction::new(rate.numerator as i32, rate.denominator as i32))
        .interlace_mode(gst_video::VideoInterlaceMode::Progressive)
        .build()
        .and_then(|info| info.to_caps())
        .map_err(|e| EncodeError::Negotiation { reason: format!("input caps: {e}") })
}

/// Adapter hint for D3D11 elements. Advisory only: the context carries `adapter-luid` but no
/// `device` object, so an element that needs a shared device ignores it and opens its own.
fn adapter_context(adapter: &AdapterInfo) -> gst::Context {
    let mut context = gst::Context::new(D3D11_DEVICE_CONTEXT, false);
    if let Some(context) = context.get_mut() {
        context.structure_mut().set("adapter-luid", adapter.luid);
    }
    context
}

fn output_caps(output: &StreamDescriptor, codec: VideoCodec) -> gst::Caps {
    let media_type = match codec {
        VideoCodec::H264 => "video/x-h264",
        VideoCodec::H265 => "video/x-h265",
    };
    let rate = output.frame_rate;
    gst::Caps::builder(media_type)
        .field("width", output.resolution.width as i32)
        .field("height", output.resolution.height as i32)
        .field("framerate", gst::Fraction::new(rate.numerator as i32, rate.denominator as i32))
        .build()
}

// ── GstEncodeSink ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkState {
    Configured,
    Streaming,
    Closed,
}

impl SinkState {
    fn name(self) -> &'static str {
        match self {
            Self::Configured => "configured",
            Self::Streaming => "streaming",
            Self::Closed => "closed",
        }
    }
}

/// An open encoder session. Created by [`GstEncodeSink::open`].
pub struct GstEncodeSink {
    pipeline:     gst::Pipeline,
    appsrc:       AppSrc,
    bus:          gst::Bus,
    output_path:  PathBuf,
    sample_len:   usize,
    state:        SinkState,
    last_pts_hns: Option<u64>,
    written:      u64,
}

impl GstEncodeSink {
    /// Build the pipeline for `spec` and bring it to READY.
    ///
    /// On failure nothing stays behind: the pipeline is torn down and a partially created
    /// output file is removed.
    pub fn open(spec: &SessionSpec) -> Result<Self, EncodeError> {
        spec.validate()?;
        gst::init().map_err(|e| EncodeError::InitFailed { reason: e.to_string() })?;

        let StreamFormat::Compressed { codec, bitrate_bps } = spec.output.format else {
            return Err(EncodeError::Negotiation { reason: "output must be compressed".into() });
        };
        let StreamFormat::Raw { format, row_order } = spec.input.format else {
            return Err(EncodeError::Negotiation { reason: "input must be raw".into() });
        };

        let encoder = pick_encoder(codec)?;
        let frame_rate = spec.frame_rate();
        let fps = frame_rate.numerator / frame_rate.denominator.max(1);
        let desc = describe_pipeline(encoder, codec, bitrate_bps, row_order, fps);
        debug!("[GstEncodeSink] Pipeline: {}", desc);

        let pipeline = gst::parse::launch(&desc)
            .map_err(|e| EncodeError::InitFailed { reason: format!("pipeline parse: {e}") })?
            .downcast::<gst::Pipeline>()
            .map_err(|_| EncodeError::InitFailed { reason: "pipeline downcast failed".into() })?;
        let appsrc = pipeline
            .by_name("src")
            .and_then(|e| e.downcast::<AppSrc>().ok())
            .ok_or_else(|| EncodeError::InitFailed { reason: "appsrc element missing".into() })?;
        let bus = pipeline
            .bus()
            .ok_or_else(|| EncodeError::InitFailed { reason: "pipeline has no bus".into() })?;

        let sink = Self {
            pipeline,
            appsrc,
            bus,
            output_path: spec.output_path.clone(),
            sample_len: spec.input.resolution.packed_len(format),
            state: SinkState::Configured,
            last_pts_hns: None,
            written: 0,
        };

        if let Err(e) = sink.negotiate(spec, format, codec) {
            drop(sink);
            remove_partial_output(&spec.output_path);
            return Err(e);
        }

        info!(
            "[GstEncodeSink] Session ready: {} {} @{} {}kbps ({}) → {}",
            codec,
            spec.resolution(),
            frame_rate,
            bitrate_bps / 1000,
            encoder,
            spec.output_path.display()
        );
        Ok(sink)
    }

    fn negotiate(&self, spec: &SessionSpec, format: PixelFormat, codec: VideoCodec) -> Result<(), EncodeError> {
        self.appsrc.set_caps(Some(&input_caps(&spec.input, format)?));
        self.appsrc.set_format(gst::Format::Time);
        // push_buffer blocks once this many raw frames wait for the encoder.
        self.appsrc.set_block(true);
        self.appsrc.set_max_bytes((self.sample_len * QUEUED_FRAMES) as u64);

        let outcaps = self
            .pipeline
            .by_name("outcaps")
            .ok_or_else(|| EncodeError::InitFailed { reason: "capsfilter element missing".into() })?;
        outcaps.set_property("caps", output_caps(&spec.output, codec));

        let location = spec.output_path.to_str().ok_or_else(|| EncodeError::InitFailed {
            reason: format!("output path is not valid UTF-8: {}", spec.output_path.display()),
        })?;
        let filesink = self
            .pipeline
            .by_name("out")
            .ok_or_else(|| EncodeError::InitFailed { reason: "filesink element missing".into() })?;
        filesink.set_property("location", location);

        if let Some(adapter) = &spec.adapter {
            self.pipeline.set_context(&adapter_context(adapter));
            debug!("[GstEncodeSink] Adapter hint: {} (luid {:#x})", adapter.description, adapter.luid);
        }

        self.pipeline
            .set_state(gst::State::Ready)
            .map_err(|e| EncodeError::InitFailed { reason: format!("pipeline → Ready: {e}") })?;
        self.check_bus().map_err(|reason| EncodeError::Negotiation { reason })
    }

    /// First error posted on the bus since the last check, if any.
    fn check_bus(&self) -> Result<(), String> {
        match self.bus.pop_filtered(&[gst::MessageType::Error]) {
            Some(msg) => match msg.view() {
                gst::MessageView::Error(err) => Err(format!("{} ({:?})", err.error(), err.debug())),
                _ => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn invalid_state(&self, operation: &'static str) -> EncodeError {
        EncodeError::InvalidState { operation, state: self.state.name() }
    }

    /// Push end-of-stream and wait for the muxer to finish the file.
    fn drain(&self) -> Result<(), EncodeError> {
        self.appsrc
            .end_of_stream()
            .map_err(|e| EncodeError::FinalizeFailed { reason: format!("end_of_stream: {e:?}") })?;

        let timeout = gst::ClockTime::from_mseconds(FINALIZE_TIMEOUT.as_millis() as u64);
        match self
            .bus
            .timed_pop_filtered(timeout, &[gst::MessageType::Eos, gst::MessageType::Error])
        {
            Some(msg) => match msg.view() {
                gst::MessageView::Eos(..) => Ok(()),
                gst::MessageView::Error(err) => Err(EncodeError::FinalizeFailed {
                    reason: format!("{} ({:?})", err.error(), err.debug()),
                }),
                _ => Ok(()),
            },
            None => Err(EncodeError::FinalizeFailed {
                reason: format!("no end-of-stream within {}s", FINALIZE_TIMEOUT.as_secs()),
            }),
        }
    }
}

impl EncodeSink for GstEncodeSink {
    fn begin_writing(&mut self) -> Result<(), EncodeError> {
        if self.state != SinkState::Configured {
            return Err(self.invalid_state("begin writing"));
        }
        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| EncodeError::InitFailed { reason: format!("pipeline → Playing: {e}") })?;
        self.check_bus().map_err(|reason| EncodeError::InitFailed { reason })?;
        self.state = SinkState::Streaming;
        Ok(())
    }

    fn write_sample(&mut self, sample: MediaSample) -> Result<(), EncodeError> {
        if self.state != SinkState::Streaming {
            return Err(self.invalid_state("write a sample"));
        }
        if let Some(previous_hns) = self.last_pts_hns {
            if sample.pts_hns <= previous_hns {
                return Err(EncodeError::TimestampOrder { pts_hns: sample.pts_hns, previous_hns });
            }
        }
        if sample.len() != self.sample_len {
            return Err(EncodeError::WriteFailed {
                reason: format!("sample is {} bytes, session expects {}", sample.len(), self.sample_len),
            });
        }

        let pts = gst::ClockTime::from_nseconds(sample.pts_ns());
        let duration = gst::ClockTime::from_nseconds(sample.duration_ns());
        let mut buffer = gst::Buffer::from_slice(sample.data);
        {
            let buffer = buffer.make_mut();
            buffer.set_pts(pts);
            buffer.set_duration(duration);
        }

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| EncodeError::WriteFailed { reason: format!("push_buffer: {e:?}") })?;
        self.check_bus().map_err(|reason| EncodeError::WriteFailed { reason })?;

        self.last_pts_hns = Some(sample.pts_hns);
        self.written += 1;
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), EncodeError> {
        let previous = self.state;
        if previous == SinkState::Closed {
            return Err(self.invalid_state("finalize"));
        }
        self.state = SinkState::Closed;

        let drained = match previous {
            SinkState::Streaming => match self.drain() {
                // Some muxers refuse to close a stream without buffers.
                Err(e) if self.written == 0 => {
                    warn!("[GstEncodeSink] Empty stream closed: {e}");
                    Ok(())
                }
                drained => drained,
            },
            _ => Ok(()),
        };
        let stopped = self
            .pipeline
            .set_state(gst::State::Null)
            .map(|_| ())
            .map_err(|e| EncodeError::FinalizeFailed { reason: format!("pipeline → Null: {e}") });

        if previous == SinkState::Configured {
            // Never started: the file holds no playable stream.
            remove_partial_output(&self.output_path);
        }

        drained.and(stopped)?;
        info!(
            "[GstEncodeSink] Finalized {} ({} samples)",
            self.output_path.display(),
            self.written
        );
        Ok(())
    }
}

impl Drop for GstEncodeSink {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

fn remove_partial_output(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("[GstEncodeSink] Removed partial output {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("[GstEncodeSink] Could not remove {}: {e}", path.display()),
    }
}
