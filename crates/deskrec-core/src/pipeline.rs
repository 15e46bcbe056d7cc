//! `CapturePipeline`: one recording's acquire → transfer → pack → encode → finalize loop.
//!
//! ```text
//! Idle ─► Configuring ─► Streaming ─► Finalizing ─► Done
//!              │              │             │
//!              └──────────────┴─────────────┴──────► Failed(first error)
//! ```
//!
//! The loop is synchronous: one frame is in flight at a time and samples reach the encoder
//! in acquisition order.

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::RecorderConfig;
use crate::errors::{EncodeError, RecorderError};
use crate::sample::SampleBuilder;
use crate::sink::{EncodeSink, SessionSpec, StreamFormat};
use crate::source::{Acquired, CapturedFrame, FrameTransfer};

// ── Public types ──────────────────────────────────────────────────────────────

/// Lifecycle state of a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineState {
    Idle,
    Configuring,
    Streaming,
    Finalizing,
    Done,
    Failed(String),
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }
}

/// Progress update pushed to an observer via mpsc channel.
#[derive(Debug, Clone)]
pub struct PipelineStatus {
    pub state:          PipelineState,
    pub iteration:      u64,
    pub frames_written: u64,
    pub frames_skipped: u64,
}

/// Counters of a finished recording.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordingSummary {
    pub frames_written: u64,
    pub frames_skipped: u64,
    /// Presentation timestamp of the last written sample (100 ns units).
    pub last_pts_hns:   Option<u64>,
}

// ── CapturePipeline ───────────────────────────────────────────────────────────

/// Drives one fixed-length recording from a capture source into an encoder.
pub struct CapturePipeline<S> {
    config:    RecorderConfig,
    source:    S,
    state:     PipelineState,
    summary:   RecordingSummary,
    iteration: u64,
    status_tx: Option<mpsc::Sender<PipelineStatus>>,
}

impl<S: FrameTransfer> CapturePipeline<S> {
    pub fn new(config: RecorderConfig, source: S) -> Self {
        Self {
            config,
            source,
            state: PipelineState::Idle,
            summary: RecordingSummary::default(),
            iteration: 0,
            status_tx: None,
        }
    }

    /// Publish state changes and per-frame progress on `status_tx` (best-effort, never blocks).
    pub fn with_status(mut self, status_tx: mpsc::Sender<PipelineStatus>) -> Self {
        self.status_tx = Some(status_tx);
        self
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn summary(&self) -> RecordingSummary {
        self.summary
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Tear the pipeline down, handing back the capture source.
    pub fn into_source(self) -> S {
        self.source
    }

    /// Run the recording to completion.
    ///
    /// `open` creates the encoder session from the negotiated [`SessionSpec`]. If it succeeds,
    /// the session is finalized exactly once whatever happens afterwards. The first error
    /// encountered is the one returned.
    pub fn run<E, F>(&mut self, open: F) -> Result<RecordingSummary, RecorderError>
    where
        E: EncodeSink,
        F: FnOnce(&SessionSpec) -> Result<E, EncodeError>,
    {
        if self.state != PipelineState::Idle {
            return Err(RecorderError::ConfigurationInvalid {
                reason: format!("pipeline cannot run from state {:?}", self.state),
            });
        }

        self.transition(PipelineState::Configuring);
        let (spec, mut sink) = match self.configure(open) {
            Ok(opened) => opened,
            Err(e) => return Err(self.fail(e)),
        };

        self.transition(PipelineState::Streaming);
        let streamed = self.stream(&spec, &mut sink);

        self.transition(PipelineState::Finalizing);
        info!("Finalizing output {}", self.config.output_path.display());
        let finalized = sink.finalize();

        let outcome = match (streamed, finalized) {
            (Ok(()), Ok(())) => Ok(self.summary),
            (Ok(()), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(finalize_err)) => {
                warn!("Finalize also failed after streaming error: {finalize_err}");
                Err(e)
            }
        };

        match outcome {
            Ok(summary) => {
                self.transition(PipelineState::Done);
                info!(
                    "Recording done: {} frames written, {} skipped",
                    summary.frames_written, summary.frames_skipped
                );
                Ok(summary)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    // ── Phases ────────────────────────────────────────────────────────────

    fn configure<E, F>(&mut self, open: F) -> Result<(SessionSpec, E), RecorderError>
    where
        E: EncodeSink,
        F: FnOnce(&SessionSpec) -> Result<E, EncodeError>,
    {
        self.config.validate()?;

        let resolution = self.source.resolution();
        let spec = SessionSpec::new(&self.config, resolution, self.source.adapter());
        spec.validate()?;

        info!(
            "Configuring encoder for {} @ {} fps, {} bps {} → {}",
            resolution,
            spec.frame_rate(),
            self.config.bitrate_bps,
            self.config.codec,
            spec.output_path.display()
        );
        let sink = open(&spec)?;
        Ok((spec, sink))
    }

    fn stream<E: EncodeSink>(&mut self, spec: &SessionSpec, sink: &mut E) -> Result<(), RecorderError> {
        sink.begin_writing()?;

        // Samples carry the pixel format the encoder was opened with.
        let format = match spec.input.format {
            StreamFormat::Raw { format, .. } => format,
            StreamFormat::Compressed { .. } => self.source.pixel_format(),
        };
        let builder = SampleBuilder::new(spec.resolution(), format, self.config.frame_duration_hns());
        let timeout = self.config.acquire_timeout();
        let total = self.config.frame_count();
        let mut pts_hns = 0u64;

        info!("Capture loop started: {total} iterations");
        for i in 0..total {
            self.iteration = i;
            match self.source.acquire(timeout)? {
                Acquired::Timeout => {
                    self.summary.frames_skipped += 1;
                    warn!("Skipping frame {i}: no desktop update within {timeout:?}");
                }
                Acquired::Frame(frame) => {
                    let written = encode_frame(&mut self.source, &builder, sink, &frame, pts_hns);
                    drop(frame);
                    let released = self.source.release();
                    written?;
                    // The sample is in the encoder even if the release below fails.
                    self.summary.frames_written += 1;
                    self.summary.last_pts_hns = Some(pts_hns);
                    released?;

                    debug!("Wrote frame {i} pts={pts_hns}");
                    pts_hns += builder.frame_duration_hns();
                }
            }
            self.report();
        }
        info!("Capture loop finished");
        Ok(())
    }

    // ── State bookkeeping ─────────────────────────────────────────────────

    fn transition(&mut self, state: PipelineState) {
        debug!("Pipeline {:?} → {:?}", self.state, state);
        self.state = state;
        self.report();
    }

    fn fail(&mut self, err: RecorderError) -> RecorderError {
        error!("Recording failed: {err}");
        self.transition(PipelineState::Failed(err.to_string()));
        err
    }

    fn report(&self) {
        if let Some(tx) = &self.status_tx {
            let _ = tx.try_send(PipelineStatus {
                state:          self.state.clone(),
                iteration:      self.iteration,
                frames_written: self.summary.frames_written,
                frames_skipped: self.summary.frames_skipped,
            });
        }
    }
}

/// Transfer, pack and submit one acquired frame. The staging map is released before the
/// sample is written.
fn encode_frame<S, E>(
    source: &mut S,
    builder: &SampleBuilder,
    sink: &mut E,
    frame: &S::Frame,
    pts_hns: u64,
) -> Result<(), RecorderError>
where
    S: FrameTransfer,
    E: EncodeSink,
{
    let actual = frame.resolution();
    if actual != builder.resolution() {
        return Err(RecorderError::ResolutionChanged { expected: builder.resolution(), actual });
    }

    let sample = {
        let staging = source.copy_to_staging(frame)?;
        builder.build(&staging, pts_hns)?
    };
    sink.write_sample(sample)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{CaptureError, ErrorCategory};
    use crate::source::{FrameSource, StagingBuffer};
    use crate::types::{MediaSample, PixelFormat, Resolution};
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::time::Duration;

    const RES: Resolution = Resolution { width: 4, height: 2 };
    const PITCH: usize = 32;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Step {
        Frame,
        Timeout,
        Fail,
        Resized,
    }

    struct MockFrame {
        resolution: Resolution,
    }

    impl CapturedFrame for MockFrame {
        fn resolution(&self) -> Resolution {
            self.resolution
        }
    }

    /// Plays back a fixed sequence of acquisition outcomes, then `fallback` forever.
    struct ScriptedSource {
        script:        VecDeque<Step>,
        fallback:      Step,
        outstanding:   bool,
        acquired:      u32,
        released:      u32,
        overlapped:    u32,
        copies:        u32,
        fail_copy_at:  Option<u32>,
        fail_release_at: Option<u32>,
        unmapped:      Rc<Cell<u32>>,
        pixels:        Vec<u8>,
    }

    impl ScriptedSource {
        fn new(script: impl IntoIterator<Item = Step>, fallback: Step) -> Self {
            Self {
                script: script.into_iter().collect(),
                fallback,
                outstanding: false,
                acquired: 0,
                released: 0,
                overlapped: 0,
                copies: 0,
                fail_copy_at: None,
                fail_release_at: None,
                unmapped: Rc::new(Cell::new(0)),
                pixels: vec![0; PITCH * RES.height as usize],
            }
        }

        fn frames(n: usize) -> Self {
            Self::new(std::iter::repeat(Step::Frame).take(n), Step::Frame)
        }
    }

    impl FrameSource for ScriptedSource {
        type Frame = MockFrame;

        fn resolution(&self) -> Resolution {
            RES
        }

        fn acquire(&mut self, _timeout: Duration) -> Result<Acquired<MockFrame>, CaptureError> {
            if self.outstanding {
                self.overlapped += 1;
                return Err(CaptureError::FrameOutstanding);
            }
            let step = self.script.pop_front().unwrap_or(self.fallback);
            let resolution = match step {
                Step::Timeout => return Ok(Acquired::Timeout),
                Step::Fail => return Err(CaptureError::AcquireFailed { reason: "device removed".into() }),
                Step::Frame => RES,
                Step::Resized => Resolution::new(8, 8),
            };
            self.outstanding = true;
            self.acquired += 1;
            Ok(Acquired::Frame(MockFrame { resolution }))
        }

        fn release(&mut self) -> Result<(), CaptureError> {
            if !self.outstanding {
                return Err(CaptureError::NoFrameOutstanding);
            }
            self.outstanding = false;
            self.released += 1;
            if self.fail_release_at == Some(self.released) {
                return Err(CaptureError::AccessLost);
            }
            Ok(())
        }
    }

    impl FrameTransfer for ScriptedSource {
        fn copy_to_staging(&mut self, frame: &MockFrame) -> Result<StagingBuffer<'_>, CaptureError> {
            self.copies += 1;
            if self.fail_copy_at == Some(self.copies) {
                return Err(CaptureError::CopyFailed { reason: "E_OUTOFMEMORY".into() });
            }
            self.pixels.fill(self.copies as u8);
            let unmapped = Rc::clone(&self.unmapped);
            Ok(StagingBuffer::new(&self.pixels, PITCH, frame.resolution)
                .on_unmap(move || unmapped.set(unmapped.get() + 1)))
        }
    }

    #[derive(Default)]
    struct SinkLog {
        began:          u32,
        written:        Vec<u64>,
        formats:        Vec<PixelFormat>,
        finalized:      u32,
        fail_write_at:  Option<usize>,
        fail_finalize:  bool,
    }

    struct RecordingSink {
        log: Rc<RefCell<SinkLog>>,
    }

    impl EncodeSink for RecordingSink {
        fn begin_writing(&mut self) -> Result<(), EncodeError> {
            self.log.borrow_mut().began += 1;
            Ok(())
        }

        fn write_sample(&mut self, sample: MediaSample) -> Result<(), EncodeError> {
            let mut log = self.log.borrow_mut();
            if log.fail_write_at == Some(log.written.len()) {
                return Err(EncodeError::WriteFailed { reason: "flow error".into() });
            }
            assert_eq!(sample.len(), RES.packed_len(sample.format));
            log.written.push(sample.pts_hns);
            log.formats.push(sample.format);
            Ok(())
        }

        fn finalize(&mut self) -> Result<(), EncodeError> {
            let mut log = self.log.borrow_mut();
            log.finalized += 1;
            if log.fail_finalize {
                return Err(EncodeError::FinalizeFailed { reason: "mux error".into() });
            }
            Ok(())
        }
    }

    fn config(fps: u32, secs: u32) -> RecorderConfig {
        RecorderConfig { target_fps: fps, duration_secs: secs, ..Default::default() }
    }

    fn run(
        cfg: RecorderConfig,
        source: ScriptedSource,
        log: &Rc<RefCell<SinkLog>>,
    ) -> (CapturePipeline<ScriptedSource>, Result<RecordingSummary, RecorderError>) {
        let mut pipeline = CapturePipeline::new(cfg, source);
        let sink_log = Rc::clone(log);
        let result = pipeline.run(move |_spec| Ok(RecordingSink { log: sink_log }));
        (pipeline, result)
    }

    #[test]
    fn five_seconds_at_thirty_fps_writes_150_samples() {
        let log = Rc::new(RefCell::new(SinkLog::default()));
        let (pipeline, result) = run(config(30, 5), ScriptedSource::frames(150), &log);

        let summary = result.expect("clean run");
        let log = log.borrow();
        assert_eq!(log.written.len(), 150);
        assert_eq!(*log.written.last().unwrap(), 149 * (10_000_000 / 30));
        assert_eq!(summary.last_pts_hns, Some(149 * 333_333));
        assert_eq!(log.began, 1);
        assert_eq!(log.finalized, 1);
        assert_eq!(pipeline.state(), &PipelineState::Done);

        let source = pipeline.source();
        assert_eq!(source.acquired, 150);
        assert_eq!(source.released, 150);
        assert_eq!(source.unmapped.get(), 150);
    }

    #[test]
    fn timeouts_do_not_consume_timestamps() {
        use Step::*;
        let log = Rc::new(RefCell::new(SinkLog::default()));
        let script = [Frame, Timeout, Timeout, Frame, Frame, Timeout, Frame, Timeout, Timeout, Frame];
        let (pipeline, result) = run(config(10, 1), ScriptedSource::new(script, Timeout), &log);

        let summary = result.expect("timeouts are not failures");
        assert_eq!(summary.frames_written, 5);
        assert_eq!(summary.frames_skipped, 5);
        let d = 1_000_000;
        assert_eq!(log.borrow().written, vec![0, d, 2 * d, 3 * d, 4 * d]);
        assert_eq!(pipeline.source().released, 5);
    }

    #[test]
    fn all_timeouts_still_finalize_an_empty_stream() {
        let log = Rc::new(RefCell::new(SinkLog::default()));
        let (pipeline, result) =
            run(config(30, 5), ScriptedSource::new([], Step::Timeout), &log);

        let summary = result.expect("all-timeout run is Done");
        assert_eq!(summary.frames_written, 0);
        assert_eq!(summary.frames_skipped, 150);
        assert_eq!(summary.last_pts_hns, None);
        assert!(log.borrow().written.is_empty());
        assert_eq!(log.borrow().finalized, 1);
        assert_eq!(pipeline.state(), &PipelineState::Done);
        assert_eq!(pipeline.source().acquired, 0);
        assert_eq!(pipeline.source().released, 0);
    }

    #[test]
    fn write_failure_at_iteration_80_keeps_80_samples_and_reports_write_error() {
        let log = Rc::new(RefCell::new(SinkLog { fail_write_at: Some(80), ..Default::default() }));
        let (pipeline, result) = run(config(30, 5), ScriptedSource::frames(150), &log);

        let err = result.expect_err("write failure aborts the run");
        assert!(matches!(err, RecorderError::Encode(EncodeError::WriteFailed { .. })));
        assert_eq!(err.category(), ErrorCategory::PerFrame);
        assert_eq!(log.borrow().written.len(), 80);
        assert_eq!(log.borrow().finalized, 1);
        assert!(matches!(pipeline.state(), PipelineState::Failed(_)));

        let source = pipeline.source();
        assert_eq!(source.acquired, 81, "no frame acquired after the failure");
        assert_eq!(source.released, 81, "failing frame is still released");
    }

    #[test]
    fn acquire_release_pairing_over_mixed_outcomes() {
        use Step::*;
        let log = Rc::new(RefCell::new(SinkLog::default()));
        let script = [Frame, Timeout, Frame, Frame, Timeout, Fail];
        let (pipeline, result) = run(config(30, 1), ScriptedSource::new(script, Frame), &log);

        assert!(matches!(
            result,
            Err(RecorderError::Capture(CaptureError::AcquireFailed { .. }))
        ));
        let source = pipeline.source();
        assert_eq!(source.acquired, 3);
        assert_eq!(source.released, 3);
        assert_eq!(source.overlapped, 0, "never more than one outstanding frame");
        assert!(!source.outstanding);
        assert_eq!(log.borrow().finalized, 1);
    }

    #[test]
    fn transfer_failure_releases_frame_and_finalizes() {
        let log = Rc::new(RefCell::new(SinkLog::default()));
        let mut source = ScriptedSource::frames(30);
        source.fail_copy_at = Some(4);
        let (pipeline, result) = run(config(30, 1), source, &log);

        assert!(matches!(
            result,
            Err(RecorderError::Capture(CaptureError::CopyFailed { .. }))
        ));
        let source = pipeline.source();
        assert_eq!(source.acquired, 4);
        assert_eq!(source.released, 4);
        assert_eq!(source.unmapped.get(), 3, "only successful maps are unmapped");
        assert_eq!(log.borrow().written.len(), 3);
        assert_eq!(log.borrow().finalized, 1);
    }

    #[test]
    fn resolution_change_mid_recording_fails_the_frame() {
        use Step::*;
        let log = Rc::new(RefCell::new(SinkLog::default()));
        let (pipeline, result) =
            run(config(30, 1), ScriptedSource::new([Frame, Resized], Frame), &log);

        assert!(matches!(result, Err(RecorderError::ResolutionChanged { .. })));
        assert_eq!(pipeline.source().released, 2);
        assert_eq!(log.borrow().written.len(), 1);
        assert_eq!(log.borrow().finalized, 1);
    }

    #[test]
    fn open_failure_skips_streaming_and_finalize() {
        let mut pipeline = CapturePipeline::new(config(30, 1), ScriptedSource::frames(30));
        let result = pipeline.run(|_spec| -> Result<RecordingSink, EncodeError> {
            Err(EncodeError::Negotiation { reason: "no H.264 encoder".into() })
        });

        let err = result.expect_err("setup failure");
        assert_eq!(err.category(), ErrorCategory::Setup);
        assert!(matches!(pipeline.state(), PipelineState::Failed(_)));
        assert_eq!(pipeline.source().acquired, 0);
    }

    #[test]
    fn finalize_failure_surfaces_after_clean_stream() {
        let log = Rc::new(RefCell::new(SinkLog { fail_finalize: true, ..Default::default() }));
        let (_, result) = run(config(10, 1), ScriptedSource::frames(10), &log);

        let err = result.expect_err("finalize failure is reported");
        assert_eq!(err.category(), ErrorCategory::Finalize);
        assert_eq!(log.borrow().written.len(), 10);
    }

    #[test]
    fn streaming_error_takes_priority_over_finalize_error() {
        let log = Rc::new(RefCell::new(SinkLog {
            fail_write_at: Some(2),
            fail_finalize: true,
            ..Default::default()
        }));
        let (_, result) = run(config(10, 1), ScriptedSource::frames(10), &log);

        assert!(matches!(
            result,
            Err(RecorderError::Encode(EncodeError::WriteFailed { .. }))
        ));
        assert_eq!(log.borrow().finalized, 1);
    }

    #[test]
    fn pipeline_runs_only_once() {
        let log = Rc::new(RefCell::new(SinkLog::default()));
        let (mut pipeline, result) = run(config(2, 1), ScriptedSource::frames(2), &log);
        assert!(result.is_ok());

        let again = pipeline.run(|_spec| Ok(RecordingSink { log: Rc::clone(&log) }));
        assert!(again.is_err());
        assert_eq!(log.borrow().finalized, 1);
    }

    #[test]
    fn publishes_state_transitions() {
        let (tx, mut rx) = mpsc::channel(64);
        let log = Rc::new(RefCell::new(SinkLog::default()));
        let sink_log = Rc::clone(&log);
        let mut pipeline =
            CapturePipeline::new(config(3, 1), ScriptedSource::frames(3)).with_status(tx);
        pipeline.run(move |_spec| Ok(RecordingSink { log: sink_log })).unwrap();

        let mut states = Vec::new();
        let mut last = None;
        while let Ok(status) = rx.try_recv() {
            if states.last() != Some(&status.state) {
                states.push(status.state.clone());
            }
            last = Some(status);
        }
        assert_eq!(
            states,
            vec![
                PipelineState::Configuring,
                PipelineState::Streaming,
                PipelineState::Finalizing,
                PipelineState::Done,
            ]
        );
        assert_eq!(last.unwrap().frames_written, 3);
    }

    #[test]
    fn release_failure_still_counts_the_written_sample() {
        let log = Rc::new(RefCell::new(SinkLog::default()));
        let mut source = ScriptedSource::frames(10);
        source.fail_release_at = Some(3);
        let (pipeline, result) = run(config(30, 1), source, &log);

        assert!(matches!(result, Err(RecorderError::Capture(CaptureError::AccessLost))));
        assert_eq!(log.borrow().written.len(), 3);
        let summary = pipeline.summary();
        assert_eq!(summary.frames_written, 3);
        assert_eq!(summary.last_pts_hns, Some(2 * 333_333));
        assert_eq!(log.borrow().finalized, 1);
    }

    #[test]
    fn samples_use_the_negotiated_input_format() {
        let log = Rc::new(RefCell::new(SinkLog::default()));
        let (_, result) = run(config(10, 1), ScriptedSource::frames(10), &log);

        result.unwrap();
        let log = log.borrow();
        assert_eq!(log.formats.len(), 10);
        assert!(log.formats.iter().all(|&f| f == PixelFormat::Bgrx8));
    }
}
