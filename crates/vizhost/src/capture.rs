//! Animation frame capture by parameter sweep.
//!
//! The engine's object enumeration is unreliable headless, so the driver
//! never goes looking for the swept parameter. It assigns `name = value`
//! for a short list of conventional names until one is accepted. `exists`
//! answers are used only to try likely names first.

use crate::config::CaptureConfig;
use crate::frame::{Frame, FrameSummary, RasterOptions};
use crate::instance::{EngineInstance, EngineSession};
use crate::result::{VizhostError, VizhostResult};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};

/// One point of the sweep
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Position in the sweep
    pub index: usize,
    /// Parameter value
    pub value: f64,
    /// Presentation timestamp
    pub timestamp_ms: u64,
}

/// `n` samples evenly spaced over `[0, sweep_end]`.
///
/// A single sample sits at 0.
#[must_use]
pub fn sample_schedule(frame_count: usize, sweep_end: f64, frame_delay_ms: u64) -> Vec<Sample> {
    let last = frame_count.saturating_sub(1);
    (0..frame_count)
        .map(|index| {
            let value = if last == 0 {
                0.0
            } else {
                index as f64 / last as f64 * sweep_end
            };
            Sample {
                index,
                value,
                timestamp_ms: index as u64 * frame_delay_ms,
            }
        })
        .collect()
}

/// What to sweep and how to capture it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepPlan {
    /// Frames to capture
    pub frame_count: usize,
    /// Spacing between frame timestamps
    pub frame_delay_ms: u64,
    /// Final parameter value
    pub sweep_end: f64,
    /// Parameter to try before the conventional names
    pub parameter: Option<String>,
    /// Raster options for every frame
    pub raster: RasterOptions,
}

impl SweepPlan {
    /// Sweep `[0, 1]` over `frame_count` frames
    #[must_use]
    pub fn new(frame_count: usize, frame_delay_ms: u64) -> Self {
        Self {
            frame_count,
            frame_delay_ms,
            sweep_end: 1.0,
            parameter: None,
            raster: RasterOptions::default(),
        }
    }

    /// Set the final parameter value
    #[must_use]
    pub const fn with_sweep_end(mut self, sweep_end: f64) -> Self {
        self.sweep_end = sweep_end;
        self
    }

    /// Name the swept parameter
    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>) -> Self {
        self.parameter = Some(name.into());
        self
    }

    /// Set raster options
    #[must_use]
    pub const fn with_raster(mut self, raster: RasterOptions) -> Self {
        self.raster = raster;
        self
    }

    /// Sample schedule for this plan
    #[must_use]
    pub fn samples(&self) -> Vec<Sample> {
        sample_schedule(self.frame_count, self.sweep_end, self.frame_delay_ms)
    }
}

/// Job-level problems that did not stop the capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptureWarning {
    /// Some frames failed to capture
    Shortfall {
        /// Frames captured
        captured: usize,
        /// Frames requested
        requested: usize,
    },
    /// No candidate name accepted an assignment in any sample
    ParameterUnset {
        /// Names tried
        tried: Vec<String>,
    },
    /// Every captured frame is bit-identical; the sweep did not animate anything
    IdenticalFrames {
        /// Frames compared
        frames: usize,
    },
}

impl std::fmt::Display for CaptureWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shortfall {
                captured,
                requested,
            } => write!(f, "captured {captured} of {requested} frames"),
            Self::ParameterUnset { tried } => {
                write!(f, "no parameter accepted a value (tried {})", tried.join(", "))
            }
            Self::IdenticalFrames { frames } => {
                write!(f, "all {frames} frames are identical; the parameter sweep had no visible effect")
            }
        }
    }
}

/// Result of one sweep
#[derive(Debug, Clone, PartialEq)]
pub struct AnimationCapture {
    /// Captured frames in ascending sample order
    pub frames: Vec<Frame>,
    /// Frames requested
    pub requested: usize,
    /// Name that accepted assignments, if any
    pub parameter: Option<String>,
    /// Job-level warnings
    pub warnings: Vec<CaptureWarning>,
}

impl AnimationCapture {
    /// Whether the sweep produced nothing but identical frames
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, CaptureWarning::IdenticalFrames { .. }))
    }

    /// Pixel-free description of the frames
    #[must_use]
    pub fn summaries(&self) -> Vec<FrameSummary> {
        self.frames.iter().map(FrameSummary::from).collect()
    }
}

/// Put likely names first without ever dropping one.
///
/// Order: the name that last worked, the caller's name, names the engine
/// reports as existing, then the remaining conventional names.
#[must_use]
pub fn candidate_order(
    sticky: Option<&str>,
    explicit: Option<&str>,
    present: &[String],
    conventional: &[String],
) -> Vec<String> {
    let mut order: Vec<String> = Vec::with_capacity(conventional.len() + 2);
    let mut push = |name: &str| {
        if !name.is_empty() && !order.iter().any(|n| n == name) {
            order.push(name.to_string());
        }
    };
    sticky.into_iter().for_each(&mut push);
    explicit.into_iter().for_each(&mut push);
    present.iter().for_each(|n| push(n));
    conventional.iter().for_each(|n| push(n));
    order
}

fn identical(frames: &[Frame]) -> bool {
    frames.len() >= 2 && frames.iter().all(|f| f.checksum() == frames[0].checksum())
}

/// Drives an instance through a parameter sweep
#[derive(Debug, Clone, Default)]
pub struct FrameCapturer {
    config: CaptureConfig,
}

impl FrameCapturer {
    /// Create a capturer
    #[must_use]
    pub const fn new(config: CaptureConfig) -> Self {
        Self { config }
    }

    /// Capture configuration
    #[must_use]
    pub const fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Sweep the parameter and capture one frame per sample.
    ///
    /// Holds one session for the whole sweep so no other caller's commands
    /// interleave with it. Per-frame failures are logged and skipped; the
    /// shortfall is reported as a warning.
    ///
    /// # Errors
    ///
    /// `Export` for an empty plan, `Connection` if the instance is not
    /// Ready or closes mid-sweep
    #[tracing::instrument(skip(self, instance, plan), fields(instance = %instance.id(), frames = plan.frame_count))]
    pub async fn capture(
        &self,
        instance: &EngineInstance,
        plan: &SweepPlan,
    ) -> VizhostResult<AnimationCapture> {
        if plan.frame_count == 0 {
            return Err(VizhostError::export("animation needs at least one frame"));
        }

        let session = instance.session().await?;
        let started = Instant::now();
        let present = self.present_candidates(&session, plan).await?;

        let mut sticky: Option<String> = None;
        let mut tried: Vec<String> = Vec::new();
        let mut frames = Vec::with_capacity(plan.frame_count);

        for sample in plan.samples() {
            let order = candidate_order(
                sticky.as_deref(),
                plan.parameter.as_deref(),
                &present,
                &self.config.parameter_candidates,
            );
            match set_parameter(&session, &order, sample.value).await? {
                Some(name) => sticky = Some(name),
                None => {
                    debug!(index = sample.index, value = sample.value, "no candidate accepted the value");
                    for name in order {
                        if !tried.contains(&name) {
                            tried.push(name);
                        }
                    }
                }
            }

            tokio::time::sleep(self.config.settle_delay()).await;

            match session.export_raster(plan.raster).await {
                Ok(image) => frames.push(Frame::new(sample.index, sample.value, sample.timestamp_ms, image)),
                Err(e) if e.is_connection() => return Err(e),
                Err(e) => warn!(index = sample.index, error = %e, "frame capture failed, skipping"),
            }
        }
        drop(session);

        let mut warnings = Vec::new();
        if frames.len() < plan.frame_count {
            warnings.push(CaptureWarning::Shortfall {
                captured: frames.len(),
                requested: plan.frame_count,
            });
        }
        if sticky.is_none() {
            warnings.push(CaptureWarning::ParameterUnset { tried });
        }
        if identical(&frames) {
            warnings.push(CaptureWarning::IdenticalFrames {
                frames: frames.len(),
            });
        }
        for warning in &warnings {
            warn!(%warning, "animation capture warning");
        }

        info!(
            captured = frames.len(),
            parameter = sticky.as_deref().unwrap_or("-"),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "animation captured"
        );
        Ok(AnimationCapture {
            frames,
            requested: plan.frame_count,
            parameter: sticky,
            warnings,
        })
    }

    async fn present_candidates(
        &self,
        session: &EngineSession<'_>,
        plan: &SweepPlan,
    ) -> VizhostResult<Vec<String>> {
        let mut present = Vec::new();
        let names = plan
            .parameter
            .iter()
            .chain(self.config.parameter_candidates.iter());
        for name in names {
            match session.exists(name).await {
                Ok(true) => present.push(name.clone()),
                Ok(false) => {}
                Err(e) if e.is_connection() => return Err(e),
                Err(e) => {
                    // A stalled probe would stall every later one too; fall
                    // back to plain assignment order.
                    debug!(name, error = %e, "introspection unavailable, skipping the rest");
                    break;
                }
            }
        }
        Ok(present)
    }
}

/// Try `name = value` for each name in order; returns the one that took.
async fn set_parameter(
    session: &EngineSession<'_>,
    order: &[String],
    value: f64,
) -> VizhostResult<Option<String>> {
    for name in order {
        match session.eval_command(&format!("{name} = {value}")).await {
            Ok(_) => return Ok(Some(name.clone())),
            Err(VizhostError::Command { message, .. }) => {
                debug!(name, %message, "candidate rejected");
            }
            Err(e) if e.is_connection() => return Err(e),
            Err(e) => warn!(name, error = %e, "candidate assignment failed"),
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::mock::{MockLauncher, MockOptions};
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    async fn instance(options: MockOptions) -> (EngineInstance, MockLauncher) {
        let launcher = MockLauncher::new(options);
        let instance = EngineInstance::new(
            EngineConfig::default()
                .with_viewport(16, 12)
                .with_poll_interval(5),
            Arc::new(launcher.clone()),
        );
        instance.initialize().await.unwrap();
        (instance, launcher)
    }

    fn capturer() -> FrameCapturer {
        FrameCapturer::new(CaptureConfig::default().with_settle_delay(0))
    }

    mod schedule_tests {
        use super::*;

        #[test]
        fn test_five_samples() {
            let values: Vec<f64> = sample_schedule(5, 2.0, 200).iter().map(|s| s.value).collect();
            assert_eq!(values, vec![0.0, 0.5, 1.0, 1.5, 2.0]);
            let stamps: Vec<u64> = sample_schedule(5, 2.0, 200).iter().map(|s| s.timestamp_ms).collect();
            assert_eq!(stamps, vec![0, 200, 400, 600, 800]);
        }

        #[test]
        fn test_single_sample_is_zero() {
            let samples = sample_schedule(1, 5.0, 100);
            assert_eq!(samples.len(), 1);
            assert!(samples[0].value.abs() < f64::EPSILON);
        }

        #[test]
        fn test_no_samples() {
            assert!(sample_schedule(0, 1.0, 100).is_empty());
        }

        proptest! {
            #[test]
            fn prop_schedule_spans_range(n in 2usize..200, end in 0.001f64..1000.0, delay in 0u64..5000) {
                let samples = sample_schedule(n, end, delay);
                prop_assert_eq!(samples.len(), n);
                prop_assert!(samples[0].value.abs() < f64::EPSILON);
                prop_assert!((samples[n - 1].value - end).abs() <= end * 1e-12);
                for pair in samples.windows(2) {
                    prop_assert!(pair[1].value > pair[0].value);
                    prop_assert_eq!(pair[1].timestamp_ms - pair[0].timestamp_ms, delay);
                }
            }
        }
    }

    mod order_tests {
        use super::*;

        fn names(list: &[&str]) -> Vec<String> {
            list.iter().map(ToString::to_string).collect()
        }

        #[test]
        fn test_conventional_only() {
            let order = candidate_order(None, None, &[], &names(&["t", "a", "k"]));
            assert_eq!(order, names(&["t", "a", "k"]));
        }

        #[test]
        fn test_explicit_then_present_then_rest() {
            let order = candidate_order(None, Some("speed"), &names(&["k"]), &names(&["t", "a", "k"]));
            assert_eq!(order, names(&["speed", "k", "t", "a"]));
        }

        #[test]
        fn test_sticky_goes_first() {
            let order = candidate_order(Some("a"), Some("speed"), &[], &names(&["t", "a"]));
            assert_eq!(order, names(&["a", "speed", "t"]));
        }

        #[test]
        fn test_introspection_never_excludes() {
            let conventional = names(&["t", "a", "k", "n"]);
            let order = candidate_order(None, None, &[], &conventional);
            assert_eq!(order.len(), conventional.len());
        }
    }

    mod sweep_tests {
        use super::*;

        #[tokio::test]
        async fn test_sweep_sets_parameter_per_frame() {
            let (instance, launcher) = instance(MockOptions::animated_by("t")).await;
            let plan = SweepPlan::new(5, 200).with_sweep_end(4.0);
            let capture = capturer().capture(&instance, &plan).await.unwrap();

            assert_eq!(capture.frames.len(), 5);
            assert_eq!(capture.parameter.as_deref(), Some("t"));
            assert!(capture.warnings.is_empty());
            assert_eq!(launcher.handles()[0].assignments("t"), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
            for (i, frame) in capture.frames.iter().enumerate() {
                assert_eq!(frame.index(), i);
                assert_eq!(frame.timestamp_ms(), i as u64 * 200);
            }
        }

        #[tokio::test]
        async fn test_existing_name_is_tried_first() {
            let (instance, launcher) = instance(MockOptions::animated_by("k")).await;
            let capture = capturer()
                .capture(&instance, &SweepPlan::new(3, 100))
                .await
                .unwrap();
            assert_eq!(capture.parameter.as_deref(), Some("k"));
            assert!(!capture.is_degenerate());
            assert!(launcher.handles()[0].assignments("t").is_empty());
        }

        #[tokio::test]
        async fn test_explicit_parameter_wins() {
            let (instance, _) =
                instance(MockOptions::animated_by("speed").with_broken_introspection()).await;
            let plan = SweepPlan::new(3, 100).with_parameter("speed");
            let capture = capturer().capture(&instance, &plan).await.unwrap();
            assert_eq!(capture.parameter.as_deref(), Some("speed"));
            assert!(!capture.is_degenerate());
        }

        #[tokio::test]
        async fn test_unreachable_parameter_is_flagged() {
            let (instance, _) =
                instance(MockOptions::animated_by("speed").with_broken_introspection()).await;
            let capture = capturer()
                .capture(&instance, &SweepPlan::new(4, 100))
                .await
                .unwrap();
            assert_eq!(capture.frames.len(), 4);
            assert!(capture.is_degenerate());
            assert!(capture
                .warnings
                .contains(&CaptureWarning::IdenticalFrames { frames: 4 }));
        }

        #[tokio::test]
        async fn test_no_candidate_accepted() {
            let (instance, _) = instance(MockOptions::animated_by("t")).await;
            let capturer = FrameCapturer::new(
                CaptureConfig::default()
                    .with_settle_delay(0)
                    .with_candidates(["p#", "q#"]),
            );
            let capture = capturer
                .capture(&instance, &SweepPlan::new(3, 100))
                .await
                .unwrap();
            assert!(capture.parameter.is_none());
            assert!(capture.warnings.contains(&CaptureWarning::ParameterUnset {
                tried: vec!["p#".to_string(), "q#".to_string()],
            }));
            assert!(capture.is_degenerate());
        }

        #[tokio::test]
        async fn test_failed_frames_are_skipped() {
            let options = MockOptions::animated_by("t").with_png_max_args(1).with_failing_png_calls(
                // second sample: all four signatures fail
                vec![4, 5, 6, 7],
            );
            let (instance, _) = instance(options).await;
            let capture = capturer()
                .capture(&instance, &SweepPlan::new(3, 100))
                .await
                .unwrap();

            let indexes: Vec<usize> = capture.frames.iter().map(Frame::index).collect();
            assert_eq!(indexes, vec![0, 2]);
            assert!(capture.warnings.contains(&CaptureWarning::Shortfall {
                captured: 2,
                requested: 3,
            }));
        }

        #[tokio::test]
        async fn test_empty_plan_is_rejected() {
            let (instance, _) = instance(MockOptions::default()).await;
            let err = capturer()
                .capture(&instance, &SweepPlan::new(0, 100))
                .await
                .unwrap_err();
            assert!(matches!(err, VizhostError::Export { .. }));
        }

        #[tokio::test]
        async fn test_hanging_introspection_falls_back_to_assignment() {
            let options = MockOptions::animated_by("t").with_stalled_introspection(Duration::from_secs(5));
            let launcher = MockLauncher::new(options);
            let instance = EngineInstance::new(
                EngineConfig::default()
                    .with_viewport(16, 12)
                    .with_poll_interval(5)
                    .with_command_timeout(50),
                Arc::new(launcher.clone()),
            );
            instance.initialize().await.unwrap();

            let started = Instant::now();
            let capture = capturer()
                .capture(&instance, &SweepPlan::new(3, 100))
                .await
                .unwrap();

            assert_eq!(capture.frames.len(), 3);
            assert_eq!(capture.parameter.as_deref(), Some("t"));
            assert_eq!(launcher.handles()[0].assignments("t"), vec![0.0, 0.5, 1.0]);
            assert!(started.elapsed() < Duration::from_secs(2));
            instance.cleanup().await;
        }

        #[tokio::test]
        async fn test_closed_instance() {
            let (instance, _) = instance(MockOptions::default()).await;
            instance.cleanup().await;
            let err = capturer()
                .capture(&instance, &SweepPlan::new(2, 100))
                .await
                .unwrap_err();
            assert!(err.is_connection());
        }
    }
}
