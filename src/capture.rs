//! Capture/timing loop: drives the estimator at a fixed cadence and hands
//! each normalized pose to a [`FrameSink`].
//!
//! At most one inference is outstanding. The next tick is scheduled only
//! after the previous call finishes, so the observed interval is
//! `latency + period`, never shorter.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{Config, TriggerMode};
use crate::error::{RelayError, Result};
use crate::logging::Logger;
use crate::pose::{KeypointIndex, NormalizedVector, Normalizer, PoseEstimator};
use crate::{log, vlog};

/// Where normalized frames go next (usually the transport channel).
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: NormalizedVector) -> Result<()>;
}

/// What starts an inference.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Every tick
    Periodic,
    /// Only on ticks where the flag was raised. Raising it several times
    /// before the tick still yields a single inference.
    Manual(Arc<AtomicBool>),
}

impl Trigger {
    pub fn from_mode(mode: TriggerMode) -> (Self, Option<Arc<AtomicBool>>) {
        match mode {
            TriggerMode::Periodic => (Trigger::Periodic, None),
            TriggerMode::Manual => {
                let flag = Arc::new(AtomicBool::new(false));
                (Trigger::Manual(Arc::clone(&flag)), Some(flag))
            }
        }
    }

    fn take(&self) -> bool {
        match self {
            Trigger::Periodic => true,
            Trigger::Manual(flag) => flag.swap(false, Ordering::AcqRel),
        }
    }
}

/// Capture settings and the loop's runtime state, owned by the loop.
#[derive(Debug, Clone)]
pub struct CaptureContext {
    normalizer: Normalizer,
    warmed_up: bool,
    frames: u64,
}

impl CaptureContext {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            normalizer: Normalizer::new(width, height),
            warmed_up: false,
            frames: 0,
        }
    }

    /// Frames delivered to a sink since start
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

/// Single-slot controller: one outstanding call, bounded backoff on failure.
#[derive(Debug, Clone)]
pub struct TaskController {
    outstanding: bool,
    consecutive_failures: u32,
    period: Duration,
    max_backoff: Duration,
}

impl TaskController {
    pub fn new(period: Duration, max_backoff: Duration) -> Self {
        Self {
            outstanding: false,
            consecutive_failures: 0,
            period,
            max_backoff: max_backoff.max(period),
        }
    }

    /// Claim the slot. `false` while a call is outstanding.
    pub fn try_begin(&mut self) -> bool {
        if self.outstanding {
            return false;
        }
        self.outstanding = true;
        true
    }

    pub fn is_outstanding(&self) -> bool {
        self.outstanding
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Release the slot and return the delay before the next tick.
    pub fn complete(&mut self, success: bool) -> Duration {
        self.outstanding = false;
        if success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
        self.next_delay()
    }

    /// Release the slot and forget past failures. Used when the downstream
    /// channel, not the estimator, failed.
    pub fn reset(&mut self) {
        self.outstanding = false;
        self.consecutive_failures = 0;
    }

    pub fn next_delay(&self) -> Duration {
        if self.consecutive_failures == 0 {
            return self.period;
        }
        let shift = (self.consecutive_failures - 1).min(16);
        self.period
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Frame normalized and handed to the sink
    Sent,
    /// Inference failed or timed out; retried on a later tick
    Failed,
    /// No trigger this tick
    Idle,
}

#[derive(Debug, Default)]
struct WindowStats {
    frames: u32,
    failures: u32,
    inference_ms: f64,
}

pub struct CaptureLoop<E> {
    context: CaptureContext,
    controller: TaskController,
    estimator: E,
    trigger: Trigger,
    warmup: Duration,
    period: Duration,
    inference_timeout: Duration,
    logger: Logger,
    window: WindowStats,
    window_start: Instant,
}

impl<E: PoseEstimator> CaptureLoop<E> {
    pub fn new(config: &Config, estimator: E, trigger: Trigger, logger: Logger) -> Self {
        let timing = &config.timing;
        Self {
            context: CaptureContext::new(config.capture.width, config.capture.height),
            controller: TaskController::new(timing.period(), timing.max_backoff()),
            estimator,
            trigger,
            warmup: timing.warmup(),
            period: timing.period(),
            inference_timeout: timing.inference_timeout(),
            logger,
            window: WindowStats::default(),
            window_start: Instant::now(),
        }
    }

    pub fn context(&self) -> &CaptureContext {
        &self.context
    }

    pub fn controller(&self) -> &TaskController {
        &self.controller
    }

    /// One tick: at most one inference, normalized and forwarded.
    ///
    /// Inference failures and timeouts come back as `Ok(Failed)`. A broken
    /// keypoint contract or a sink failure is returned as an error. A sink
    /// failure leaves no backoff behind for the next session.
    pub async fn step<S: FrameSink + ?Sized>(&mut self, sink: &mut S) -> Result<StepOutcome> {
        if !self.trigger.take() || !self.controller.try_begin() {
            return Ok(StepOutcome::Idle);
        }

        let started = Instant::now();
        let result = match tokio::time::timeout(self.inference_timeout, self.estimator.estimate()).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::InferenceTimeout(self.inference_timeout)),
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let keypoints = match result {
            Ok(kps) => kps,
            Err(e) if e.is_inference_failure() => {
                let delay = self.controller.complete(false);
                self.window.failures += 1;
                log!(
                    self.logger,
                    "[capture] {e} (attempt {}, retry in {}ms)",
                    self.controller.consecutive_failures(),
                    delay.as_millis()
                );
                return Ok(StepOutcome::Failed);
            }
            Err(e) => {
                self.controller.complete(false);
                return Err(e);
            }
        };

        let frame = match self.context.normalizer.normalize_keypoints(&keypoints) {
            Ok(frame) => frame,
            Err(e) => {
                self.controller.complete(false);
                return Err(e);
            }
        };

        let (nose_x, nose_y, nose_score) = frame.triple(KeypointIndex::Nose);
        if let Err(e) = sink.send_frame(frame).await {
            self.controller.reset();
            return Err(e);
        }
        self.controller.complete(true);

        self.context.frames += 1;
        self.window.frames += 1;
        self.window.inference_ms += elapsed_ms;
        vlog!(
            self.logger,
            "[capture] frame {} ({:.1}ms) nose=({:.3}, {:.3}) score={:.2}",
            self.context.frames,
            elapsed_ms,
            nose_x,
            nose_y,
            nose_score
        );
        Ok(StepOutcome::Sent)
    }

    /// Warm up once, then tick until the sink fails or the estimator
    /// breaks its output contract.
    pub async fn run<S: FrameSink + ?Sized>(&mut self, sink: &mut S) -> Result<()> {
        if !self.context.warmed_up {
            log!(self.logger, "[capture] warming up for {}ms", self.warmup.as_millis());
            tokio::time::sleep(self.warmup).await;
            self.context.warmed_up = true;
        }
        self.window_start = Instant::now();

        loop {
            let delay = match self.step(sink).await? {
                StepOutcome::Idle => self.period,
                StepOutcome::Sent | StepOutcome::Failed => self.controller.next_delay(),
            };
            self.report_window();
            tokio::time::sleep(delay).await;
        }
    }

    fn report_window(&mut self) {
        if self.window_start.elapsed() < Duration::from_secs(1) {
            return;
        }
        let w = std::mem::take(&mut self.window);
        let avg = if w.frames > 0 { w.inference_ms / w.frames as f64 } else { 0.0 };
        log!(
            self.logger,
            "[fps] {} (infer={:.1}ms failures={})",
            w.frames,
            avg,
            w.failures
        );
        self.window_start = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::{Keypoint, ReplayEstimator};

    struct ScriptedEstimator {
        latency: Duration,
        fail_calls: Vec<usize>,
        stall_calls: Vec<usize>,
        keypoint_count: usize,
        calls: usize,
    }

    impl ScriptedEstimator {
        fn new(latency: Duration) -> Self {
            Self {
                latency,
                fail_calls: Vec::new(),
                stall_calls: Vec::new(),
                keypoint_count: KeypointIndex::COUNT,
                calls: 0,
            }
        }
    }

    #[async_trait]
    impl PoseEstimator for ScriptedEstimator {
        async fn estimate(&mut self) -> Result<Vec<Keypoint>> {
            let call = self.calls;
            self.calls += 1;
            if self.stall_calls.contains(&call) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            tokio::time::sleep(self.latency).await;
            if self.fail_calls.contains(&call) {
                return Err(RelayError::Inference(format!("call {call} rejected")));
            }
            Ok(vec![Keypoint::new(640.0, 360.0, 0.9); self.keypoint_count])
        }
    }

    struct RecordingSink {
        times: Vec<Instant>,
        frames: Vec<NormalizedVector>,
        limit: usize,
    }

    impl RecordingSink {
        fn new(limit: usize) -> Self {
            Self { times: Vec::new(), frames: Vec::new(), limit }
        }
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_frame(&mut self, frame: NormalizedVector) -> Result<()> {
            self.times.push(Instant::now());
            self.frames.push(frame);
            if self.frames.len() >= self.limit {
                return Err(RelayError::Channel("limit reached".into()));
            }
            Ok(())
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.timing.period_ms = 33;
        config.timing.warmup_ms = 1000;
        config.timing.inference_timeout_ms = 500;
        config.timing.max_backoff_ms = 1000;
        config
    }

    #[test]
    fn test_controller_single_flight() {
        let mut c = TaskController::new(Duration::from_millis(33), Duration::from_secs(1));
        assert!(c.try_begin());
        assert!(c.is_outstanding());
        assert!(!c.try_begin());
        c.complete(true);
        assert!(!c.is_outstanding());
        assert!(c.try_begin());
    }

    #[test]
    fn test_controller_backoff_bounded_and_reset() {
        let mut c = TaskController::new(Duration::from_millis(33), Duration::from_millis(1000));
        assert_eq!(c.complete(false), Duration::from_millis(33));
        assert_eq!(c.complete(false), Duration::from_millis(66));
        assert_eq!(c.complete(false), Duration::from_millis(132));
        for _ in 0..40 {
            c.complete(false);
        }
        assert_eq!(c.next_delay(), Duration::from_millis(1000));
        assert_eq!(c.complete(true), Duration::from_millis(33));
        assert_eq!(c.consecutive_failures(), 0);
    }

    #[test]
    fn test_controller_backoff_never_below_period() {
        let mut c = TaskController::new(Duration::from_millis(50), Duration::from_millis(10));
        assert_eq!(c.complete(false), Duration::from_millis(50));
        assert_eq!(c.complete(false), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_includes_inference_latency() {
        let latency = Duration::from_millis(50);
        let mut capture = CaptureLoop::new(
            &config(),
            ScriptedEstimator::new(latency),
            Trigger::Periodic,
            Logger::stderr(false),
        );
        let start = Instant::now();
        let mut sink = RecordingSink::new(6);

        let err = capture.run(&mut sink).await.unwrap_err();
        assert!(matches!(err, RelayError::Channel(_)));
        assert_eq!(sink.times.len(), 6);

        assert!(sink.times[0] - start >= Duration::from_millis(1000) + latency);
        for pair in sink.times.windows(2) {
            assert!(pair[1] - pair[0] >= latency + Duration::from_millis(33));
        }
        assert_eq!(capture.estimator.calls, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inference_failure_does_not_stop_loop() {
        let mut estimator = ScriptedEstimator::new(Duration::from_millis(5));
        estimator.fail_calls = vec![1, 2];
        let mut capture =
            CaptureLoop::new(&config(), estimator, Trigger::Periodic, Logger::stderr(false));
        let mut sink = RecordingSink::new(3);

        assert!(capture.run(&mut sink).await.is_err());
        assert_eq!(sink.frames.len(), 3);
        assert_eq!(capture.estimator.calls, 5);
        assert!(!capture.controller().is_outstanding());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_inference_times_out() {
        let mut estimator = ScriptedEstimator::new(Duration::from_millis(5));
        estimator.stall_calls = vec![0];
        let mut capture =
            CaptureLoop::new(&config(), estimator, Trigger::Periodic, Logger::stderr(false));
        let mut sink = RecordingSink::new(10);

        let started = Instant::now();
        assert_eq!(capture.step(&mut sink).await.unwrap(), StepOutcome::Failed);
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_secs(3600));
        assert!(!capture.controller().is_outstanding());

        assert_eq!(capture.step(&mut sink).await.unwrap(), StepOutcome::Sent);
        assert_eq!(sink.frames.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_keypoint_count_stops_loop() {
        let mut estimator = ScriptedEstimator::new(Duration::from_millis(5));
        estimator.keypoint_count = 16;
        let mut capture =
            CaptureLoop::new(&config(), estimator, Trigger::Periodic, Logger::stderr(false));
        let mut sink = RecordingSink::new(10);

        let err = capture.run(&mut sink).await.unwrap_err();
        assert!(matches!(err, RelayError::ContractViolation { actual: 16, .. }));
        assert!(sink.frames.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_misordered_keypoints_stop_loop() {
        let reversed: Vec<String> = KeypointIndex::ALL
            .iter()
            .rev()
            .map(|k| {
                format!(
                    r#"{{"score":0.9,"part":"{}","position":{{"x":640.0,"y":360.0}}}}"#,
                    k.part_name()
                )
            })
            .collect();
        let line = format!(r#"{{"keypoints":[{}]}}"#, reversed.join(","));
        let replay = ReplayEstimator::from_lines([line.as_str()], true);
        let mut capture =
            CaptureLoop::new(&config(), replay, Trigger::Periodic, Logger::stderr(false));
        let mut sink = RecordingSink::new(10);

        let err = tokio::time::timeout(Duration::from_secs(60), capture.run(&mut sink))
            .await
            .expect("loop kept retrying")
            .unwrap_err();
        assert!(matches!(
            err,
            RelayError::KeypointOrder { index: 0, expected: "nose", .. }
        ));
        assert!(sink.frames.is_empty());
        assert!(!capture.controller().is_outstanding());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_clears_backoff() {
        let mut estimator = ScriptedEstimator::new(Duration::from_millis(5));
        estimator.fail_calls = vec![0, 1, 2];
        let mut capture =
            CaptureLoop::new(&config(), estimator, Trigger::Periodic, Logger::stderr(false));
        let mut sink = RecordingSink::new(1);

        for _ in 0..3 {
            assert_eq!(capture.step(&mut sink).await.unwrap(), StepOutcome::Failed);
        }
        assert_eq!(capture.controller().consecutive_failures(), 3);

        let err = capture.step(&mut sink).await.unwrap_err();
        assert!(matches!(err, RelayError::Channel(_)));
        assert_eq!(capture.controller().consecutive_failures(), 0);
        assert_eq!(capture.controller().next_delay(), Duration::from_millis(33));
        assert!(!capture.controller().is_outstanding());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_trigger_coalesces() {
        let (trigger, flag) = Trigger::from_mode(TriggerMode::Manual);
        let flag = flag.unwrap();
        let mut capture = CaptureLoop::new(
            &config(),
            ScriptedEstimator::new(Duration::from_millis(5)),
            trigger,
            Logger::stderr(false),
        );
        let mut sink = RecordingSink::new(10);

        assert_eq!(capture.step(&mut sink).await.unwrap(), StepOutcome::Idle);
        assert_eq!(capture.estimator.calls, 0);

        flag.store(true, Ordering::Release);
        flag.store(true, Ordering::Release);
        assert_eq!(capture.step(&mut sink).await.unwrap(), StepOutcome::Sent);
        assert_eq!(capture.step(&mut sink).await.unwrap(), StepOutcome::Idle);
        assert_eq!(capture.estimator.calls, 1);
        assert_eq!(capture.context().frames(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_are_normalized() {
        let mut capture = CaptureLoop::new(
            &config(),
            ScriptedEstimator::new(Duration::ZERO),
            Trigger::Periodic,
            Logger::stderr(false),
        );
        let mut sink = RecordingSink::new(10);
        capture.step(&mut sink).await.unwrap();
        assert_eq!(sink.frames[0].triple(KeypointIndex::Nose), (0.5, 0.5, 0.9));
        assert_eq!(capture.context().frames(), 1);
    }
}
