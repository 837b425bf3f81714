//! Iteration controller.
//!
//! Drives erase rounds on a background thread until told to stop. The
//! presentation side talks to it through [`Controller::load`],
//! [`Controller::start`], [`Controller::stop`], reads state through
//! [`Controller::snapshot`] and observes progress through the channel
//! returned by [`Controller::subscribe`].
//!
//! Rounds are strictly serialized: a round claims the in-flight slot under the
//! state lock before it starts and publishes its image with a single `Arc`
//! swap when it ends. Each [`Controller::start`] opens a new generation, and a
//! loop from an older generation exits at its next round boundary.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use image::RgbImage;
use parking_lot::{Condvar, Mutex};

use crate::engine::{EraserEngine, RoundOutcome};
use crate::error::{Error, Result};
use crate::prompt::PromptPoint;

/// Delay between two rounds.
pub const ROUND_DELAY: Duration = Duration::from_secs(1);

/// Options for [`Controller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerOptions {
    /// Pause between the end of one round and the start of the next. The pause
    /// ends early when the controller is stopped.
    pub round_delay: Duration,
    /// How many times a failing round is retried before the loop stops.
    /// Zero means fail-stop.
    pub max_round_retries: u32,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            round_delay: ROUND_DELAY,
            max_round_retries: 0,
        }
    }
}

/// Whether the round loop is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No rounds are being scheduled.
    Idle,
    /// Rounds repeat until stopped.
    Running,
}

/// A consistent view of the pipeline state.
#[derive(Debug, Clone)]
pub struct PipelineSnapshot {
    /// The image as loaded.
    pub original: Option<Arc<RgbImage>>,
    /// The image after the last completed round.
    pub current: Option<Arc<RgbImage>>,
    /// Rounds completed since the last load.
    pub iteration_count: u64,
    /// Idle or running.
    pub state: RunState,
    /// Whether a round is executing right now.
    pub round_in_flight: bool,
}

/// Notifications published to subscribers.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A new image was loaded and the counter reset.
    Loaded {
        /// Image width.
        width: u32,
        /// Image height.
        height: u32,
    },
    /// The round loop was started.
    Started,
    /// A round finished and its image is now current.
    RoundCompleted {
        /// The new current image.
        image: Arc<RgbImage>,
        /// Iteration count including this round.
        iteration: u64,
        /// Prompt the round erased at.
        prompt: PromptPoint,
    },
    /// A round failed; the image was left untouched and the loop stopped.
    RoundFailed {
        /// What went wrong.
        error: Arc<Error>,
        /// Iteration count, unchanged by the failed round.
        iteration: u64,
    },
    /// The loop was stopped, by request or after a failure.
    Stopped {
        /// Iteration count at the time of stopping.
        iteration: u64,
    },
}

struct State {
    original: Option<Arc<RgbImage>>,
    current: Option<Arc<RgbImage>>,
    iteration_count: u64,
    run: RunState,
    generation: u64,
    in_flight: bool,
    subscribers: Vec<flume::Sender<PipelineEvent>>,
}

impl State {
    fn emit(&mut self, event: &PipelineEvent) {
        self.subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn is_current(&self, generation: u64) -> bool {
        self.run == RunState::Running && self.generation == generation
    }
}

struct Shared {
    state: Mutex<State>,
    changed: Condvar,
    engine: Mutex<EraserEngine>,
    opts: ControllerOptions,
}

/// Start/stop state machine around an [`EraserEngine`].
pub struct Controller {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    /// Wrap `engine`. The controller starts idle with no image.
    #[must_use]
    pub fn new(engine: EraserEngine, opts: ControllerOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    original: None,
                    current: None,
                    iteration_count: 0,
                    run: RunState::Idle,
                    generation: 0,
                    in_flight: false,
                    subscribers: Vec::new(),
                }),
                changed: Condvar::new(),
                engine: Mutex::new(engine),
                opts,
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Receive every event published from now on.
    #[must_use]
    pub fn subscribe(&self) -> flume::Receiver<PipelineEvent> {
        let (tx, rx) = flume::unbounded();
        self.shared.state.lock().subscribers.push(tx);
        rx
    }

    /// Make `image` both the original and the current image and reset the
    /// iteration count. The run state is left as it is.
    ///
    /// If a round is in flight, waits for it to finish first; that round's
    /// result is then replaced by `image`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a zero-sized image.
    pub fn load(&self, image: RgbImage) -> Result<()> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(Error::InvalidInput(format!(
                "cannot load a {width}x{height} image"
            )));
        }
        let image = Arc::new(image);

        let mut state = self.shared.state.lock();
        while state.in_flight {
            self.shared.changed.wait(&mut state);
        }
        state.original = Some(Arc::clone(&image));
        state.current = Some(image);
        state.iteration_count = 0;
        state.emit(&PipelineEvent::Loaded { width, height });
        self.shared.changed.notify_all();
        log::info!("loaded {width}x{height} image");
        Ok(())
    }

    /// Begin running rounds. Does nothing if already running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if no image has been loaded, and
    /// [`Error::Io`] if the worker thread cannot be spawned. The controller
    /// stays idle in both cases.
    pub fn start(&self) -> Result<()> {
        let generation = {
            let mut state = self.shared.state.lock();
            if state.current.is_none() {
                return Err(Error::InvalidInput("no image loaded".into()));
            }
            if state.run == RunState::Running {
                return Ok(());
            }
            state.run = RunState::Running;
            state.generation += 1;
            state.emit(&PipelineEvent::Started);
            state.generation
        };

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("erase-rounds-{generation}"))
            .spawn(move || round_loop(&shared, generation));
        match spawned {
            Ok(handle) => {
                let mut workers = self.workers.lock();
                workers.retain(|h| !h.is_finished());
                workers.push(handle);
                log::info!("round loop {generation} started");
                Ok(())
            }
            Err(e) => {
                let mut state = self.shared.state.lock();
                if state.generation == generation {
                    state.run = RunState::Idle;
                }
                Err(Error::Io(e))
            }
        }
    }

    /// Stop scheduling rounds. A round already in flight runs to completion
    /// and is published; no further round begins.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        if state.run == RunState::Running {
            state.run = RunState::Idle;
            let iteration = state.iteration_count;
            state.emit(&PipelineEvent::Stopped { iteration });
            log::info!("stopped after {iteration} rounds");
        }
        self.shared.changed.notify_all();
    }

    /// Block until every round loop has exited.
    ///
    /// Returns immediately once the controller is idle and no round is in
    /// flight; while running it waits for a stop or a failure.
    pub fn join(&self) {
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                log::error!("round loop panicked");
            }
        }
    }

    /// Current state, with the images shared rather than copied.
    #[must_use]
    pub fn snapshot(&self) -> PipelineSnapshot {
        let state = self.shared.state.lock();
        PipelineSnapshot {
            original: state.original.clone(),
            current: state.current.clone(),
            iteration_count: state.iteration_count,
            state: state.run,
            round_in_flight: state.in_flight,
        }
    }

    /// Rounds completed since the last load.
    #[must_use]
    pub fn iteration_count(&self) -> u64 {
        self.shared.state.lock().iteration_count
    }

    /// Whether the round loop is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().run == RunState::Running
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

fn round_loop(shared: &Shared, generation: u64) {
    loop {
        let image = {
            let mut state = shared.state.lock();
            loop {
                if !state.is_current(generation) {
                    return;
                }
                if !state.in_flight {
                    break;
                }
                // a loop from an older generation is finishing its round
                shared.changed.wait(&mut state);
            }
            let Some(image) = state.current.clone() else {
                state.run = RunState::Idle;
                return;
            };
            state.in_flight = true;
            image
        };

        let outcome = run_round(shared, &image);

        let mut state = shared.state.lock();
        state.in_flight = false;
        shared.changed.notify_all();
        match outcome {
            Ok(outcome) => {
                state.iteration_count += 1;
                let iteration = state.iteration_count;
                let next = Arc::new(outcome.image);
                state.current = Some(Arc::clone(&next));
                log::info!(
                    "round {iteration} erased {} px at ({}, {}) in {:?}",
                    outcome.mask_pixels,
                    outcome.prompt.x,
                    outcome.prompt.y,
                    outcome.elapsed
                );
                state.emit(&PipelineEvent::RoundCompleted {
                    image: next,
                    iteration,
                    prompt: outcome.prompt,
                });
            }
            Err(error) => {
                let iteration = state.iteration_count;
                log::error!("round {} failed: {error}", iteration + 1);
                let error = Arc::new(error);
                state.emit(&PipelineEvent::RoundFailed { error, iteration });
                if state.is_current(generation) {
                    state.run = RunState::Idle;
                    state.emit(&PipelineEvent::Stopped { iteration });
                }
                return;
            }
        }

        let deadline = Instant::now() + shared.opts.round_delay;
        while state.is_current(generation) {
            if shared.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
    }
}

/// Run one round, retrying up to the configured limit. A panic inside a
/// capability is reported as a failed round.
fn run_round(shared: &Shared, image: &RgbImage) -> Result<RoundOutcome> {
    let mut engine = shared.engine.lock();
    let mut attempt = 0;
    loop {
        let result = panic::catch_unwind(AssertUnwindSafe(|| engine.run_round(image)))
            .unwrap_or_else(|_| {
                Err(Error::AlgorithmFailure {
                    method: "round",
                    reason: "a pipeline stage panicked".into(),
                })
            });
        match result {
            Ok(outcome) if outcome.image.dimensions() != image.dimensions() => {
                return Err(Error::AlgorithmFailure {
                    method: "round",
                    reason: format!(
                        "produced {}x{} from a {}x{} image",
                        outcome.image.width(),
                        outcome.image.height(),
                        image.width(),
                        image.height()
                    ),
                });
            }
            Ok(outcome) => return Ok(outcome),
            Err(e) if e.is_round_failure() && attempt < shared.opts.max_round_retries => {
                attempt += 1;
                log::warn!(
                    "round attempt {attempt} failed, retrying ({} left): {e}",
                    shared.opts.max_round_retries - attempt + 1
                );
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EraseOptions;
    use crate::inpaint::{InpaintMethod, Inpainter};
    use crate::saliency::{SaliencyMap, SaliencyService};
    use crate::scale::WorkingSize;
    use crate::segmentation::{Prediction, RawMask, Segmenter};
    use image::{GrayImage, Rgb};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Flat saliency that takes `delay` to compute and tracks overlap.
    struct SlowSaliency {
        delay: Duration,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
    }

    impl SaliencyService for SlowSaliency {
        fn compute(&self, _gray: &GrayImage, size: WorkingSize) -> Result<SaliencyMap> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            thread::sleep(self.delay);
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(SaliencyMap::new(size.width, size.height))
        }
    }

    /// Masks a single pixel, or returns a mask of the wrong size, or fails
    /// for the first `fail_first` calls.
    struct StubSegmenter {
        dims: (u32, u32),
        wrong_size: bool,
        fail_first: Arc<AtomicUsize>,
    }

    impl Segmenter for StubSegmenter {
        fn bind(&mut self, image: &RgbImage) -> Result<()> {
            self.dims = image.dimensions();
            Ok(())
        }

        fn predict(&self, _points: &[PromptPoint], _multimask: bool) -> Result<Prediction> {
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::segmentation("model not ready"));
            }
            let (w, h) = if self.wrong_size {
                (self.dims.0 + 1, self.dims.1)
            } else {
                self.dims
            };
            let mut data = vec![0.0; (w * h) as usize];
            data[0] = 1.0;
            Ok(Prediction {
                masks: vec![RawMask {
                    shape: vec![1, h as usize, w as usize],
                    data,
                }],
                scores: vec![1.0],
                low_res_logits: None,
            })
        }
    }

    /// Darkens every pixel by one so rounds are visible.
    struct Darken;

    impl Inpainter for Darken {
        fn inpaint(
            &self,
            image: &RgbImage,
            _mask: &GrayImage,
            _radius: u32,
            _method: InpaintMethod,
        ) -> Result<RgbImage> {
            let mut out = image.clone();
            for p in out.pixels_mut() {
                p.0 = p.0.map(|v| v.saturating_sub(1));
            }
            Ok(out)
        }
    }

    struct Harness {
        controller: Controller,
        max_active: Arc<AtomicUsize>,
    }

    fn harness(delay: Duration, wrong_size: bool, fail_first: usize, retries: u32) -> Harness {
        let max_active = Arc::new(AtomicUsize::new(0));
        let engine = EraserEngine::new(EraseOptions::default())
            .unwrap()
            .with_saliency(SlowSaliency {
                delay,
                active: Arc::new(AtomicUsize::new(0)),
                max_active: Arc::clone(&max_active),
            })
            .with_segmenter(StubSegmenter {
                dims: (0, 0),
                wrong_size,
                fail_first: Arc::new(AtomicUsize::new(fail_first)),
            })
            .with_inpainter(Darken);
        let controller = Controller::new(
            engine,
            ControllerOptions {
                round_delay: Duration::from_millis(5),
                max_round_retries: retries,
            },
        );
        Harness {
            controller,
            max_active,
        }
    }

    fn grey(size: u32) -> RgbImage {
        RgbImage::from_pixel(size, size, Rgb([200, 200, 200]))
    }

    fn wait_for_rounds(rx: &flume::Receiver<PipelineEvent>, n: u64) {
        loop {
            match rx.recv_timeout(Duration::from_secs(10)) {
                Ok(PipelineEvent::RoundCompleted { iteration, .. }) if iteration >= n => return,
                Ok(PipelineEvent::RoundFailed { error, .. }) => panic!("round failed: {error}"),
                Ok(_) => {}
                Err(e) => panic!("no round completed: {e}"),
            }
        }
    }

    #[test]
    fn start_without_image_is_invalid_and_stays_idle() {
        let h = harness(Duration::ZERO, false, 0, 0);
        let err = h.controller.start().unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(!h.controller.is_running());
        assert_eq!(h.controller.snapshot().state, RunState::Idle);
    }

    #[test]
    fn zero_sized_load_is_rejected() {
        let h = harness(Duration::ZERO, false, 0, 0);
        assert!(h.controller.load(RgbImage::new(0, 3)).is_err());
        assert!(h.controller.snapshot().current.is_none());
    }

    #[test]
    fn rounds_count_up_and_publish_images() {
        let h = harness(Duration::ZERO, false, 0, 0);
        let rx = h.controller.subscribe();
        h.controller.load(grey(16)).unwrap();
        h.controller.start().unwrap();
        wait_for_rounds(&rx, 3);
        h.controller.stop();
        h.controller.join();

        let snap = h.controller.snapshot();
        assert_eq!(snap.state, RunState::Idle);
        assert!(!snap.round_in_flight);
        let n = snap.iteration_count;
        assert!(n >= 3);
        let current = snap.current.unwrap();
        assert_eq!(current.dimensions(), (16, 16));
        // Darken runs twice per round, the blend keeps one step per round
        #[allow(clippy::cast_possible_truncation)]
        let expected = 200 - n as u8;
        assert_eq!(current.get_pixel(3, 3)[0], expected);
        assert_eq!(snap.original.unwrap().get_pixel(3, 3)[0], 200);
    }

    #[test]
    fn every_completed_round_increments_once() {
        let h = harness(Duration::from_millis(2), false, 0, 0);
        let rx = h.controller.subscribe();
        h.controller.load(grey(8)).unwrap();
        h.controller.start().unwrap();
        wait_for_rounds(&rx, 2);
        h.controller.stop();
        h.controller.join();

        let iterations: Vec<u64> = rx
            .drain()
            .filter_map(|e| match e {
                PipelineEvent::RoundCompleted { iteration, .. } => Some(iteration),
                _ => None,
            })
            .collect();
        let total = h.controller.iteration_count();
        // events after the wait continue the sequence without gaps
        for (i, it) in iterations.iter().enumerate() {
            assert_eq!(*it, total - iterations.len() as u64 + i as u64 + 1);
        }
    }

    #[test]
    fn stop_then_start_never_overlaps_rounds() {
        let h = harness(Duration::from_millis(30), false, 0, 0);
        let rx = h.controller.subscribe();
        h.controller.load(grey(8)).unwrap();
        h.controller.start().unwrap();
        thread::sleep(Duration::from_millis(10));
        for _ in 0..5 {
            h.controller.stop();
            h.controller.start().unwrap();
        }
        wait_for_rounds(&rx, 3);
        h.controller.stop();
        h.controller.join();

        assert_eq!(h.max_active.load(Ordering::SeqCst), 1);
        let completed = rx
            .drain()
            .filter(|e| matches!(e, PipelineEvent::RoundCompleted { .. }))
            .count() as u64;
        // three were consumed by wait_for_rounds
        assert_eq!(h.controller.iteration_count(), completed + 3);
    }

    #[test]
    fn start_while_running_is_a_no_op() {
        let h = harness(Duration::from_millis(5), false, 0, 0);
        let rx = h.controller.subscribe();
        h.controller.load(grey(8)).unwrap();
        h.controller.start().unwrap();
        h.controller.start().unwrap();
        wait_for_rounds(&rx, 2);
        h.controller.stop();
        h.controller.join();
        let started = rx
            .drain()
            .filter(|e| matches!(e, PipelineEvent::Started))
            .count();
        assert_eq!(started, 0, "second Started event leaked past the first rounds");
        assert_eq!(h.max_active.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wrong_size_mask_fails_the_round_and_stops() {
        let h = harness(Duration::ZERO, true, 0, 0);
        let rx = h.controller.subscribe();
        h.controller.load(grey(8)).unwrap();
        h.controller.start().unwrap();

        let failure = loop {
            match rx.recv_timeout(Duration::from_secs(10)).unwrap() {
                PipelineEvent::RoundFailed { error, iteration } => break (error, iteration),
                PipelineEvent::RoundCompleted { .. } => panic!("round should not complete"),
                _ => {}
            }
        };
        assert!(failure.0.is_round_failure());
        assert_eq!(failure.1, 0);
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(10)).unwrap(),
            PipelineEvent::Stopped { iteration: 0 }
        ));
        h.controller.join();

        let snap = h.controller.snapshot();
        assert_eq!(snap.state, RunState::Idle);
        assert_eq!(snap.iteration_count, 0);
        assert_eq!(snap.current.unwrap().get_pixel(0, 0)[0], 200);
    }

    #[test]
    fn retries_recover_a_transient_failure() {
        let h = harness(Duration::ZERO, false, 1, 1);
        let rx = h.controller.subscribe();
        h.controller.load(grey(8)).unwrap();
        h.controller.start().unwrap();
        wait_for_rounds(&rx, 1);
        h.controller.stop();
        h.controller.join();
        assert!(h.controller.iteration_count() >= 1);
    }

    #[test]
    fn load_resets_the_counter_only() {
        let h = harness(Duration::ZERO, false, 0, 0);
        let rx = h.controller.subscribe();
        h.controller.load(grey(8)).unwrap();
        h.controller.start().unwrap();
        wait_for_rounds(&rx, 2);
        h.controller.stop();
        h.controller.join();
        assert!(h.controller.iteration_count() >= 2);

        h.controller.load(grey(12)).unwrap();
        let snap = h.controller.snapshot();
        assert_eq!(snap.iteration_count, 0);
        assert_eq!(snap.state, RunState::Idle);
        assert_eq!(snap.current.unwrap().dimensions(), (12, 12));
    }

    #[test]
    fn load_while_running_waits_for_the_round_and_keeps_running() {
        let h = harness(Duration::from_millis(20), false, 0, 0);
        let rx = h.controller.subscribe();
        h.controller.load(grey(8)).unwrap();
        h.controller.start().unwrap();
        thread::sleep(Duration::from_millis(5));
        h.controller.load(grey(10)).unwrap();
        assert!(h.controller.is_running());
        assert_eq!(h.controller.snapshot().original.unwrap().dimensions(), (10, 10));

        // the first round after the reload reports iteration 1 on the new image
        loop {
            match rx.recv_timeout(Duration::from_secs(10)).unwrap() {
                PipelineEvent::RoundCompleted {
                    image, iteration, ..
                } if image.dimensions() == (10, 10) => {
                    assert_eq!(iteration, 1);
                    break;
                }
                _ => {}
            }
        }
        h.controller.stop();
        h.controller.join();
    }
}
