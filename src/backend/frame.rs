// Frame sequencing
//
// The acquire → present half of the frame loop, kept apart from Vulkan so the
// rebuild rules can be tested without a GPU:
//
//   acquire ──(stale)──> rebuild ──> acquire ──> ... ──> Frame
//   present ──(suboptimal / out of date)──> rebuild before the next acquire
//
// A resize request is only acted on at the start of the next acquire, so a
// frame that is being recorded never loses its framebuffer.

use anyhow::Result;

use super::swapchain::PresentOutcome;

/// Acquire attempts (each followed by a rebuild) before giving up
pub const MAX_ACQUIRE_ATTEMPTS: u32 = 8;

/// An acquired swapchain image, tagged with the swapchain it came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub image_index: u32,
    pub generation: u64,
}

/// The swapchain operations the sequencer drives
pub trait Presenter {
    /// Acquire the next image. `None` means the swapchain is stale (out of
    /// date, suboptimal, or missing) and must be rebuilt first.
    fn acquire(&mut self) -> Result<Option<u32>>;

    fn present(&mut self, image_index: u32) -> Result<PresentOutcome>;

    /// Replace the swapchain with a new one tagged `generation`
    fn rebuild(&mut self, generation: u64) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct FrameSequencer {
    rebuild_pending: bool,
    generation: u64,
    rebuilds: u64,
    frames_presented: u64,
}

impl FrameSequencer {
    /// Sequencer for an existing swapchain of `generation`
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            ..Default::default()
        }
    }

    /// Sequencer with no usable swapchain yet; the first acquire builds one
    pub fn without_swapchain() -> Self {
        Self {
            rebuild_pending: true,
            ..Default::default()
        }
    }

    /// Rebuild before the next acquire. Repeated requests collapse into one.
    pub fn request_rebuild(&mut self) {
        self.rebuild_pending = true;
    }

    pub fn rebuild_pending(&self) -> bool {
        self.rebuild_pending
    }

    /// Acquire an image, rebuilding first if needed and again whenever the
    /// swapchain turns out to be stale
    pub fn acquire<P: Presenter>(&mut self, presenter: &mut P) -> Result<Frame> {
        for attempt in 1..=MAX_ACQUIRE_ATTEMPTS {
            if self.rebuild_pending {
                self.rebuild(presenter)?;
            }

            match presenter.acquire()? {
                Some(image_index) => {
                    return Ok(Frame {
                        image_index,
                        generation: self.generation,
                    })
                }
                None => {
                    log::debug!(
                        "Swapchain #{} stale on acquire (attempt {})",
                        self.generation,
                        attempt
                    );
                    self.rebuild_pending = true;
                }
            }
        }

        anyhow::bail!(
            "Could not acquire a swapchain image after {} attempts",
            MAX_ACQUIRE_ATTEMPTS
        )
    }

    /// Present `frame`. Suboptimal or out-of-date results schedule a rebuild
    /// for the next acquire.
    pub fn present<P: Presenter>(&mut self, presenter: &mut P, frame: Frame) -> Result<PresentOutcome> {
        debug_assert_eq!(
            frame.generation, self.generation,
            "presenting a frame from a replaced swapchain"
        );

        let outcome = presenter.present(frame.image_index)?;
        match outcome {
            PresentOutcome::Presented => self.frames_presented += 1,
            PresentOutcome::Suboptimal => {
                self.frames_presented += 1;
                self.rebuild_pending = true;
            }
            PresentOutcome::OutOfDate => {
                log::debug!("Swapchain #{} out of date on present", self.generation);
                self.rebuild_pending = true;
            }
        }
        Ok(outcome)
    }

    fn rebuild<P: Presenter>(&mut self, presenter: &mut P) -> Result<()> {
        let next = self.generation + 1;
        presenter.rebuild(next)?;
        self.generation = next;
        self.rebuilds += 1;
        self.rebuild_pending = false;
        Ok(())
    }

    /// Generation of the current swapchain
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted swapchain with three images
    #[derive(Default)]
    struct FakePresenter {
        generation: u64,
        next_image: u32,
        stale_acquires: u32,
        present_results: VecDeque<PresentOutcome>,
        rebuilt_to: Vec<u64>,
        /// (image index, swapchain generation) of every present
        presented: Vec<(u32, u64)>,
    }

    impl Presenter for FakePresenter {
        fn acquire(&mut self) -> Result<Option<u32>> {
            if self.stale_acquires > 0 {
                self.stale_acquires -= 1;
                return Ok(None);
            }
            let index = self.next_image;
            self.next_image = (self.next_image + 1) % 3;
            Ok(Some(index))
        }

        fn present(&mut self, image_index: u32) -> Result<PresentOutcome> {
            self.presented.push((image_index, self.generation));
            Ok(self
                .present_results
                .pop_front()
                .unwrap_or(PresentOutcome::Presented))
        }

        fn rebuild(&mut self, generation: u64) -> Result<()> {
            self.generation = generation;
            self.next_image = 0;
            self.rebuilt_to.push(generation);
            Ok(())
        }
    }

    fn run_frame(sequencer: &mut FrameSequencer, presenter: &mut FakePresenter) -> Frame {
        let frame = sequencer.acquire(presenter).unwrap();
        sequencer.present(presenter, frame).unwrap();
        frame
    }

    #[test]
    fn steady_state_never_rebuilds() {
        let mut sequencer = FrameSequencer::new(0);
        let mut presenter = FakePresenter::default();

        for _ in 0..60 {
            run_frame(&mut sequencer, &mut presenter);
        }

        assert_eq!(sequencer.rebuild_count(), 0);
        assert_eq!(sequencer.frames_presented(), 60);
        assert!(presenter.rebuilt_to.is_empty());
        assert!(presenter.presented.iter().all(|&(_, generation)| generation == 0));
    }

    #[test]
    fn resize_rebuilds_once_before_next_present() {
        let mut sequencer = FrameSequencer::new(0);
        let mut presenter = FakePresenter::default();

        for _ in 0..30 {
            run_frame(&mut sequencer, &mut presenter);
        }

        // Several resize events in one poll
        sequencer.request_rebuild();
        sequencer.request_rebuild();

        let frame = run_frame(&mut sequencer, &mut presenter);
        assert_eq!(sequencer.rebuild_count(), 1);
        assert_eq!(presenter.rebuilt_to, vec![1]);
        assert_eq!(frame.generation, 1);
        assert_eq!(presenter.presented.last(), Some(&(0, 1)));

        for _ in 0..29 {
            let frame = run_frame(&mut sequencer, &mut presenter);
            assert_eq!(frame.generation, 1);
        }

        assert_eq!(sequencer.rebuild_count(), 1);
        assert_eq!(sequencer.frames_presented(), 60);
        assert!(presenter.presented[30..].iter().all(|&(_, generation)| generation == 1));
    }

    #[test]
    fn stale_acquire_is_rebuilt_and_retried() {
        let mut sequencer = FrameSequencer::new(0);
        let mut presenter = FakePresenter {
            stale_acquires: 2,
            ..Default::default()
        };

        let frame = sequencer.acquire(&mut presenter).unwrap();
        assert_eq!(frame.generation, 2);
        assert_eq!(presenter.rebuilt_to, vec![1, 2]);
        assert!(!sequencer.rebuild_pending());
    }

    #[test]
    fn gives_up_after_retry_limit() {
        let mut sequencer = FrameSequencer::new(0);
        let mut presenter = FakePresenter {
            stale_acquires: u32::MAX,
            ..Default::default()
        };

        let err = sequencer.acquire(&mut presenter).unwrap_err();
        assert!(err.to_string().contains("attempts"));
        // The first attempt runs on the existing swapchain
        assert_eq!(presenter.rebuilt_to.len(), MAX_ACQUIRE_ATTEMPTS as usize - 1);
    }

    #[test]
    fn out_of_date_present_rebuilds_on_next_acquire() {
        let mut sequencer = FrameSequencer::new(0);
        let mut presenter = FakePresenter {
            present_results: VecDeque::from([PresentOutcome::OutOfDate]),
            ..Default::default()
        };

        run_frame(&mut sequencer, &mut presenter);
        assert!(sequencer.rebuild_pending());
        assert_eq!(sequencer.frames_presented(), 0);
        assert_eq!(sequencer.rebuild_count(), 0);

        let frame = run_frame(&mut sequencer, &mut presenter);
        assert_eq!(frame.generation, 1);
        assert_eq!(sequencer.rebuild_count(), 1);
        assert_eq!(sequencer.frames_presented(), 1);
    }

    #[test]
    fn suboptimal_present_counts_and_schedules_rebuild() {
        let mut sequencer = FrameSequencer::new(0);
        let mut presenter = FakePresenter {
            present_results: VecDeque::from([PresentOutcome::Suboptimal]),
            ..Default::default()
        };

        run_frame(&mut sequencer, &mut presenter);
        assert_eq!(sequencer.frames_presented(), 1);
        assert!(sequencer.rebuild_pending());
    }

    #[test]
    fn missing_swapchain_is_built_on_first_acquire() {
        let mut sequencer = FrameSequencer::without_swapchain();
        let mut presenter = FakePresenter::default();

        let frame = sequencer.acquire(&mut presenter).unwrap();
        assert_eq!(frame.generation, 1);
        assert_eq!(sequencer.rebuild_count(), 1);
    }
}
