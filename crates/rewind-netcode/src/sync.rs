//! Rollback synchronization core
//!
//! Owns one input queue per player and the ring of saved states that makes
//! rollback possible. The session layer feeds local and remote inputs in;
//! this module detects when a remote input contradicts a prediction, loads
//! the last state saved before the divergence, and replays forward with the
//! corrected inputs. Each replayed frame is bracketed here: inputs are
//! resolved, the host's `advance_frame` is invoked exactly once with them,
//! and the resulting state is saved. The host never re-enters the library
//! during a rollback.

use crate::connect_status::ConnectStatusTable;
use crate::handler::SessionHandler;
use crate::input_queue::InputQueue;
use crate::{Result, SessionError};
use rewind_core::{Frame, GameInput, Logger, NullLog};
use std::sync::Arc;

pub struct SyncConfig {
    pub num_players: usize,
    pub input_size: usize,
    pub max_prediction_frames: usize,
}

struct SavedFrame {
    frame: Frame,
    data: Vec<u8>,
    checksum: Option<u32>,
}

impl SavedFrame {
    fn empty() -> Self {
        Self {
            frame: Frame::NULL,
            data: Vec::new(),
            checksum: None,
        }
    }
}

pub struct Synchronizer {
    num_players: usize,
    input_size: usize,
    max_prediction: usize,

    frame_count: Frame,
    last_confirmed_frame: Frame,
    rolling_back: bool,

    input_queues: Vec<InputQueue>,
    saved_frames: Vec<SavedFrame>,
    saved_head: usize,

    log: Logger,
}

impl Synchronizer {
    pub fn new(config: SyncConfig) -> Self {
        Self::with_logger(config, Arc::new(NullLog))
    }

    pub fn with_logger(config: SyncConfig, log: Logger) -> Self {
        let input_queues = (0..config.num_players)
            .map(|i| InputQueue::with_logger(i, config.input_size, log.clone()))
            .collect();
        // Room for every frame in the prediction window plus the frame we
        // roll back to and the one being saved.
        let saved_frames = (0..config.max_prediction_frames + 2)
            .map(|_| SavedFrame::empty())
            .collect();
        Self {
            num_players: config.num_players,
            input_size: config.input_size,
            max_prediction: config.max_prediction_frames,
            frame_count: Frame::ZERO,
            last_confirmed_frame: Frame::NULL,
            rolling_back: false,
            input_queues,
            saved_frames,
            saved_head: 0,
            log,
        }
    }

    pub fn frame_count(&self) -> Frame {
        self.frame_count
    }

    pub fn in_rollback(&self) -> bool {
        self.rolling_back
    }

    pub fn set_frame_delay(&mut self, queue: usize, delay: usize) {
        self.input_queues[queue].set_frame_delay(delay);
    }

    /// Everything at or below `frame` is confirmed by every participant;
    /// history before it can be discarded.
    pub fn set_last_confirmed_frame(&mut self, frame: Frame) {
        self.last_confirmed_frame = frame;
        if frame.0 > 0 {
            for queue in &mut self.input_queues {
                queue.discard_confirmed_frames(frame.prev());
            }
        }
    }

    /// Add the local player's input for the current frame. Returns the
    /// frame the input was scheduled at after frame delay; a null frame
    /// means the input was dropped by a delay decrease and the host should
    /// not send it.
    ///
    /// Rejected with `PredictionThreshold` only when the prediction window
    /// is exhausted on both axes: enough frames simulated to fill it, and
    /// confirmation lagging by the full window. Early frames pass
    /// unconditionally so a slow handshake tail cannot deadlock the first
    /// few simulation steps.
    pub fn add_local_input(
        &mut self,
        queue: usize,
        mut input: GameInput,
        handler: &mut dyn SessionHandler,
    ) -> Result<Frame> {
        let frames_behind = self.frame_count.0 - self.last_confirmed_frame.0;
        if self.frame_count.0 >= self.max_prediction as i32
            && frames_behind >= self.max_prediction as i32
        {
            self.log.line("sync | rejecting input, prediction window full");
            return Err(SessionError::PredictionThreshold);
        }

        if self.frame_count.0 == 0 {
            self.save_current_frame(handler);
        }

        input.frame = self.frame_count;
        Ok(self.input_queues[queue].add_input(input))
    }

    pub fn add_remote_input(&mut self, queue: usize, input: GameInput) {
        self.input_queues[queue].add_input(input);
    }

    /// Resolve inputs for the current frame into `output` (`input_size`
    /// bytes per player, in queue order), predicting where confirmed data
    /// has not arrived. The returned bitmask marks disconnected players,
    /// whose slices are zero-filled.
    pub fn synchronize_inputs(
        &mut self,
        output: &mut [u8],
        local_status: &ConnectStatusTable,
    ) -> u32 {
        debug_assert!(output.len() >= self.num_players * self.input_size);
        let mut disconnect_flags = 0u32;
        for i in 0..self.num_players {
            let slice = &mut output[i * self.input_size..(i + 1) * self.input_size];
            let status = local_status.get(i);
            if status.disconnected && self.frame_count > status.last_frame {
                disconnect_flags |= 1 << i;
                slice.fill(0);
            } else {
                let (input, _) = self.input_queues[i].input(self.frame_count);
                slice.copy_from_slice(input.data());
            }
        }
        disconnect_flags
    }

    /// Like `synchronize_inputs` but only for a fully confirmed frame,
    /// never predicting. Used to feed spectators.
    ///
    /// Panics if `frame` is not confirmed in some queue; the caller must
    /// stay at or below the minimum confirmed frame.
    pub fn confirmed_inputs(
        &self,
        frame: Frame,
        output: &mut [u8],
        local_status: &ConnectStatusTable,
    ) -> u32 {
        debug_assert!(output.len() >= self.num_players * self.input_size);
        let mut disconnect_flags = 0u32;
        for i in 0..self.num_players {
            let slice = &mut output[i * self.input_size..(i + 1) * self.input_size];
            let status = local_status.get(i);
            if status.disconnected && frame > status.last_frame {
                disconnect_flags |= 1 << i;
                slice.fill(0);
            } else {
                let input = self.input_queues[i]
                    .confirmed_input(frame)
                    .expect("confirmed input missing for a frame at or below the minimum");
                slice.copy_from_slice(input.data());
            }
        }
        disconnect_flags
    }

    /// Advance to the next frame, saving the state the host just produced.
    pub fn increment_frame(&mut self, handler: &mut dyn SessionHandler) {
        self.frame_count = self.frame_count.next();
        self.save_current_frame(handler);
    }

    pub(crate) fn save_current_frame(&mut self, handler: &mut dyn SessionHandler) {
        let snapshot = handler.save_state();
        let slot = &mut self.saved_frames[self.saved_head];
        slot.frame = self.frame_count;
        slot.data = snapshot.data;
        slot.checksum = snapshot.checksum;
        self.log.line(&format!(
            "sync | saved frame {} (checksum: {:08x})",
            slot.frame,
            slot.checksum.unwrap_or(0)
        ));
        self.saved_head = (self.saved_head + 1) % self.saved_frames.len();
    }

    /// Frame and checksum of the most recently saved state.
    pub fn last_saved_frame(&self) -> (Frame, Option<u32>) {
        let idx = (self.saved_head + self.saved_frames.len() - 1) % self.saved_frames.len();
        (self.saved_frames[idx].frame, self.saved_frames[idx].checksum)
    }

    pub(crate) fn load_frame(&mut self, frame: Frame, handler: &mut dyn SessionHandler) {
        // The frame to load is the one we are on: nothing to do.
        if frame == self.frame_count {
            self.log.line("sync | skipping load of current frame");
            return;
        }

        let found = self
            .saved_frames
            .iter()
            .position(|saved| saved.frame == frame)
            .expect("rollback target frame is no longer in the saved state ring");

        let saved = &self.saved_frames[found];
        self.log.line(&format!(
            "sync | loading frame {} (checksum: {:08x})",
            saved.frame,
            saved.checksum.unwrap_or(0)
        ));
        handler.load_state(&saved.data);

        self.frame_count = saved.frame;
        // The next save lands right after the frame we just restored.
        self.saved_head = (found + 1) % self.saved_frames.len();
    }

    /// Roll back and replay if any queue recorded a misprediction.
    pub fn check_simulation(
        &mut self,
        handler: &mut dyn SessionHandler,
        local_status: &ConnectStatusTable,
    ) {
        if let Some(seek_to) = self.check_consistency() {
            self.adjust_simulation(seek_to, handler, local_status);
        }
    }

    /// The earliest frame whose confirmed input contradicted a prediction,
    /// if any.
    fn check_consistency(&self) -> Option<Frame> {
        let mut first_incorrect = Frame::NULL;
        for queue in &self.input_queues {
            let incorrect = queue.first_incorrect_frame();
            if !incorrect.is_null() && (first_incorrect.is_null() || incorrect < first_incorrect) {
                first_incorrect = incorrect;
            }
        }
        if first_incorrect.is_null() {
            None
        } else {
            Some(first_incorrect)
        }
    }

    pub(crate) fn adjust_simulation(
        &mut self,
        seek_to: Frame,
        handler: &mut dyn SessionHandler,
        local_status: &ConnectStatusTable,
    ) {
        assert!(!self.rolling_back, "rollback attempted during a rollback");

        let resume_frame = self.frame_count;
        let count = (self.frame_count.0 - seek_to.0) as usize;

        self.log
            .line(&format!("sync | catching up to frame {resume_frame}, rolling back to {seek_to}"));
        self.rolling_back = true;

        self.load_frame(seek_to, handler);
        debug_assert_eq!(self.frame_count, seek_to);

        for queue in &mut self.input_queues {
            queue.reset_prediction(seek_to);
        }

        let mut inputs = vec![0u8; self.num_players * self.input_size];
        for _ in 0..count {
            let flags = self.synchronize_inputs(&mut inputs, local_status);
            handler.advance_frame(&inputs, flags);
            self.increment_frame(handler);
        }
        debug_assert_eq!(self.frame_count, resume_frame);

        self.rolling_back = false;
        self.log.line("sync | finished rollback");
    }

    pub fn last_confirmed_frame(&self) -> Frame {
        self.last_confirmed_frame
    }
}
