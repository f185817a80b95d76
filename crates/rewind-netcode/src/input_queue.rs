//! Per-player input queue with delay and prediction
//!
//! One queue per local or remote player. Inputs arrive strictly
//! sequentially from their owner; the queue applies the configured frame
//! delay on the way in and serves reads for any frame on the way out,
//! predicting (by repeating the last known input) when the real input has
//! not arrived yet. The first frame whose confirmed input differs from
//! what was predicted is remembered so the synchronization layer can roll
//! back to it.

use rewind_core::{Frame, GameInput, Logger, NullLog};
use std::cmp;
use std::sync::Arc;

/// Hard ceiling on buffered frames per player. The session must confirm
/// and discard frames before the window wraps.
pub const INPUT_QUEUE_LENGTH: usize = 128;

pub struct InputQueue {
    id: usize,
    frame_delay: i32,

    head: usize,
    tail: usize,
    length: usize,
    first_frame: bool,

    last_user_added: Frame,
    last_added: Frame,
    first_incorrect: Frame,
    last_requested: Frame,

    inputs: Vec<GameInput>,
    prediction: GameInput,

    log: Logger,
}

impl InputQueue {
    pub fn new(id: usize, input_size: usize) -> Self {
        Self::with_logger(id, input_size, Arc::new(NullLog))
    }

    pub fn with_logger(id: usize, input_size: usize, log: Logger) -> Self {
        Self {
            id,
            frame_delay: 0,
            head: 0,
            tail: 0,
            length: 0,
            first_frame: true,
            last_user_added: Frame::NULL,
            last_added: Frame::NULL,
            first_incorrect: Frame::NULL,
            last_requested: Frame::NULL,
            inputs: vec![GameInput::null(input_size); INPUT_QUEUE_LENGTH],
            prediction: GameInput::null(input_size),
            log,
        }
    }

    pub fn set_frame_delay(&mut self, delay: usize) {
        self.frame_delay = delay as i32;
    }

    pub fn last_confirmed_frame(&self) -> Frame {
        self.last_added
    }

    pub fn first_incorrect_frame(&self) -> Frame {
        self.first_incorrect
    }

    /// Drop confirmed history up to `frame`, keeping anything a pending
    /// prediction comparison might still need. Idempotent.
    pub fn discard_confirmed_frames(&mut self, mut frame: Frame) {
        debug_assert!(!frame.is_null());

        if !self.last_requested.is_null() {
            frame = cmp::min(frame, self.last_requested);
        }

        self.log.line(&format!(
            "input q{} | discarding confirmed frames up to {} (last_added:{} length:{})",
            self.id, frame, self.last_added, self.length
        ));

        if frame >= self.last_added {
            self.tail = self.head;
            self.length = 0;
        } else {
            let offset = frame.0 - self.inputs[self.tail].frame.0 + 1;
            debug_assert!(offset >= 0);
            self.tail = (self.tail + offset as usize) % INPUT_QUEUE_LENGTH;
            self.length -= offset as usize;
        }
    }

    /// Clear prediction and misprediction state back to `frame`. Caller
    /// must not reset past a recorded misprediction.
    pub fn reset_prediction(&mut self, frame: Frame) {
        debug_assert!(self.first_incorrect.is_null() || frame <= self.first_incorrect);

        self.log.line(&format!(
            "input q{} | resetting prediction errors back to frame {frame}",
            self.id
        ));

        self.prediction.frame = Frame::NULL;
        self.first_incorrect = Frame::NULL;
        self.last_requested = Frame::NULL;
    }

    /// The confirmed input for `frame`, or `None` if it is not (or no
    /// longer) in the queue.
    pub fn confirmed_input(&self, frame: Frame) -> Option<GameInput> {
        debug_assert!(self.first_incorrect.is_null() || frame < self.first_incorrect);
        let slot = frame.index(INPUT_QUEUE_LENGTH);
        if self.inputs[slot].frame == frame {
            Some(self.inputs[slot])
        } else {
            None
        }
    }

    /// The input for `frame`: confirmed when available, predicted
    /// otherwise. The bool is true for confirmed data.
    ///
    /// Panics if an unresolved misprediction exists; the caller must roll
    /// back before requesting further input.
    pub fn input(&mut self, requested: Frame) -> (GameInput, bool) {
        self.log
            .line(&format!("input q{} | requesting frame {requested}", self.id));

        assert!(
            self.first_incorrect.is_null(),
            "input requested while a misprediction is unresolved"
        );

        // Needed in add_input() to know when to drop out of prediction.
        self.last_requested = requested;

        debug_assert!(requested >= self.inputs[self.tail].frame);

        if self.prediction.frame.is_null() {
            // If the requested frame is in our range, serve it confirmed.
            let offset = (requested.0 - self.inputs[self.tail].frame.0) as usize;
            if offset < self.length {
                let slot = (offset + self.tail) % INPUT_QUEUE_LENGTH;
                debug_assert_eq!(self.inputs[slot].frame, requested);
                self.log.line(&format!(
                    "input q{} | returning confirmed frame {requested}",
                    self.id
                ));
                return (self.inputs[slot], true);
            }

            // Not in the queue: begin predicting. Frame 0 or an empty
            // queue predicts nothing; otherwise the player repeats their
            // last known input.
            if requested.0 == 0 || self.last_added.is_null() {
                self.log.line(&format!(
                    "input q{} | basing new prediction on nothing",
                    self.id
                ));
                self.prediction.erase();
                self.prediction.frame = Frame::NULL;
            } else {
                self.log.line(&format!(
                    "input q{} | basing new prediction on frame {}",
                    self.id,
                    self.inputs[self.previous(self.head)].frame
                ));
                self.prediction = self.inputs[self.previous(self.head)];
            }
            self.prediction.frame = self.prediction.frame.next();
        }

        debug_assert!(!self.prediction.frame.is_null());

        // Forward the predicted bits under the requested frame number.
        let mut out = self.prediction;
        out.frame = requested;
        self.log.line(&format!(
            "input q{} | returning prediction for frame {requested} (predicting {})",
            self.id, self.prediction.frame
        ));
        (out, false)
    }

    /// Add the owner's next sequential input. Returns the frame it was
    /// actually stored at after applying the frame delay, or `Frame::NULL`
    /// if a delay decrease forced the input to be dropped.
    pub fn add_input(&mut self, input: GameInput) -> Frame {
        self.log.line(&format!(
            "input q{} | adding input frame {} to queue",
            self.id, input.frame
        ));

        // Inputs must be passed in sequentially, regardless of delay.
        assert!(
            self.last_user_added.is_null() || input.frame == self.last_user_added.next(),
            "inputs must be added with strictly sequential frame numbers"
        );
        self.last_user_added = input.frame;

        let new_frame = self.advance_queue_head(input.frame);
        if !new_frame.is_null() {
            self.add_delayed_input(input, new_frame);
        }
        new_frame
    }

    fn add_delayed_input(&mut self, mut input: GameInput, frame: Frame) {
        self.log.line(&format!(
            "input q{} | adding delayed input frame {frame} to queue",
            self.id
        ));

        debug_assert_eq!(input.size, self.prediction.size);
        debug_assert!(self.last_added.is_null() || frame == self.last_added.next());
        debug_assert!(
            frame.0 == 0 || self.inputs[self.previous(self.head)].frame == frame.prev()
        );

        input.frame = frame;
        self.inputs[self.head] = input;
        self.head = (self.head + 1) % INPUT_QUEUE_LENGTH;
        self.length += 1;
        self.first_frame = false;
        self.last_added = frame;

        assert!(
            self.length <= INPUT_QUEUE_LENGTH,
            "input queue overflow: confirmed frames were never discarded"
        );

        if !self.prediction.frame.is_null() {
            debug_assert_eq!(frame, self.prediction.frame);

            // We were predicting this frame. Record the first input that
            // contradicts a prediction; later mismatches are downstream of
            // the same rollback.
            if self.first_incorrect.is_null() && !self.prediction.bits_eq(&input) {
                self.log.line(&format!(
                    "input q{} | frame {frame} does not match prediction. marking error",
                    self.id
                ));
                self.first_incorrect = frame;
            }

            // If the real inputs have caught up to everything that was
            // requested and nothing mismatched, prediction mode ends.
            if self.prediction.frame == self.last_requested && self.first_incorrect.is_null() {
                self.log.line(&format!(
                    "input q{} | prediction correct, leaving prediction mode",
                    self.id
                ));
                self.prediction.frame = Frame::NULL;
            } else {
                self.prediction.frame = self.prediction.frame.next();
            }
        }
    }

    /// Map the user's frame to the delayed destination frame, padding or
    /// dropping to keep stored frames contiguous across delay changes.
    fn advance_queue_head(&mut self, frame: Frame) -> Frame {
        let expected = if self.first_frame {
            Frame::ZERO
        } else {
            self.inputs[self.previous(self.head)].frame.next()
        };

        let target = Frame(frame.0 + self.frame_delay);

        if expected > target {
            // The frame delay dropped since the last input; there is no
            // room for this frame any more.
            self.log.line(&format!(
                "input q{} | dropping input frame {target} (expected next frame {expected})",
                self.id
            ));
            return Frame::NULL;
        }

        let mut expected = expected;
        while expected < target {
            // The frame delay grew; replicate the last input to fill the
            // gap so stored frames stay contiguous.
            self.log.line(&format!(
                "input q{} | adding padding frame {expected} for delay change",
                self.id
            ));
            let pad = self.inputs[self.previous(self.head)];
            self.add_delayed_input(pad, expected);
            expected = expected.next();
        }

        debug_assert!(
            target.0 == 0 || self.inputs[self.previous(self.head)].frame == target.prev()
        );
        target
    }

    fn previous(&self, offset: usize) -> usize {
        if offset == 0 {
            INPUT_QUEUE_LENGTH - 1
        } else {
            offset - 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> InputQueue {
        InputQueue::new(0, 1)
    }

    fn input(frame: i32, byte: u8) -> GameInput {
        GameInput::new(Frame(frame), &[byte])
    }

    #[test]
    fn test_confirmed_round_trip() {
        let mut q = queue();
        q.add_input(input(0, 0x01));
        q.add_input(input(1, 0x02));
        q.add_input(input(2, 0x03));

        assert_eq!(q.confirmed_input(Frame(1)).unwrap().data(), &[0x02]);
        assert_eq!(q.last_confirmed_frame(), Frame(2));
    }

    #[test]
    fn test_discard_advances_tail() {
        let mut q = queue();
        q.add_input(input(0, 0x01));
        q.add_input(input(1, 0x02));
        q.add_input(input(2, 0x03));

        // Request first so the discard clamp does not hold frames back.
        let (got, confirmed) = q.input(Frame(2));
        assert!(confirmed);
        assert_eq!(got.data(), &[0x03]);

        q.discard_confirmed_frames(Frame(0));
        assert_eq!(q.length, 2);
        assert_eq!(q.inputs[q.tail].frame, Frame(1));
        assert!(q.confirmed_input(Frame(1)).is_some());
    }

    #[test]
    fn test_discard_is_idempotent() {
        let mut q = queue();
        for f in 0..4 {
            q.add_input(input(f, f as u8));
        }
        q.input(Frame(3));

        q.discard_confirmed_frames(Frame(1));
        let (tail_frame, length) = (q.inputs[q.tail].frame, q.length);
        q.discard_confirmed_frames(Frame(1));
        assert_eq!(q.inputs[q.tail].frame, tail_frame);
        assert_eq!(q.length, length);
    }

    #[test]
    fn test_discard_clamps_to_last_requested() {
        let mut q = queue();
        for f in 0..4 {
            q.add_input(input(f, f as u8));
        }
        q.input(Frame(1));

        // Frames past the last requested one must survive: they may still
        // be needed for a prediction comparison.
        q.discard_confirmed_frames(Frame(3));
        assert!(q.confirmed_input(Frame(2)).is_some());
    }

    #[test]
    fn test_prediction_repeats_last_input() {
        let mut q = queue();
        q.add_input(input(0, 0xaa));

        let (predicted, confirmed) = q.input(Frame(1));
        assert!(!confirmed);
        assert_eq!(predicted.frame, Frame(1));
        assert_eq!(predicted.data(), &[0xaa]);

        let (predicted, confirmed) = q.input(Frame(2));
        assert!(!confirmed);
        assert_eq!(predicted.data(), &[0xaa]);
    }

    #[test]
    fn test_frame_zero_predicts_zero() {
        let mut q = queue();
        let (predicted, confirmed) = q.input(Frame(0));
        assert!(!confirmed);
        assert_eq!(predicted.data(), &[0x00]);
    }

    #[test]
    fn test_misprediction_sets_first_incorrect() {
        let mut q = queue();
        q.add_input(input(0, 0xaa));
        q.input(Frame(1));
        q.input(Frame(2));

        // Frame 1 matches the prediction, frame 2 does not.
        q.add_input(input(1, 0xaa));
        assert!(q.first_incorrect_frame().is_null());
        q.add_input(input(2, 0xbb));
        assert_eq!(q.first_incorrect_frame(), Frame(2));

        // Later mismatches never move the marker.
        q.add_input(input(3, 0xcc));
        assert_eq!(q.first_incorrect_frame(), Frame(2));
    }

    #[test]
    fn test_matching_input_ends_prediction() {
        let mut q = queue();
        q.add_input(input(0, 0xaa));
        q.input(Frame(1));

        // The confirmed input matches and covers everything requested, so
        // prediction mode ends and confirmed reads resume.
        q.add_input(input(1, 0xaa));
        assert!(q.first_incorrect_frame().is_null());
        let (got, confirmed) = q.input(Frame(1));
        assert!(confirmed);
        assert_eq!(got.data(), &[0xaa]);
    }

    #[test]
    fn test_reset_prediction_clears_error() {
        let mut q = queue();
        q.add_input(input(0, 0xaa));
        q.input(Frame(1));
        q.add_input(input(1, 0xbb));
        assert_eq!(q.first_incorrect_frame(), Frame(1));

        q.reset_prediction(Frame(1));
        assert!(q.first_incorrect_frame().is_null());
        let (got, confirmed) = q.input(Frame(1));
        assert!(confirmed);
        assert_eq!(got.data(), &[0xbb]);
    }

    #[test]
    fn test_frame_delay_shifts_destination() {
        let mut q = queue();
        q.set_frame_delay(2);

        let stored = q.add_input(input(0, 0x11));
        assert_eq!(stored, Frame(2));

        // Frames before the delayed destination were padded with blanks.
        assert_eq!(q.confirmed_input(Frame(0)).unwrap().data(), &[0x00]);
        assert_eq!(q.confirmed_input(Frame(1)).unwrap().data(), &[0x00]);
        assert_eq!(q.confirmed_input(Frame(2)).unwrap().data(), &[0x11]);
    }

    #[test]
    fn test_delay_decrease_drops_input() {
        let mut q = queue();
        q.set_frame_delay(3);
        assert_eq!(q.add_input(input(0, 0x01)), Frame(3));

        // Delay shrinks: the next input would land before the queue head.
        q.set_frame_delay(0);
        assert_eq!(q.add_input(input(1, 0x02)), Frame::NULL);

        // Catch back up once the user frame passes the stored head.
        assert_eq!(q.add_input(input(2, 0x03)), Frame::NULL);
        assert_eq!(q.add_input(input(3, 0x04)), Frame::NULL);
        assert_eq!(q.add_input(input(4, 0x05)), Frame(4));
    }

    #[test]
    #[should_panic(expected = "sequential")]
    fn test_non_sequential_input_panics() {
        let mut q = queue();
        q.add_input(input(0, 0x01));
        q.add_input(input(2, 0x02));
    }
}
