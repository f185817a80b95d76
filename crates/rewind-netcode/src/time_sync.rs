//! Frame-advantage smoothing
//!
//! Each peer measures how far ahead of the other it is running and the
//! protocol exchanges those measurements. This module keeps rolling windows
//! of both values and recommends how many frames the local side should idle
//! to split the difference with the remote.

use rewind_core::GameInput;

const FRAME_WINDOW_SIZE: usize = 40;
const MIN_UNIQUE_FRAMES: usize = 10;
const MIN_FRAME_ADVANTAGE: i32 = 3;
const MAX_FRAME_ADVANTAGE: i32 = 9;

pub struct TimeSync {
    local: [i32; FRAME_WINDOW_SIZE],
    remote: [i32; FRAME_WINDOW_SIZE],
    last_inputs: [GameInput; MIN_UNIQUE_FRAMES],
}

impl Default for TimeSync {
    fn default() -> Self {
        Self {
            local: [0; FRAME_WINDOW_SIZE],
            remote: [0; FRAME_WINDOW_SIZE],
            last_inputs: [GameInput::null(1); MIN_UNIQUE_FRAMES],
        }
    }
}

impl TimeSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one frame's worth of advantage observations.
    pub fn advance_frame(&mut self, input: GameInput, advantage: i32, remote_advantage: i32) {
        self.last_inputs[input.frame.index(self.last_inputs.len())] = input;
        self.local[input.frame.index(self.local.len())] = advantage;
        self.remote[input.frame.index(self.remote.len())] = remote_advantage;
    }

    /// Frames the local side should idle to rebalance with the remote.
    /// Zero means no adjustment is warranted.
    pub fn recommend_frame_wait_duration(&self, require_idle_input: bool) -> i32 {
        let local_sum: i32 = self.local.iter().sum();
        let local_avg = f64::from(local_sum) / self.local.len() as f64;

        let remote_sum: i32 = self.remote.iter().sum();
        let remote_avg = f64::from(remote_sum) / self.remote.len() as f64;

        // Only the side that is behind adjusts; both peers sleeping at once
        // would oscillate.
        if local_avg >= remote_avg {
            return 0;
        }

        // Meet in the middle, rounded.
        let sleep_frames = (((remote_avg - local_avg) / 2.0) + 0.5) as i32;

        // Snoozing for a frame or two is not worth the stutter.
        if sleep_frames < MIN_FRAME_ADVANTAGE {
            return 0;
        }

        // Optionally hold off while the local player is actively pressing
        // buttons; dropping their inputs on the floor feels worse than a
        // little extra latency.
        if require_idle_input {
            let reference = &self.last_inputs[0];
            for input in &self.last_inputs[1..] {
                if !input.bits_eq(reference) {
                    return 0;
                }
            }
        }

        sleep_frames.min(MAX_FRAME_ADVANTAGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_core::Frame;

    fn fill(ts: &mut TimeSync, local: i32, remote: i32) {
        for f in 0..FRAME_WINDOW_SIZE as i32 {
            ts.advance_frame(GameInput::new(Frame(f), &[0x00]), local, remote);
        }
    }

    #[test]
    fn test_balanced_peers_recommend_nothing() {
        let mut ts = TimeSync::new();
        fill(&mut ts, 2, 2);
        assert_eq!(ts.recommend_frame_wait_duration(false), 0);
    }

    #[test]
    fn test_splits_the_difference() {
        let mut ts = TimeSync::new();
        fill(&mut ts, -5, 5);
        assert_eq!(ts.recommend_frame_wait_duration(false), 5);
    }

    #[test]
    fn test_ahead_peer_never_sleeps() {
        let mut ts = TimeSync::new();
        fill(&mut ts, 5, -5);
        assert_eq!(ts.recommend_frame_wait_duration(false), 0);
    }

    #[test]
    fn test_small_imbalance_is_ignored() {
        let mut ts = TimeSync::new();
        fill(&mut ts, -2, 2);
        assert_eq!(ts.recommend_frame_wait_duration(false), 0);
    }

    #[test]
    fn test_recommendation_is_capped() {
        let mut ts = TimeSync::new();
        fill(&mut ts, -30, 30);
        assert_eq!(ts.recommend_frame_wait_duration(false), MAX_FRAME_ADVANTAGE);
    }

    #[test]
    fn test_idle_requirement_blocks_active_input() {
        let mut ts = TimeSync::new();
        for f in 0..FRAME_WINDOW_SIZE as i32 {
            // Alternate the input bits so the recent window is not idle.
            let byte = if f % 2 == 0 { 0x01 } else { 0x02 };
            ts.advance_frame(GameInput::new(Frame(f), &[byte]), -5, 5);
        }
        assert_eq!(ts.recommend_frame_wait_duration(true), 0);
        assert_eq!(ts.recommend_frame_wait_duration(false), 5);
    }
}
