// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Synthetic stack traces.
//!
//! Frames are a pure function of their position, so two runs with the same frame counts send
//! byte-identical stack traces regardless of how the load generator itself was built or called.

use std::fmt;

use super::model::StackFrame;

const FRAME_MODULE: &str = "hey_apm::synthetic";
const FRAME_FILE: &str = "hey_apm/synthetic.rs";

/// Number of frames attached to every span.
pub const SPAN_STACK_DEPTH: usize = 5;

/// Returns `depth` frames, innermost first.
pub fn synthetic_frames(depth: usize) -> Vec<StackFrame> {
    (0..depth).map(frame).collect()
}

fn frame(position: usize) -> StackFrame {
    StackFrame {
        filename: FRAME_FILE.to_string(),
        function: format!("frame_{position:04}"),
        module: FRAME_MODULE.to_string(),
        lineno: line_for(position),
    }
}

// Spread line numbers a little so frames are not trivially identical, but keep them fixed.
fn line_for(position: usize) -> u32 {
    (position as u32 % 1000) * 3 + 10
}

/// An error that carries a stack trace of a chosen length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticError {
    frames: usize,
}

impl SyntheticError {
    pub fn new(frames: usize) -> Self {
        SyntheticError { frames }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn stack_trace(&self) -> Vec<StackFrame> {
        synthetic_frames(self.frames)
    }

    /// The innermost function, or a fixed name when there are no frames.
    pub fn culprit(&self) -> String {
        if self.frames == 0 {
            "hey_apm::synthetic".to_string()
        } else {
            format!("{FRAME_MODULE}::frame_{:04}", 0)
        }
    }
}

impl fmt::Display for SyntheticError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "synthetic error with {} frames", self.frames)
    }
}

impl std::error::Error for SyntheticError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_count_matches_request() {
        for depth in [0, 1, 10, 100] {
            assert_eq!(SyntheticError::new(depth).stack_trace().len(), depth);
        }
    }

    #[test]
    fn test_frames_are_stable() {
        assert_eq!(synthetic_frames(20), synthetic_frames(20));
        let shallow = synthetic_frames(3);
        let deep = synthetic_frames(30);
        assert_eq!(shallow[..], deep[..3]);
    }

    #[test]
    fn test_frame_content() {
        let frames = synthetic_frames(2);
        assert_eq!(frames[1].function, "frame_0001");
        assert_eq!(frames[1].lineno, 13);
        assert_eq!(frames[1].filename, "hey_apm/synthetic.rs");
    }

    #[test]
    fn test_display() {
        assert_eq!(
            SyntheticError::new(5).to_string(),
            "synthetic error with 5 frames"
        );
    }
}
