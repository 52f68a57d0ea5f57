//! Per-frame call counters

use serde::{Deserialize, Serialize};

/// Counters collected over one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameStats {
    /// Native draw calls
    pub draw_calls: u32,
    /// Native dispatch calls
    pub dispatch_calls: u32,
    /// Maps with write-discard
    pub map_discard_count: u32,
    /// Maps with write-no-overwrite
    pub map_no_overwrite_count: u32,
    /// Read, write or read-write maps
    pub map_read_write_count: u32,
    /// Whole-resource copies
    pub copy_resource_count: u32,
    /// Region copies
    pub copy_subresource_count: u32,
    /// Command-stream updates
    pub update_subresource_count: u32,
    /// Render-target bindings sent to the native context
    pub surface_bindings: u32,
}

/// Accumulates [`FrameStats`] for the current frame
#[derive(Debug, Default)]
pub struct RenderProfiler {
    current: FrameStats,
    previous: FrameStats,
    frames: u64,
}

impl RenderProfiler {
    /// Reset the counters for a new frame
    pub fn begin_frame(&mut self) {
        self.current = FrameStats::default();
    }

    /// Close the frame and keep its counters as the previous frame
    pub fn end_frame(&mut self) -> FrameStats {
        self.previous = self.current;
        self.frames += 1;
        self.previous
    }

    /// Counters of the frame in progress
    pub const fn current(&self) -> &FrameStats {
        &self.current
    }

    /// Counters of the last completed frame
    pub const fn previous(&self) -> &FrameStats {
        &self.previous
    }

    /// Frames completed
    pub const fn frames(&self) -> u64 {
        self.frames
    }

    pub(crate) fn stats_mut(&mut self) -> &mut FrameStats {
        &mut self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_frame_snapshots_counters() {
        let mut profiler = RenderProfiler::default();
        profiler.begin_frame();
        profiler.stats_mut().draw_calls += 3;
        let stats = profiler.end_frame();
        assert_eq!(stats.draw_calls, 3);

        profiler.begin_frame();
        assert_eq!(profiler.current().draw_calls, 0);
        assert_eq!(profiler.previous().draw_calls, 3);
        assert_eq!(profiler.frames(), 1);
    }
}
