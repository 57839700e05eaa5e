use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;

/// Counters for recoverable per-frame failures. Safe to bump from worker threads.
#[derive(Debug, Default)]
pub struct FrameDiagnostics {
    shadow_map_allocation_failures: AtomicU32,
    pipeline_state_failures: AtomicU32,
    dropped_batches: AtomicU32,
    constant_buffer_failures: AtomicU32,
}

impl FrameDiagnostics {
    pub fn reset(&self) {
        for counter in [
            &self.shadow_map_allocation_failures,
            &self.pipeline_state_failures,
            &self.dropped_batches,
            &self.constant_buffer_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn record_shadow_map_allocation_failure(&self) {
        self.shadow_map_allocation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pipeline_state_failure(&self) {
        self.pipeline_state_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_batches(&self, count: usize) {
        self.dropped_batches.fetch_add(count as u32, Ordering::Relaxed);
    }

    pub fn record_constant_buffer_failure(&self) {
        self.constant_buffer_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn shadow_map_allocation_failures(&self) -> u32 {
        self.shadow_map_allocation_failures.load(Ordering::Relaxed)
    }

    pub fn pipeline_state_failures(&self) -> u32 {
        self.pipeline_state_failures.load(Ordering::Relaxed)
    }

    pub fn dropped_batches(&self) -> u32 {
        self.dropped_batches.load(Ordering::Relaxed)
    }

    pub fn constant_buffer_failures(&self) -> u32 {
        self.constant_buffer_failures.load(Ordering::Relaxed)
    }
}

/// Summary of one rendered frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FrameStats {
    pub frame_number: u32,
    pub visible_geometries: u32,
    pub visible_lights: u32,
    pub shadow_splits: u32,
    pub base_batches: u32,
    pub light_batches: u32,
    pub shadow_batches: u32,
    pub draw_commands: u32,
    pub draws: u32,
    pub shadow_map_allocation_failures: u32,
    pub pipeline_state_failures: u32,
    pub dropped_batches: u32,
    pub constant_buffer_failures: u32,
}

impl FrameStats {
    pub fn with_diagnostics(mut self, diagnostics: &FrameDiagnostics) -> Self {
        self.shadow_map_allocation_failures = diagnostics.shadow_map_allocation_failures();
        self.pipeline_state_failures = diagnostics.pipeline_state_failures();
        self.dropped_batches = diagnostics.dropped_batches();
        self.constant_buffer_failures = diagnostics.constant_buffer_failures();
        self
    }
}
