//! Task progress reporting.

use tracing::{debug, warn};

use super::task_queue::TaskHandle;

/// Progress of the recipe task after content generation.
pub const CONTENT_READY_PROGRESS: u8 = 30;
/// Progress of the recipe task once image tasks are enqueued.
pub const FAN_OUT_BASE_PROGRESS: u8 = 35;
/// Share of the progress bar covered by image completions.
pub const FAN_OUT_SPAN: u8 = 60;
/// Ceiling while image completions are still being collected.
pub const FAN_OUT_CEILING: u8 = 95;

/// Best-effort progress writer for one task.
///
/// Progress is advisory: a failed write is logged and never aborts the
/// handler.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    handle: TaskHandle,
}

impl ProgressReporter {
    pub fn new(handle: TaskHandle) -> Self {
        Self { handle }
    }

    pub fn task_id(&self) -> &str {
        self.handle.id()
    }

    pub async fn report(&self, percent: u8) {
        match self.handle.update_progress(percent).await {
            Ok(()) => debug!(task_id = %self.handle.id(), percent, "Progress"),
            Err(e) => warn!(
                task_id = %self.handle.id(),
                percent,
                error = %e,
                "Failed to record progress"
            ),
        }
    }
}

/// Progress once `enqueued` of `total` image tasks are on the queue:
/// `35 + enqueued * 60 / total`, rounded down and capped at 95.
pub fn fan_out_progress(enqueued: usize, total: usize) -> u8 {
    if total == 0 {
        return FAN_OUT_CEILING;
    }
    let advanced = enqueued.min(total) * usize::from(FAN_OUT_SPAN) / total;
    (usize::from(FAN_OUT_BASE_PROGRESS) + advanced).min(usize::from(FAN_OUT_CEILING)) as u8
}
