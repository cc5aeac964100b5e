use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

/// Control-loop state of a capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Idle,
    Opened,
    TimingsAcquired,
    FormatNegotiated,
    MemoryInitialized,
    Streaming,
    MemoryReleased,
    Closed,
}

impl Stage {
    const ALL: [Stage; 8] = [
        Stage::Idle,
        Stage::Opened,
        Stage::TimingsAcquired,
        Stage::FormatNegotiated,
        Stage::MemoryInitialized,
        Stage::Streaming,
        Stage::MemoryReleased,
        Stage::Closed,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Opened => "opened",
            Stage::TimingsAcquired => "timings_acquired",
            Stage::FormatNegotiated => "format_negotiated",
            Stage::MemoryInitialized => "memory_initialized",
            Stage::Streaming => "streaming",
            Stage::MemoryReleased => "memory_released",
            Stage::Closed => "closed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lock-free cell holding the current [`Stage`].
#[derive(Debug)]
pub(crate) struct StageCell(AtomicU8);

impl StageCell {
    pub(crate) fn new(stage: Stage) -> Self {
        Self(AtomicU8::new(stage as u8))
    }

    pub(crate) fn get(&self) -> Stage {
        let raw = self.0.load(Ordering::Acquire) as usize;
        Stage::ALL.get(raw).copied().unwrap_or(Stage::Idle)
    }

    pub(crate) fn set(&self, stage: Stage) {
        let prev = self.0.swap(stage as u8, Ordering::AcqRel);
        if prev != stage as u8 {
            tracing::debug!(stage = %stage, "capture stage");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_round_trips_every_stage() {
        let cell = StageCell::new(Stage::Idle);
        for stage in Stage::ALL {
            cell.set(stage);
            assert_eq!(cell.get(), stage);
        }
    }
}
