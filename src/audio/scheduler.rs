//! Gapless scheduling of inbound agent audio on the output clock

use serde::Serialize;
use std::collections::BTreeMap;

pub type ChunkId = u64;

/// A chunk placed on the output timeline, times in seconds of output clock
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ScheduledChunk {
    pub id: ChunkId,
    pub start: f64,
    pub end: f64,
}

/// Tracks where the next chunk starts and which chunks are still pending.
///
/// Each chunk starts at `max(now, end of previous chunk)`. The cursor only
/// moves forward, except on [`PlaybackScheduler::interrupt`] where it is
/// pulled back to the current output time.
#[derive(Debug, Default)]
pub struct PlaybackScheduler {
    next_start: f64,
    in_flight: BTreeMap<ChunkId, ScheduledChunk>,
    next_id: ChunkId,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a chunk of `duration` seconds right after the previous one
    pub fn schedule(&mut self, now: f64, duration: f64) -> ScheduledChunk {
        let start = self.next_start.max(now);
        let end = start + duration.max(0.0);
        self.next_start = end;

        let chunk = ScheduledChunk {
            id: self.next_id,
            start,
            end,
        };
        self.next_id += 1;
        self.in_flight.insert(chunk.id, chunk);
        chunk
    }

    /// Barge-in: drop every pending chunk and restart the cursor at `now`.
    /// Returns the ids that must be stopped.
    pub fn interrupt(&mut self, now: f64) -> Vec<ChunkId> {
        let cancelled: Vec<ChunkId> = self.in_flight.keys().copied().collect();
        self.in_flight.clear();
        self.next_start = now;
        cancelled
    }

    /// Forget chunks that finished playing by `now`
    pub fn reap(&mut self, now: f64) -> Vec<ChunkId> {
        let finished: Vec<ChunkId> = self
            .in_flight
            .values()
            .filter(|c| c.end <= now)
            .map(|c| c.id)
            .collect();
        for id in &finished {
            self.in_flight.remove(id);
        }
        finished
    }

    pub fn cursor(&self) -> f64 {
        self.next_start
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether agent audio is audible at `now`
    pub fn is_playing(&self, now: f64) -> bool {
        self.in_flight
            .values()
            .any(|c| c.start <= now && now < c.end)
    }

    pub fn reset(&mut self) {
        self.in_flight.clear();
        self.next_start = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_back_to_back_chunks() {
        let mut scheduler = PlaybackScheduler::new();
        let first = scheduler.schedule(1.0, 0.5);
        let second = scheduler.schedule(1.01, 0.5);
        let third = scheduler.schedule(1.02, 0.5);

        assert_eq!(first.start, 1.0);
        assert_eq!(second.start, first.end);
        assert_eq!(third.start, second.end);
        assert!((third.start - first.start - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_late_chunk_starts_now() {
        let mut scheduler = PlaybackScheduler::new();
        scheduler.schedule(0.0, 0.2);
        let late = scheduler.schedule(3.0, 0.2);
        assert_eq!(late.start, 3.0);
    }

    #[test]
    fn test_interrupt_resets_cursor() {
        let mut scheduler = PlaybackScheduler::new();
        for _ in 0..4 {
            scheduler.schedule(0.0, 0.5);
        }
        assert_eq!(scheduler.cursor(), 2.0);

        let cancelled = scheduler.interrupt(0.7);
        assert_eq!(cancelled, vec![0, 1, 2, 3]);
        assert_eq!(scheduler.in_flight(), 0);

        let next = scheduler.schedule(0.75, 0.5);
        assert_eq!(next.start, 0.75);
    }

    #[test]
    fn test_reap_only_finished() {
        let mut scheduler = PlaybackScheduler::new();
        scheduler.schedule(0.0, 1.0);
        scheduler.schedule(0.0, 1.0);
        assert_eq!(scheduler.reap(1.5), vec![0]);
        assert!(scheduler.is_playing(1.5));
        assert_eq!(scheduler.in_flight(), 1);
        assert!(!scheduler.is_playing(2.5));
    }

    proptest! {
        #[test]
        fn prop_chunks_are_gapless_and_ordered(
            arrivals in prop::collection::vec((0.0f64..0.3, 0.01f64..0.6), 1..40)
        ) {
            let mut scheduler = PlaybackScheduler::new();
            let mut now = 0.0;
            let mut previous: Option<ScheduledChunk> = None;

            for (gap, duration) in arrivals {
                now += gap;
                let chunk = scheduler.schedule(now, duration);
                let expected = previous.map(|p| p.end.max(now)).unwrap_or(now);
                prop_assert_eq!(chunk.start, expected);
                prop_assert!(chunk.start >= now);
                if let Some(p) = previous {
                    prop_assert!(chunk.start >= p.end);
                }
                previous = Some(chunk);
            }
        }

        #[test]
        fn prop_interrupt_starts_next_chunk_at_signal_time(
            durations in prop::collection::vec(0.01f64..1.0, 1..20),
            signal in 0.0f64..5.0,
        ) {
            let mut scheduler = PlaybackScheduler::new();
            for d in &durations {
                scheduler.schedule(0.0, *d);
            }
            scheduler.interrupt(signal);
            let next = scheduler.schedule(signal, 0.25);
            prop_assert_eq!(next.start, signal);
        }
    }
}
