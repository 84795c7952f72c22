//! Capture and playback backends
//!
//! A backend opens the microphone (delivering fixed-size mono blocks at the
//! capture rate) and drives the output mixer (which advances the output
//! clock). The headless backend does both on tokio timers so calls can run
//! without a sound card.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::mixer::SharedMixer;
use crate::error::Result;

/// Frames of microphone audio, each exactly one capture block long
pub type CaptureSender = mpsc::UnboundedSender<Vec<f32>>;

/// A running capture or playback stream. Dropping it stops the stream.
pub trait ActiveStream: Send {
    fn stop(&mut self);
}

pub trait AudioBackend: Send + Sync {
    /// Start the microphone. Denied or missing devices are `CallError::Permission`.
    fn open_input(
        &self,
        sample_rate: u32,
        block_size: usize,
        frames: CaptureSender,
    ) -> Result<Box<dyn ActiveStream>>;

    /// Start pulling rendered audio out of the mixer
    fn open_output(&self, mixer: SharedMixer) -> Result<Box<dyn ActiveStream>>;
}

/// Timer-driven backend with a silent microphone
#[derive(Clone, Debug)]
pub struct HeadlessBackend {
    render_frame_ms: u32,
}

impl HeadlessBackend {
    pub fn new(render_frame_ms: u32) -> Self {
        Self {
            render_frame_ms: render_frame_ms.max(1),
        }
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new(20)
    }
}

struct TaskStream {
    task: Option<JoinHandle<()>>,
}

impl ActiveStream for TaskStream {
    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for TaskStream {
    fn drop(&mut self) {
        self.stop();
    }
}

impl AudioBackend for HeadlessBackend {
    fn open_input(
        &self,
        sample_rate: u32,
        block_size: usize,
        frames: CaptureSender,
    ) -> Result<Box<dyn ActiveStream>> {
        let period = Duration::from_secs_f64(block_size as f64 / sample_rate.max(1) as f64);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                if frames.send(vec![0.0; block_size]).is_err() {
                    break;
                }
            }
        });
        tracing::debug!("Headless capture started ({} samples per block)", block_size);
        Ok(Box::new(TaskStream { task: Some(task) }))
    }

    fn open_output(&self, mixer: SharedMixer) -> Result<Box<dyn ActiveStream>> {
        let frame_ms = self.render_frame_ms;
        let frame_len = (mixer.lock().sample_rate() as usize * frame_ms as usize) / 1000;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(frame_ms as u64));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);
            let mut frame = vec![0.0f32; frame_len];
            interval.tick().await;
            loop {
                interval.tick().await;
                mixer.lock().render(&mut frame);
            }
        });
        tracing::debug!("Headless playback started ({} ms frames)", frame_ms);
        Ok(Box::new(TaskStream { task: Some(task) }))
    }
}
