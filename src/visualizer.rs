//! Bar-graph spectrum of the call audio for the UI

use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::audio::{calculate_rms, rms_to_level, SharedMixer};
use crate::config::VisualizerSettings;

/// One rendered frame: bar heights and overall level, all in 0.0 - 1.0
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SpectrumFrame {
    pub bars: Vec<f32>,
    pub level: f32,
}

/// Windowed FFT with per-bin smoothing over time
pub struct SpectrumAnalyzer {
    settings: VisualizerSettings,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    smoothed: Vec<f32>,
}

impl SpectrumAnalyzer {
    pub fn new(settings: VisualizerSettings) -> Self {
        let size = settings.fft_size.max(2);
        let fft = FftPlanner::new().plan_fft_forward(size);
        let window = (0..size)
            .map(|i| {
                0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / size as f32).cos()
            })
            .collect();
        Self {
            fft,
            window,
            smoothed: vec![0.0; size / 2],
            settings,
        }
    }

    pub fn fft_size(&self) -> usize {
        self.window.len()
    }

    /// Analyse the most recent `fft_size` samples
    pub fn analyze(&mut self, samples: &[f32]) -> SpectrumFrame {
        let size = self.fft_size();
        let tail = &samples[samples.len().saturating_sub(size)..];
        let mut buffer: Vec<Complex32> = vec![Complex32::new(0.0, 0.0); size - tail.len()];
        buffer.extend(tail.iter().map(|&s| Complex32::new(s, 0.0)));
        for (sample, w) in buffer.iter_mut().zip(&self.window) {
            sample.re *= w;
        }

        self.fft.process(&mut buffer);

        let smoothing = self.settings.smoothing.clamp(0.0, 0.99);
        for (smoothed, bin) in self.smoothed.iter_mut().zip(&buffer) {
            let magnitude = bin.norm() / size as f32;
            *smoothed = smoothing * *smoothed + (1.0 - smoothing) * magnitude;
        }

        let bins_per_bar = (self.smoothed.len() / self.settings.bars.max(1)).max(1);
        let bars = self
            .smoothed
            .chunks(bins_per_bar)
            .take(self.settings.bars)
            .map(|chunk| {
                let mean = chunk.iter().sum::<f32>() / chunk.len() as f32;
                self.scale(mean)
            })
            .collect();

        SpectrumFrame {
            bars,
            level: rms_to_level(calculate_rms(tail)),
        }
    }

    /// Magnitude to a 0..1 height over the configured decibel range
    fn scale(&self, magnitude: f32) -> f32 {
        let db = 20.0 * magnitude.max(1e-12).log10();
        let range = self.settings.max_db - self.settings.min_db;
        ((db - self.settings.min_db) / range).clamp(0.0, 1.0)
    }

    pub fn reset(&mut self) {
        self.smoothed.fill(0.0);
    }
}

/// Sample the output mix on a fixed interval until the task is aborted
pub fn spawn_visualizer<F>(
    mixer: SharedMixer,
    settings: VisualizerSettings,
    mut on_frame: F,
) -> JoinHandle<()>
where
    F: FnMut(SpectrumFrame) + Send + 'static,
{
    tokio::spawn(async move {
        let period = Duration::from_millis(settings.interval_ms.max(1));
        let mut analyzer = SpectrumAnalyzer::new(settings);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let window = mixer.lock().analysis_window(analyzer.fft_size());
            on_frame(analyzer.analyze(&window));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::OutputMixer;
    use parking_lot::Mutex;

    fn sine(freq: f32, rate: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / rate).sin() * 0.5)
            .collect()
    }

    #[test]
    fn test_silence_renders_flat_bars() {
        let mut analyzer = SpectrumAnalyzer::new(VisualizerSettings::default());
        let frame = analyzer.analyze(&[0.0; 1024]);
        assert_eq!(frame.bars.len(), 32);
        assert!(frame.bars.iter().all(|&b| b == 0.0));
        assert_eq!(frame.level, 0.0);
    }

    #[test]
    fn test_tone_peaks_in_matching_bar() {
        let settings = VisualizerSettings {
            smoothing: 0.0,
            ..VisualizerSettings::default()
        };
        let mut analyzer = SpectrumAnalyzer::new(settings);
        // 1024-point FFT at 24kHz: 512 bins of 23.4Hz, 16 bins per bar.
        // 1500Hz sits in bin 64, bar 4.
        let frame = analyzer.analyze(&sine(1500.0, 24000.0, 1024));
        let loudest = frame
            .bars
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(loudest, 4);
        assert!(frame.level > 0.5);
    }

    #[test]
    fn test_smoothing_decays_gradually() {
        let mut analyzer = SpectrumAnalyzer::new(VisualizerSettings::default());
        let loud = analyzer.analyze(&sine(1500.0, 24000.0, 1024));
        let after = analyzer.analyze(&[0.0; 1024]);
        assert!(after.bars[4] > 0.0);
        assert!(after.bars[4] < loud.bars[4]);
        assert_eq!(after.level, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_visualizer_emits_frames_on_interval() {
        let mixer = OutputMixer::shared(24000);
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        let task = spawn_visualizer(mixer, VisualizerSettings::default(), move |frame| {
            sink.lock().push(frame)
        });

        tokio::time::sleep(Duration::from_millis(225)).await;
        task.abort();
        assert_eq!(frames.lock().len(), 5);
    }
}
