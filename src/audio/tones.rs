//! Oscillator-based synthesis of signaling and feedback sounds

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f32::consts::PI;

/// Length of the tone played for each keypress
pub const DTMF_TONE_MS: u32 = 150;

const RAMP_MS: u32 = 5;
const DTMF_ROWS: [f32; 4] = [697.0, 770.0, 852.0, 941.0];
const DTMF_COLS: [f32; 4] = [1209.0, 1336.0, 1477.0, 1633.0];

/// Low and high frequency of a keypad key
pub fn dtmf_frequencies(key: char) -> Option<(f32, f32)> {
    let (row, col) = match key.to_ascii_uppercase() {
        '1' => (0, 0),
        '2' => (0, 1),
        '3' => (0, 2),
        'A' => (0, 3),
        '4' => (1, 0),
        '5' => (1, 1),
        '6' => (1, 2),
        'B' => (1, 3),
        '7' => (2, 0),
        '8' => (2, 1),
        '9' => (2, 2),
        'C' => (2, 3),
        '*' => (3, 0),
        '0' => (3, 1),
        '#' => (3, 2),
        'D' => (3, 3),
        _ => return None,
    };
    Some((DTMF_ROWS[row], DTMF_COLS[col]))
}

/// Tone generator bound to one sample rate
#[derive(Clone, Copy, Debug)]
pub struct ToneSynth {
    sample_rate: u32,
}

impl ToneSynth {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn samples_for(&self, ms: u32) -> usize {
        (self.sample_rate as usize * ms as usize) / 1000
    }

    /// Sum of equal-amplitude sines with short linear ramps at both ends
    fn sines(&self, freqs: &[f32], ms: u32, amplitude: f32) -> Vec<f32> {
        let len = self.samples_for(ms);
        let ramp = self.samples_for(RAMP_MS).max(1).min(len / 2 + 1);
        let per_tone = amplitude / freqs.len().max(1) as f32;
        let rate = self.sample_rate as f32;

        (0..len)
            .map(|i| {
                let t = i as f32 / rate;
                let value: f32 = freqs.iter().map(|f| (2.0 * PI * f * t).sin()).sum();
                let envelope = if i < ramp {
                    i as f32 / ramp as f32
                } else if len - i <= ramp {
                    (len - i) as f32 / ramp as f32
                } else {
                    1.0
                };
                value * per_tone * envelope
            })
            .collect()
    }

    fn silence(&self, ms: u32) -> Vec<f32> {
        vec![0.0; self.samples_for(ms)]
    }

    /// Dual tone for a keypad key, `None` for keys outside the 4x4 pad
    pub fn dtmf(&self, key: char, ms: u32) -> Option<Vec<f32>> {
        let (low, high) = dtmf_frequencies(key)?;
        Some(self.sines(&[low, high], ms, 0.8))
    }

    /// One ringback cycle: 440+480Hz for 2s, then 4s of silence
    pub fn ringback_cycle(&self) -> Vec<f32> {
        let mut cycle = self.sines(&[440.0, 480.0], 2000, 0.6);
        cycle.extend(self.silence(4000));
        cycle
    }

    /// Reorder tone signalling a failed call: 480+620Hz, three 250ms bursts
    pub fn failure_tone(&self) -> Vec<f32> {
        let mut out = Vec::new();
        for _ in 0..3 {
            out.extend(self.sines(&[480.0, 620.0], 250, 0.6));
            out.extend(self.silence(250));
        }
        out
    }

    /// Short click for UI buttons
    pub fn key_click(&self) -> Vec<f32> {
        self.sines(&[1800.0], 30, 0.3)
    }

    /// Two rising notes played before an automated prompt
    pub fn prompt_chime(&self) -> Vec<f32> {
        let mut out = self.sines(&[659.25], 120, 0.4);
        out.extend(self.silence(30));
        out.extend(self.sines(&[880.0], 180, 0.4));
        out
    }

    /// Looping arpeggio used as hold music
    pub fn hold_music_loop(&self) -> Vec<f32> {
        // C major, A minor, F major, G major
        const CHORDS: [[f32; 3]; 4] = [
            [261.63, 329.63, 392.00],
            [220.00, 261.63, 329.63],
            [174.61, 220.00, 261.63],
            [196.00, 246.94, 293.66],
        ];
        let mut out = Vec::new();
        for chord in CHORDS.iter() {
            for _ in 0..2 {
                for &note in chord.iter().chain(std::iter::once(&chord[1])) {
                    let mut tone = self.sines(&[note, note * 2.0], 250, 0.5);
                    apply_decay(&mut tone, 3.0);
                    out.extend(tone);
                }
            }
        }
        out
    }

    /// Seconds of soft background noise, low-passed to a murmur
    pub fn ambience_loop(&self, seconds: u32, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        let len = self.sample_rate as usize * seconds as usize;
        let mut out = Vec::with_capacity(len);
        let mut brown = 0.0f32;
        let mut smoothed = 0.0f32;
        for _ in 0..len {
            let white: f32 = rng.gen_range(-1.0..1.0);
            brown = (brown + white * 0.02).clamp(-1.0, 1.0) * 0.998;
            smoothed += (brown - smoothed) * 0.05;
            out.push(smoothed * 3.0);
        }
        crossfade_loop(&mut out, self.samples_for(200));
        for s in out.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }
        out
    }
}

/// Exponential decay over the length of the buffer
fn apply_decay(samples: &mut [f32], rate: f32) {
    let len = samples.len().max(1) as f32;
    for (i, s) in samples.iter_mut().enumerate() {
        *s *= (-rate * i as f32 / len).exp();
    }
}

/// Blend the tail into the head so the buffer loops without a click
fn crossfade_loop(samples: &mut Vec<f32>, fade: usize) {
    if fade == 0 || samples.len() <= fade * 2 {
        return;
    }
    let tail: Vec<f32> = samples.split_off(samples.len() - fade);
    for (i, t) in tail.into_iter().enumerate() {
        let w = i as f32 / fade as f32;
        samples[i] = samples[i] * w + t * (1.0 - w);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Energy of one frequency via the Goertzel recurrence
    fn power_at(samples: &[f32], freq: f32, rate: u32) -> f32 {
        let k = 2.0 * (2.0 * PI * freq / rate as f32).cos();
        let (mut s1, mut s2) = (0.0f32, 0.0f32);
        for &x in samples {
            let s0 = x + k * s1 - s2;
            s2 = s1;
            s1 = s0;
        }
        s1 * s1 + s2 * s2 - k * s1 * s2
    }

    #[test]
    fn test_dtmf_table() {
        assert_eq!(dtmf_frequencies('1'), Some((697.0, 1209.0)));
        assert_eq!(dtmf_frequencies('0'), Some((941.0, 1336.0)));
        assert_eq!(dtmf_frequencies('#'), Some((941.0, 1477.0)));
        assert_eq!(dtmf_frequencies('d'), Some((941.0, 1633.0)));
        assert_eq!(dtmf_frequencies('x'), None);
    }

    #[test]
    fn test_dtmf_contains_both_tones() {
        let synth = ToneSynth::new(24000);
        let tone = synth.dtmf('5', DTMF_TONE_MS).unwrap();
        assert_eq!(tone.len(), 3600);
        assert!(tone.iter().all(|s| s.abs() <= 1.0));

        let low = power_at(&tone, 770.0, 24000);
        let high = power_at(&tone, 1336.0, 24000);
        let off = power_at(&tone, 1000.0, 24000);
        assert!(low > off * 50.0);
        assert!(high > off * 50.0);
    }

    #[test]
    fn test_unknown_key_is_silent() {
        assert!(ToneSynth::new(24000).dtmf('?', 100).is_none());
    }

    #[test]
    fn test_ringback_cadence() {
        let synth = ToneSynth::new(8000);
        let cycle = synth.ringback_cycle();
        assert_eq!(cycle.len(), 6 * 8000);
        assert!(cycle[..16000].iter().any(|s| s.abs() > 0.1));
        assert!(cycle[16000..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_failure_tone_length() {
        let synth = ToneSynth::new(16000);
        assert_eq!(synth.failure_tone().len(), 16000 * 3 / 2);
    }

    #[test]
    fn test_loops_stay_in_range() {
        let synth = ToneSynth::new(8000);
        let hold = synth.hold_music_loop();
        assert_eq!(hold.len(), 4 * 2 * 4 * 2000);
        assert!(hold.iter().all(|s| s.abs() <= 1.0));

        let ambience = synth.ambience_loop(2, 7);
        assert_eq!(ambience.len(), 16000 - 1600);
        assert!(ambience.iter().all(|s| s.abs() <= 1.0));
        assert_eq!(ambience, synth.ambience_loop(2, 7));
    }
}
