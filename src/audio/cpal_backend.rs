//! Sound card backend using cpal

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use parking_lot::Mutex;
use std::sync::Arc;

use super::codec::resample_linear;
use super::device::{ActiveStream, AudioBackend, CaptureSender};
use super::mixer::SharedMixer;
use crate::error::{CallError, Result};

/// Microphone and speaker I/O on the default (or named) devices
pub struct CpalBackend {
    input_device: Option<String>,
    output_device: Option<String>,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self {
            input_device: None,
            output_device: None,
        }
    }

    /// Select devices by name. Pass None for the default device.
    pub fn with_devices(input: Option<String>, output: Option<String>) -> Self {
        Self {
            input_device: input,
            output_device: output,
        }
    }

    /// List available input devices
    pub fn list_input_devices() -> Result<Vec<String>> {
        let devices = cpal::default_host()
            .input_devices()
            .map_err(|e| CallError::Permission(format!("Failed to enumerate input devices: {}", e)))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    /// List available output devices
    pub fn list_output_devices() -> Result<Vec<String>> {
        let devices = cpal::default_host()
            .output_devices()
            .map_err(|e| CallError::Permission(format!("Failed to enumerate output devices: {}", e)))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    fn find_input(&self) -> Result<cpal::Device> {
        let host = cpal::default_host();
        match &self.input_device {
            Some(name) => host
                .input_devices()
                .map_err(|e| CallError::Permission(format!("Failed to enumerate devices: {}", e)))?
                .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                .ok_or_else(|| CallError::Permission(format!("Device '{}' not found", name))),
            None => host
                .default_input_device()
                .ok_or_else(|| CallError::Permission("No default input device available".into())),
        }
    }

    fn find_output(&self) -> Result<cpal::Device> {
        let host = cpal::default_host();
        match &self.output_device {
            Some(name) => host
                .output_devices()
                .map_err(|e| CallError::Permission(format!("Failed to enumerate devices: {}", e)))?
                .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                .ok_or_else(|| CallError::Permission(format!("Device '{}' not found", name))),
            None => host
                .default_output_device()
                .ok_or_else(|| CallError::Permission("No default output device available".into())),
        }
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

struct DeviceStream {
    stream: Option<Stream>,
}

// Safety: the stream is only dropped, never used across threads otherwise
unsafe impl Send for DeviceStream {}

impl ActiveStream for DeviceStream {
    fn stop(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!("Audio device stream stopped");
        }
    }
}

/// Downmix, resample and cut captured audio into fixed blocks
struct BlockAssembler {
    channels: usize,
    device_rate: u32,
    target_rate: u32,
    block_size: usize,
    pending: Vec<f32>,
    frames: CaptureSender,
}

impl BlockAssembler {
    fn push(&mut self, data: &[f32]) {
        let mono: Vec<f32> = if self.channels > 1 {
            data.chunks(self.channels)
                .map(|c| c.iter().sum::<f32>() / self.channels as f32)
                .collect()
        } else {
            data.to_vec()
        };
        let resampled = resample_linear(&mono, self.device_rate, self.target_rate);
        self.pending.extend_from_slice(&resampled);

        while self.pending.len() >= self.block_size {
            let block: Vec<f32> = self.pending.drain(..self.block_size).collect();
            let _ = self.frames.send(block);
        }
    }
}

impl AudioBackend for CpalBackend {
    fn open_input(
        &self,
        sample_rate: u32,
        block_size: usize,
        frames: CaptureSender,
    ) -> Result<Box<dyn ActiveStream>> {
        let device = self.find_input()?;
        tracing::info!("Starting audio capture on: {}", device.name().unwrap_or_default());

        let supported_config = device
            .default_input_config()
            .map_err(|e| CallError::Permission(format!("Failed to get input config: {}", e)))?;
        let config: StreamConfig = supported_config.config();

        let assembler = Arc::new(Mutex::new(BlockAssembler {
            channels: config.channels as usize,
            device_rate: config.sample_rate.0,
            target_rate: sample_rate,
            block_size,
            pending: Vec::with_capacity(block_size * 2),
            frames,
        }));

        let err_fn = |err| {
            tracing::error!("Audio capture error: {}", err);
        };

        let stream = match supported_config.sample_format() {
            SampleFormat::F32 => {
                let assembler = assembler.clone();
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        assembler.lock().push(data);
                    },
                    err_fn,
                    None,
                )
            }
            SampleFormat::I16 => {
                let assembler = assembler.clone();
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let float_data: Vec<f32> =
                            data.iter().map(|&s| s as f32 / i16::MAX as f32).collect();
                        assembler.lock().push(&float_data);
                    },
                    err_fn,
                    None,
                )
            }
            SampleFormat::U16 => {
                let assembler = assembler.clone();
                device.build_input_stream(
                    &config,
                    move |data: &[u16], _: &cpal::InputCallbackInfo| {
                        let float_data: Vec<f32> = data
                            .iter()
                            .map(|&s| (s as f32 / u16::MAX as f32) * 2.0 - 1.0)
                            .collect();
                        assembler.lock().push(&float_data);
                    },
                    err_fn,
                    None,
                )
            }
            format => {
                return Err(CallError::Permission(format!(
                    "Unsupported sample format: {:?}",
                    format
                )));
            }
        }
        .map_err(|e| CallError::Permission(format!("Failed to build input stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| CallError::Permission(format!("Failed to start capture: {}", e)))?;

        tracing::info!("Audio capture started");
        Ok(Box::new(DeviceStream {
            stream: Some(stream),
        }))
    }

    fn open_output(&self, mixer: SharedMixer) -> Result<Box<dyn ActiveStream>> {
        let device = self.find_output()?;
        tracing::info!("Starting audio playback on: {}", device.name().unwrap_or_default());

        let config = StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(mixer.lock().sample_rate()),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    mixer.lock().render(data);
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(|e| CallError::Permission(format!("Failed to build output stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| CallError::Permission(format!("Failed to start playback: {}", e)))?;

        tracing::info!("Audio playback started");
        Ok(Box::new(DeviceStream {
            stream: Some(stream),
        }))
    }
}
