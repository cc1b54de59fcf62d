//! PCM format conversion between the device's native mic format and the
//! upstream service's fixed 16 kHz mono s16le format, and back to the
//! device's speaker format.
//!
//! Resampling is stateful: each converter owns a [`rubato::SincFixedIn`]
//! resampler plus an accumulator buffer, and both persist for the lifetime
//! of the session. Constructing a fresh resampler per chunk would discard
//! filter history and produce audible artifacts at chunk boundaries.

use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};

use crate::error::{BridgeError, Result};

/// Frames accumulated per resampler call before it has enough input to run.
const RESAMPLE_CHUNK_FRAMES: usize = 1024;

/// Immutable description of a PCM stream's layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MicFormat {
    pub sample_rate: u32,
    pub bits_per_sample: u32,
    pub channels: u8,
}

impl MicFormat {
    pub fn new(sample_rate: u32, bits_per_sample: u32, channels: u8) -> Result<Self> {
        let format = Self {
            sample_rate,
            bits_per_sample,
            channels,
        };
        format.validate()?;
        Ok(format)
    }

    fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(BridgeError::bad_control("mic sample_rate must be > 0"));
        }
        if self.bits_per_sample == 0 || self.bits_per_sample % 8 != 0 {
            return Err(BridgeError::bad_control(
                "mic bits_per_sample must be a positive multiple of 8",
            ));
        }
        if self.channels != 1 && self.channels != 2 {
            return Err(BridgeError::bad_control("mic channels must be 1 or 2"));
        }
        Ok(())
    }
}

impl Default for MicFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            bits_per_sample: 32,
            channels: 2,
        }
    }
}

fn sinc_params() -> SincInterpolationParameters {
    SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.8,
        interpolation: SincInterpolationType::Nearest,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    }
}

/// A stateful mono f32 resampler with an input accumulator, so callers can
/// feed it chunks of any size and it only runs the underlying resampler once
/// enough frames have built up. Leftover frames carry over to the next call.
struct ResamplerStage {
    resampler: SincFixedIn<f32>,
    pending: Vec<f32>,
    scratch: Vec<f32>,
}

impl ResamplerStage {
    fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        let ratio = to_rate as f64 / from_rate as f64;
        let resampler = SincFixedIn::<f32>::new(ratio, 1.0, sinc_params(), RESAMPLE_CHUNK_FRAMES, 1)
            .map_err(|e| BridgeError::socket(format!("resampler init failed: {e}")))?;
        Ok(Self {
            resampler,
            pending: Vec::new(),
            scratch: Vec::new(),
        })
    }

    fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let mut output = Vec::new();
        loop {
            let needed = self.resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let max_out = self.resampler.output_frames_max();
            if self.scratch.len() < max_out {
                self.scratch.resize(max_out, 0.0);
            }
            let (_, written) = self
                .resampler
                .process_into_buffer(&[chunk], &mut [self.scratch.as_mut_slice()], None)
                .map_err(|e| BridgeError::socket(format!("resample failed: {e}")))?;
            output.extend_from_slice(&self.scratch[..written]);
        }
        Ok(output)
    }
}

fn read_signed_sample(bytes: &[u8]) -> i64 {
    let width = bytes.len();
    let mut value: i64 = 0;
    for (i, &b) in bytes.iter().enumerate() {
        value |= (b as i64) << (8 * i);
    }
    let bits = (width as u32) * 8;
    let sign_bit = 1i64 << (bits - 1);
    if value & sign_bit != 0 {
        value -= 1i64 << bits;
    }
    value
}

fn decode_interleaved(input: &[u8], bits_per_sample: u32) -> Vec<i64> {
    let width = (bits_per_sample / 8) as usize;
    input.chunks_exact(width).map(read_signed_sample).collect()
}

fn downmix_to_mono(samples: &[i64], channels: u8) -> Vec<i64> {
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(2)
        .map(|pair| ((pair[0] as f64 + pair[1] as f64) / 2.0).round() as i64)
        .collect()
}

fn to_i16_saturating(samples: &[i64], bits_per_sample: u32) -> Vec<i16> {
    let shift = bits_per_sample as i32 - 16;
    samples
        .iter()
        .map(|&s| {
            let scaled = match shift.cmp(&0) {
                std::cmp::Ordering::Greater => s >> shift,
                std::cmp::Ordering::Less => s << (-shift),
                std::cmp::Ordering::Equal => s,
            };
            scaled.clamp(i16::MIN as i64, i16::MAX as i64) as i16
        })
        .collect()
}

fn i16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        buf.extend_from_slice(&s.to_le_bytes());
    }
    buf
}

fn le_bytes_to_i16(input: &[u8]) -> Vec<i16> {
    input
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Root-mean-square amplitude of a buffer of 16-bit samples. Used by the
/// mic uplink to decide whether a converted chunk counts as voice activity.
pub fn rms_i16(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt()
}

pub fn rms_of_le_bytes(pcm: &[u8]) -> f64 {
    rms_i16(&le_bytes_to_i16(pcm))
}

/// Converts raw device mic PCM into 16-bit mono PCM at the service's rate.
pub struct MicToServiceConverter {
    mic_format: MicFormat,
    stage: Option<ResamplerStage>,
}

impl MicToServiceConverter {
    pub fn new(mic_format: MicFormat, target_rate: u32) -> Result<Self> {
        let stage = if mic_format.sample_rate == target_rate {
            None
        } else {
            Some(ResamplerStage::new(mic_format.sample_rate, target_rate)?)
        };
        Ok(Self { mic_format, stage })
    }

    /// Downmix, width-convert, and (if needed) resample one chunk of mic PCM.
    pub fn convert(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        if input.is_empty() {
            return Ok(Vec::new());
        }
        let interleaved = decode_interleaved(input, self.mic_format.bits_per_sample);
        let mono = downmix_to_mono(&interleaved, self.mic_format.channels);
        let mono_i16 = to_i16_saturating(&mono, self.mic_format.bits_per_sample);

        let Some(stage) = self.stage.as_mut() else {
            return Ok(i16_to_le_bytes(&mono_i16));
        };

        let float_in: Vec<f32> = mono_i16.iter().map(|&s| s as f32 / 32768.0).collect();
        let float_out = stage.process(&float_in)?;
        let out_i16: Vec<i16> = float_out
            .iter()
            .map(|&f| (f * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16)
            .collect();
        Ok(i16_to_le_bytes(&out_i16))
    }
}

/// Converts 16-bit mono service PCM into the device's speaker format.
pub struct ServiceToDeviceConverter {
    device_rate: u32,
    device_channels: u8,
    stage: Option<ResamplerStage>,
}

impl ServiceToDeviceConverter {
    pub fn new(service_rate: u32, device_rate: u32, device_channels: u8) -> Result<Self> {
        let stage = if service_rate == device_rate {
            None
        } else {
            Some(ResamplerStage::new(service_rate, device_rate)?)
        };
        Ok(Self {
            device_rate,
            device_channels,
            stage,
        })
    }

    pub fn convert(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        if input.is_empty() {
            return Ok(Vec::new());
        }
        let mono_i16 = le_bytes_to_i16(input);

        let resampled: Vec<i16> = match self.stage.as_mut() {
            None => mono_i16,
            Some(stage) => {
                let float_in: Vec<f32> = mono_i16.iter().map(|&s| s as f32 / 32768.0).collect();
                let float_out = stage.process(&float_in)?;
                float_out
                    .iter()
                    .map(|&f| (f * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16)
                    .collect()
            }
        };

        if self.device_channels == 2 {
            let mut stereo = Vec::with_capacity(resampled.len() * 2);
            for s in resampled {
                stereo.push(s);
                stereo.push(s);
            }
            Ok(i16_to_le_bytes(&stereo))
        } else {
            Ok(i16_to_le_bytes(&resampled))
        }
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }
}
