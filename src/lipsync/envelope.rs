// Amplitude envelope extraction
// Turns a mono sample buffer into a fixed-hop curve of mouth openness values in [0, 1]

use rayon::prelude::*;
use tracing::debug;

use super::onset::{EnergyOnsetDetector, OnsetDetector};
use crate::audio::AudioTrack;
use crate::error::{Error, Result};
use crate::settings::EnvelopeSettings;

/// Parameters for building an envelope
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeParams {
    /// Samples per curve entry
    pub hop_length: usize,
    /// Moving-average width; 0 or 1 disables smoothing
    pub smoothing_window: usize,
    /// Clip-added at onset frames. None skips onset detection.
    pub onset_boost: Option<f32>,
}

/// Same values as the engine's default `EnvelopeSettings`
impl Default for EnvelopeParams {
    fn default() -> Self {
        Self::from(&EnvelopeSettings::default())
    }
}

impl From<&EnvelopeSettings> for EnvelopeParams {
    fn from(settings: &EnvelopeSettings) -> Self {
        Self {
            hop_length: settings.hop_length,
            smoothing_window: settings.smoothing_window,
            onset_boost: settings.onset_boost,
        }
    }
}

/// Openness curve, one value per `hop_length` samples.
///
/// Values are relative to the loudest moment of the track they were built
/// from, not an absolute loudness.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeCurve {
    values: Vec<f32>,
    hop_length: usize,
    sample_rate: u32,
}

impl EnvelopeCurve {
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<f32> {
        self.values.get(index).copied()
    }

    pub fn hop_length(&self) -> usize {
        self.hop_length
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Seconds covered by one entry
    pub fn frame_duration(&self) -> f64 {
        self.hop_length as f64 / self.sample_rate as f64
    }

    /// Integer openness in `0..=max`, truncating like a pixel offset would
    pub fn to_pixel_scale(&self, max: u16) -> Vec<u16> {
        self.values
            .iter()
            .map(|&v| ((v * max as f32) as u16).min(max))
            .collect()
    }
}

pub struct EnvelopeExtractor {
    params: EnvelopeParams,
    onset_detector: Option<Box<dyn OnsetDetector>>,
}

impl EnvelopeExtractor {
    /// Uses the built-in energy onset detector when `onset_boost` is set
    pub fn new(params: EnvelopeParams) -> Self {
        let onset_detector: Option<Box<dyn OnsetDetector>> = match params.onset_boost {
            Some(_) => Some(Box::new(EnergyOnsetDetector::default())),
            None => None,
        };
        Self {
            params,
            onset_detector,
        }
    }

    /// Replace the onset collaborator
    pub fn with_onset_detector(mut self, detector: Box<dyn OnsetDetector>) -> Self {
        self.onset_detector = Some(detector);
        self
    }

    pub fn params(&self) -> &EnvelopeParams {
        &self.params
    }

    pub fn build(&self, track: &AudioTrack) -> Result<EnvelopeCurve> {
        self.build_from_samples(track.samples(), track.sample_rate())
    }

    pub fn build_from_samples(&self, samples: &[f32], sample_rate: u32) -> Result<EnvelopeCurve> {
        let hop = self.params.hop_length;
        if hop == 0 {
            return Err(Error::InvalidParameter("hop_length must be greater than zero".into()));
        }
        if sample_rate == 0 {
            return Err(Error::InvalidParameter("sample rate must be greater than zero".into()));
        }

        let peaks = window_peaks(samples, hop);
        let smoothed = smooth(&peaks, self.params.smoothing_window);
        let mut values = normalize(smoothed);

        if let (Some(boost), Some(detector)) = (self.params.onset_boost, &self.onset_detector) {
            let onsets = detector.detect(samples, sample_rate, hop);
            apply_onset_boost(&mut values, &onsets, hop as f64 / sample_rate as f64, boost);
        }

        debug!(
            "Built envelope: {} frames from {} samples (hop {})",
            values.len(),
            samples.len(),
            hop
        );

        Ok(EnvelopeCurve {
            values,
            hop_length: hop,
            sample_rate,
        })
    }
}

impl Default for EnvelopeExtractor {
    fn default() -> Self {
        Self::new(EnvelopeParams::default())
    }
}

/// Peak absolute amplitude of each non-overlapping window; the last may be short
pub fn window_peaks(samples: &[f32], hop_length: usize) -> Vec<f32> {
    samples
        .par_chunks(hop_length)
        .map(|w| w.iter().fold(0.0f32, |acc, s| acc.max(s.abs())))
        .collect()
}

/// Centered moving average with zero padding, same length as the input.
///
/// For even widths the window leans one sample to the left.
pub fn smooth(values: &[f32], window: usize) -> Vec<f32> {
    if window <= 1 || values.is_empty() {
        return values.to_vec();
    }

    let n = values.len() as isize;
    let right = ((window - 1) / 2) as isize;
    let left = window as isize - 1 - right;

    (0..n)
        .map(|i| {
            let lo = (i - left).max(0);
            let hi = (i + right).min(n - 1);
            let sum: f32 = values[lo as usize..=hi as usize].iter().sum();
            sum / window as f32
        })
        .collect()
}

/// Divide by the maximum; silence stays all zeros
pub fn normalize(mut values: Vec<f32>) -> Vec<f32> {
    let max = values.iter().cloned().fold(0.0f32, f32::max);
    if max > 0.0 {
        for v in values.iter_mut() {
            *v = (*v / max).clamp(0.0, 1.0);
        }
    } else {
        values.iter_mut().for_each(|v| *v = 0.0);
    }
    values
}

fn apply_onset_boost(values: &mut [f32], onsets: &[f64], frame_duration: f64, boost: f32) {
    for &time in onsets {
        if time < 0.0 {
            continue;
        }
        let frame = (time / frame_duration) as usize;
        if let Some(v) = values.get_mut(frame) {
            *v = (*v + boost).min(1.0);
        }
    }
}
