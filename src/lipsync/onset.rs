// Onset detection
// Finds sudden rises in energy so consonant attacks can be made more visible

/// Something that can locate onsets in a mono signal
pub trait OnsetDetector: Send + Sync {
    /// Onset times in seconds, ascending
    fn detect(&self, samples: &[f32], sample_rate: u32, hop_length: usize) -> Vec<f64>;
}

/// Positive log-energy flux with adaptive-threshold peak picking.
///
/// Works on the same hop grid as the envelope, so every reported time
/// lands exactly on a frame boundary.
#[derive(Debug, Clone)]
pub struct EnergyOnsetDetector {
    /// Flux (normalized to [0,1]) must exceed the local mean by this much
    pub delta: f32,
    /// Seconds before a frame that it must be the maximum of
    pub pre_max: f64,
    /// Window used for the local mean, either side
    pub average_window: f64,
    /// Minimum seconds between onsets
    pub wait: f64,
}

impl Default for EnergyOnsetDetector {
    fn default() -> Self {
        Self {
            delta: 0.07,
            pre_max: 0.03,
            average_window: 0.1,
            wait: 0.03,
        }
    }
}

impl EnergyOnsetDetector {
    /// Positive first difference of per-window log energy, scaled to [0,1]
    pub fn onset_strength(samples: &[f32], hop_length: usize) -> Vec<f32> {
        if hop_length == 0 || samples.is_empty() {
            return Vec::new();
        }

        let log_energy: Vec<f32> = samples
            .chunks(hop_length)
            .map(|w| {
                let mean_sq = w.iter().map(|s| s * s).sum::<f32>() / w.len() as f32;
                10.0 * (mean_sq + 1e-10).log10()
            })
            .collect();

        let mut flux = Vec::with_capacity(log_energy.len());
        flux.push(0.0);
        flux.extend(log_energy.windows(2).map(|pair| (pair[1] - pair[0]).max(0.0)));

        let peak = flux.iter().cloned().fold(0.0f32, f32::max);
        if peak > 0.0 {
            for v in flux.iter_mut() {
                *v /= peak;
            }
        }
        flux
    }

    fn frames(seconds: f64, sample_rate: u32, hop_length: usize) -> usize {
        (seconds * sample_rate as f64 / hop_length as f64).round() as usize
    }
}

impl OnsetDetector for EnergyOnsetDetector {
    fn detect(&self, samples: &[f32], sample_rate: u32, hop_length: usize) -> Vec<f64> {
        let strength = Self::onset_strength(samples, hop_length);
        if strength.is_empty() || sample_rate == 0 {
            return Vec::new();
        }

        let pre_max = Self::frames(self.pre_max, sample_rate, hop_length);
        let avg = Self::frames(self.average_window, sample_rate, hop_length).max(1);
        let wait = Self::frames(self.wait, sample_rate, hop_length);
        let frame_duration = hop_length as f64 / sample_rate as f64;

        let mut onsets = Vec::new();
        let mut last: Option<usize> = None;

        for (i, &value) in strength.iter().enumerate() {
            if value <= 0.0 {
                continue;
            }

            let max_lo = i.saturating_sub(pre_max);
            let local_max = strength[max_lo..=i].iter().cloned().fold(0.0f32, f32::max);
            if value < local_max {
                continue;
            }

            let avg_lo = i.saturating_sub(avg);
            let avg_hi = (i + avg + 1).min(strength.len());
            let window = &strength[avg_lo..avg_hi];
            let mean = window.iter().sum::<f32>() / window.len() as f32;
            if value < mean + self.delta {
                continue;
            }

            if let Some(prev) = last {
                if i - prev <= wait {
                    continue;
                }
            }

            last = Some(i);
            onsets.push(i as f64 * frame_duration);
        }

        onsets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn burst_signal(hop: usize, silent_frames: usize, loud_frames: usize) -> Vec<f32> {
        let mut samples = vec![0.0f32; hop * silent_frames];
        samples.extend((0..hop * loud_frames).map(|i| if i % 2 == 0 { 0.8 } else { -0.8 }));
        samples
    }

    #[test]
    fn test_silence_has_no_onsets() {
        let detector = EnergyOnsetDetector::default();
        assert!(detector.detect(&vec![0.0; 22050], 22050, 512).is_empty());
    }

    #[test]
    fn test_burst_onset_at_rise() {
        let hop = 512;
        let samples = burst_signal(hop, 10, 10);
        let onsets = EnergyOnsetDetector::default().detect(&samples, 22050, hop);

        assert_eq!(onsets.len(), 1);
        let expected = 10.0 * hop as f64 / 22050.0;
        assert!((onsets[0] - expected).abs() < 1e-9);
    }

    #[test]
    fn test_strength_is_normalized() {
        let strength = EnergyOnsetDetector::onset_strength(&burst_signal(256, 4, 4), 256);
        assert_eq!(strength.len(), 8);
        assert!(strength.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(strength[4], 1.0);
    }

    #[test]
    fn test_empty_input() {
        assert!(EnergyOnsetDetector::onset_strength(&[], 512).is_empty());
        assert!(EnergyOnsetDetector::default().detect(&[], 22050, 512).is_empty());
    }
}
