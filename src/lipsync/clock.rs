// Playback clock
// Maps between track time in seconds and envelope frame indices

use super::envelope::EnvelopeCurve;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackClock {
    frame_duration: f64,
    frame_count: usize,
    duration: f64,
}

impl PlaybackClock {
    pub fn new(frame_duration: f64, frame_count: usize, duration: f64) -> Self {
        Self {
            frame_duration,
            frame_count,
            duration: duration.max(0.0),
        }
    }

    /// Clock for a curve covering `duration` seconds of audio
    pub fn for_curve(curve: &EnvelopeCurve, duration: f64) -> Self {
        Self::new(curve.frame_duration(), curve.len(), duration)
    }

    pub fn frame_duration(&self) -> f64 {
        self.frame_duration
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// `clamp(floor(time / frame_duration), 0, frame_count - 1)`; NaN maps to 0
    pub fn frame_index_for(&self, time: f64) -> usize {
        if self.frame_count == 0 || time.is_nan() || time <= 0.0 || self.frame_duration <= 0.0 {
            return 0;
        }
        let index = (time / self.frame_duration).floor();
        if index >= (self.frame_count - 1) as f64 {
            self.frame_count - 1
        } else {
            index as usize
        }
    }

    pub fn time_for(&self, frame_index: usize) -> f64 {
        frame_index as f64 * self.frame_duration
    }

    /// Clamp into `[0, duration]`; NaN goes to the start
    pub fn clamp_time(&self, time: f64) -> f64 {
        if time.is_nan() {
            return 0.0;
        }
        time.clamp(0.0, self.duration)
    }

    /// Openness at `time`, 0.0 for an empty curve
    pub fn openness_at(&self, curve: &EnvelopeCurve, time: f64) -> f32 {
        curve.get(self.frame_index_for(time)).unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> PlaybackClock {
        // 2.0s at 22050 Hz with hop 512
        PlaybackClock::new(512.0 / 22050.0, 87, 2.0)
    }

    #[test]
    fn test_frame_index_floor() {
        let c = clock();
        assert_eq!(c.frame_index_for(0.0), 0);
        assert_eq!(c.frame_index_for(c.frame_duration() * 0.99), 0);
        assert_eq!(c.frame_index_for(c.frame_duration() * 1.5), 1);
        assert_eq!(c.frame_index_for(1.0), 43);
    }

    #[test]
    fn test_frame_index_clamps() {
        let c = clock();
        assert_eq!(c.frame_index_for(-3.0), 0);
        assert_eq!(c.frame_index_for(2.0), 86);
        assert_eq!(c.frame_index_for(1e9), 86);
        assert_eq!(c.frame_index_for(f64::NAN), 0);
        assert_eq!(c.frame_index_for(f64::NEG_INFINITY), 0);
    }

    #[test]
    fn test_infinite_time_matches_clamp_time() {
        let c = clock();
        assert_eq!(c.frame_index_for(f64::INFINITY), 86);
        assert_eq!(c.clamp_time(f64::INFINITY), 2.0);
        assert_eq!(c.frame_index_for(c.clamp_time(f64::INFINITY)), 86);
    }

    #[test]
    fn test_time_for_inverts_on_boundaries() {
        let c = clock();
        for i in [0usize, 1, 42, 86] {
            assert_eq!(c.frame_index_for(c.time_for(i) + 1e-9), i);
        }
    }

    #[test]
    fn test_clamp_time() {
        let c = clock();
        assert_eq!(c.clamp_time(-1.0), 0.0);
        assert_eq!(c.clamp_time(0.75), 0.75);
        assert_eq!(c.clamp_time(5.0), 2.0);
        assert_eq!(c.clamp_time(f64::NAN), 0.0);
    }

    #[test]
    fn test_empty_clock() {
        let c = PlaybackClock::new(0.01, 0, 0.0);
        assert_eq!(c.frame_index_for(1.0), 0);
        assert_eq!(c.clamp_time(1.0), 0.0);
    }
}
