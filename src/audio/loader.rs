// Audio track loading
// Validates the file against the format allow-list, decodes it to mono and records the rate

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::decoder::AudioDecoder;
use super::resample::resample_mono;
use crate::error::{Error, Result};

/// Supported container formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Wav,
    Mp3,
    Ogg,
    Flac,
}

impl AudioFormat {
    /// Every accepted format, in allow-list order
    pub const ALL: [AudioFormat; 4] = [
        AudioFormat::Wav,
        AudioFormat::Mp3,
        AudioFormat::Ogg,
        AudioFormat::Flac,
    ];

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "wav" => Some(AudioFormat::Wav),
            "mp3" => Some(AudioFormat::Mp3),
            "ogg" => Some(AudioFormat::Ogg),
            "flac" => Some(AudioFormat::Flac),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Ogg => "ogg",
            AudioFormat::Flac => "flac",
        }
    }

    /// Whether the leading bytes of a file look like this format
    pub fn matches_magic(&self, header: &[u8]) -> bool {
        match self {
            AudioFormat::Wav => {
                header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"WAVE"
            }
            AudioFormat::Mp3 => {
                header.starts_with(b"ID3")
                    || (header.len() >= 2 && header[0] == 0xFF && header[1] & 0xE0 == 0xE0)
            }
            AudioFormat::Ogg => header.starts_with(b"OggS"),
            AudioFormat::Flac => header.starts_with(b"fLaC"),
        }
    }
}

/// Decoded audio: mono samples in [-1, 1] at `sample_rate`
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTrack {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioTrack {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Result<Self> {
        if sample_rate == 0 {
            return Err(Error::InvalidParameter("sample rate must be greater than zero".into()));
        }
        Ok(Self {
            samples,
            sample_rate,
        })
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Downsampled waveform for display, one mean value per bucket.
    /// Tracks shorter than `points` are returned as-is.
    pub fn overview(&self, points: usize) -> Vec<f32> {
        if points == 0 {
            return Vec::new();
        }
        if self.samples.len() <= points {
            return self.samples.clone();
        }

        // Trailing samples that don't fill a bucket are dropped
        let per_point = self.samples.len() / points;
        self.samples
            .chunks_exact(per_point)
            .take(points)
            .map(|chunk| chunk.iter().sum::<f32>() / per_point as f32)
            .collect()
    }
}

pub struct AudioTrackLoader {
    target_sample_rate: Option<u32>,
}

impl AudioTrackLoader {
    /// `target_sample_rate` of None keeps each file's native rate
    pub fn new(target_sample_rate: Option<u32>) -> Self {
        Self { target_sample_rate }
    }

    /// Check existence, extension and magic bytes without decoding
    pub fn validate(path: &Path) -> Result<AudioFormat> {
        if !path.exists() {
            return Err(Error::NotFound(path.to_path_buf()));
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| Error::UnsupportedFormat(format!("{:?} has no file extension", path)))?;

        let format = AudioFormat::from_extension(ext)
            .ok_or_else(|| Error::UnsupportedFormat(format!(".{} is not an accepted extension", ext)))?;

        let mut header = [0u8; 12];
        let mut file = File::open(path)?;
        let mut read = 0;
        // A short read just means a short file
        while read < header.len() {
            let n = file.read(&mut header[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }

        if !format.matches_magic(&header[..read]) {
            return Err(Error::UnsupportedFormat(format!(
                "{:?} does not look like a .{} file",
                path,
                format.extension()
            )));
        }

        Ok(format)
    }

    /// Validate and decode a file. Nothing is returned on failure.
    pub fn load(&self, path: &Path) -> Result<Arc<AudioTrack>> {
        let format = Self::validate(path)?;
        debug!("Decoding {:?} as {:?}", path, format);

        let mut decoder = AudioDecoder::open(path)?;
        let native_rate = decoder.sample_rate();
        let samples = decoder.decode_all()?;

        if samples.is_empty() && decoder.skipped_packets() > 0 {
            return Err(Error::Decode(format!(
                "No decodable audio in {:?} ({} packets rejected)",
                path,
                decoder.skipped_packets()
            )));
        }

        let (samples, sample_rate) = match self.target_sample_rate {
            Some(rate) if rate != native_rate => (resample_mono(&samples, native_rate, rate)?, rate),
            _ => (samples, native_rate),
        };

        let track = AudioTrack::new(samples, sample_rate)?;
        info!(
            "Loaded {:?}: {} samples at {} Hz ({:.3}s)",
            path,
            track.sample_count(),
            track.sample_rate(),
            track.duration()
        );
        Ok(Arc::new(track))
    }
}

impl Default for AudioTrackLoader {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_wav(path: &Path, sample_rate: u32, channels: u16, frames: &[Vec<i16>]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for frame in frames {
            for &s in frame {
                writer.write_sample(s).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let err = AudioTrackLoader::default()
            .load(Path::new("/definitely/not/here.wav"))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_extension_allow_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, b"RIFF\0\0\0\0WAVEfmt ").unwrap();
        assert!(matches!(
            AudioTrackLoader::validate(&path),
            Err(Error::UnsupportedFormat(_))
        ));

        let no_ext = dir.path().join("noext");
        fs::write(&no_ext, b"RIFF").unwrap();
        assert!(matches!(
            AudioTrackLoader::validate(&no_ext),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_magic_must_match_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.wav");
        fs::write(&path, b"OggS\0\0\0\0\0\0\0\0").unwrap();
        assert!(matches!(
            AudioTrackLoader::validate(&path),
            Err(Error::UnsupportedFormat(_))
        ));

        let ogg = dir.path().join("real.OGG");
        fs::write(&ogg, b"OggS\0\0\0\0\0\0\0\0").unwrap();
        assert_eq!(AudioTrackLoader::validate(&ogg).unwrap(), AudioFormat::Ogg);
    }

    #[test]
    fn test_mp3_magic_variants() {
        assert!(AudioFormat::Mp3.matches_magic(b"ID3\x04"));
        assert!(AudioFormat::Mp3.matches_magic(&[0xFF, 0xFB, 0x90]));
        assert!(!AudioFormat::Mp3.matches_magic(b"RIFF"));
    }

    #[test]
    fn test_corrupt_wav_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.wav");
        fs::write(&path, b"RIFF\x10\0\0\0WAVEjunkjunkjunk").unwrap();
        assert!(matches!(
            AudioTrackLoader::default().load(&path),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn test_stereo_is_downmixed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let frames: Vec<Vec<i16>> = (0..100).map(|_| vec![16384, 0]).collect();
        write_wav(&path, 8000, 2, &frames);

        let track = AudioTrackLoader::default().load(&path).unwrap();
        assert_eq!(track.sample_rate(), 8000);
        assert_eq!(track.sample_count(), 100);
        for &s in track.samples() {
            assert!((s - 0.25).abs() < 1e-3);
        }
    }

    #[test]
    fn test_target_rate_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        let frames: Vec<Vec<i16>> = (0..44100).map(|_| vec![0]).collect();
        write_wav(&path, 44100, 1, &frames);

        let track = AudioTrackLoader::new(Some(22050)).load(&path).unwrap();
        assert_eq!(track.sample_rate(), 22050);
        assert_eq!(track.sample_count(), 22050);
        assert!((track.duration() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_overview_buckets() {
        let track = AudioTrack::new(vec![1.0, 1.0, 0.0, 0.0, 0.5], 10).unwrap();
        assert_eq!(track.overview(2), vec![1.0, 0.0]);
        assert_eq!(track.overview(10).len(), 5);
        assert!(track.overview(0).is_empty());
    }
}
