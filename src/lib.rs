// Lip sync engine
// Converts an audio recording into a mouth openness curve and plays it back in step with the audio device

pub mod audio;
pub mod error;
pub mod lipsync;
pub mod playback;
pub mod settings;

pub use audio::{AudioBackend, AudioSink, AudioTrack, AudioTrackLoader};
pub use error::{Error, Result};
pub use lipsync::{EnvelopeCurve, EnvelopeExtractor, EnvelopeParams, MouthShape, PlaybackClock, VisemeMap};
pub use playback::{PlaybackController, PlaybackEvent, PlayerState};
pub use settings::EngineSettings;
