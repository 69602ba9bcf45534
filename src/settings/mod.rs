// Engine configuration
pub mod settings;

pub use settings::{DecodeSettings, EngineSettings, EnvelopeSettings, PlaybackSettings};
