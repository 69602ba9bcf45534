// Audio module
// Uses Symphonia for decoding, rubato for rate conversion and cpal for output

pub mod decoder;
pub mod loader;
pub mod output;
pub mod resample;

pub use loader::{AudioFormat, AudioTrack, AudioTrackLoader};
pub use output::{AudioBackend, AudioSink, CpalBackend, NullBackend};
