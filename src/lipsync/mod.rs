// Lip sync analysis
// Envelope extraction, time/frame mapping and presenter-side lookups

pub mod clock;
pub mod envelope;
pub mod onset;
pub mod shape;
pub mod viseme;

pub use clock::PlaybackClock;
pub use envelope::{EnvelopeCurve, EnvelopeExtractor, EnvelopeParams};
pub use onset::{EnergyOnsetDetector, OnsetDetector};
pub use shape::{sprite_index, MouthShape};
pub use viseme::{PhonemeTiming, VisemeMap, VisemeTrack};
