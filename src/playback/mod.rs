// Playback module
// State machine and concurrency core: one loop thread per play, one dispatcher thread for callbacks

pub mod controller;
pub mod events;
pub mod session;
mod worker;

pub use controller::PlaybackController;
pub use events::PlaybackEvent;
pub use session::{LoadedMedia, PlayerState};
