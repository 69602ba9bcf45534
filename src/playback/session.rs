// Playback session state
// Everything here is read and written under the single session mutex

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::audio::AudioTrack;
use crate::lipsync::{EnvelopeCurve, PlaybackClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    /// No track loaded
    Idle,
    /// Track loaded, position retained, not advancing
    Stopped,
    /// The playback loop is advancing the position
    Playing,
    /// Curve exhausted; behaves like Stopped at position 0
    Completed,
}

/// A decoded track with its envelope. Immutable once built.
#[derive(Debug)]
pub struct LoadedMedia {
    pub track: Arc<AudioTrack>,
    pub curve: Arc<EnvelopeCurve>,
    pub clock: PlaybackClock,
    pub source: Option<PathBuf>,
}

impl LoadedMedia {
    pub fn new(track: Arc<AudioTrack>, curve: EnvelopeCurve, source: Option<PathBuf>) -> Self {
        let clock = PlaybackClock::for_curve(&curve, track.duration());
        Self {
            track,
            curve: Arc::new(curve),
            clock,
            source,
        }
    }

    pub fn duration(&self) -> f64 {
        self.clock.duration()
    }

    pub fn openness_at(&self, time: f64) -> f32 {
        self.clock.openness_at(&self.curve, time)
    }
}

#[derive(Debug)]
pub(crate) struct PlaybackSession {
    pub state: PlayerState,
    pub position: f64,
    pub frame_index: usize,
    /// Bumped whenever a playback run starts or ends; a loop only writes while its number is current
    pub generation: u64,
    pub media: Option<Arc<LoadedMedia>>,
}

impl PlaybackSession {
    pub fn new() -> Self {
        Self {
            state: PlayerState::Idle,
            position: 0.0,
            frame_index: 0,
            generation: 0,
            media: None,
        }
    }

    /// Clamp and store a position; returns the stored value
    pub fn set_position(&mut self, position: f64) -> f64 {
        match &self.media {
            Some(media) => {
                let clamped = media.clock.clamp_time(position);
                self.position = clamped;
                self.frame_index = media.clock.frame_index_for(clamped);
                clamped
            }
            None => {
                self.position = 0.0;
                self.frame_index = 0;
                0.0
            }
        }
    }

    /// Store a tick from the loop run `generation`. False means the run is stale.
    pub fn commit_tick(&mut self, generation: u64, position: f64, frame_index: usize) -> bool {
        if self.generation != generation || self.state != PlayerState::Playing {
            return false;
        }
        self.position = position;
        self.frame_index = frame_index;
        true
    }

    pub fn replace_media(&mut self, media: Option<Arc<LoadedMedia>>) {
        self.state = if media.is_some() {
            PlayerState::Stopped
        } else {
            PlayerState::Idle
        };
        self.media = media;
        self.generation += 1;
        self.position = 0.0;
        self.frame_index = 0;
    }
}
