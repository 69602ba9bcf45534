// Playback controller
// Owns the session, the single playback loop and the event dispatcher

use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::events::{EventDispatcher, PlaybackEvent};
use super::session::{LoadedMedia, PlaybackSession, PlayerState};
use super::worker::{self, RunContext};
use crate::audio::{AudioBackend, AudioTrack, AudioTrackLoader, CpalBackend, NullBackend};
use crate::error::{Error, Result};
use crate::lipsync::{EnvelopeCurve, EnvelopeExtractor, EnvelopeParams};
use crate::settings::EngineSettings;

/// Handle on the running playback loop
struct Worker {
    handle: JoinHandle<()>,
    cancel: Arc<AtomicBool>,
    done: mpsc::Receiver<()>,
    generation: u64,
}

/// Drives a presenter from an audio track's envelope, in step with audio output.
///
/// All methods take `&self`; share it behind an `Arc` to control playback
/// from several threads. Control calls are serialized internally, and at
/// most one playback loop exists at any time.
pub struct PlaybackController {
    session: Arc<Mutex<PlaybackSession>>,
    /// Held for the whole of every control operation
    worker: Mutex<Option<Worker>>,
    dispatcher: EventDispatcher,
    backend: Arc<dyn AudioBackend>,
    loader: AudioTrackLoader,
    extractor: EnvelopeExtractor,
    settings: EngineSettings,
}

impl PlaybackController {
    /// Controller using the default output device, or silent mode when audio is disabled
    pub fn new(settings: EngineSettings) -> Result<Self> {
        let backend: Arc<dyn AudioBackend> = if settings.playback.audio_enabled {
            Arc::new(CpalBackend::new(settings.playback.device_open_timeout()))
        } else {
            Arc::new(NullBackend)
        };
        Self::with_backend(settings, backend)
    }

    pub fn with_backend(settings: EngineSettings, backend: Arc<dyn AudioBackend>) -> Result<Self> {
        settings.validate()?;
        let extractor = EnvelopeExtractor::new(EnvelopeParams::from(&settings.envelope));
        Ok(Self {
            session: Arc::new(Mutex::new(PlaybackSession::new())),
            worker: Mutex::new(None),
            dispatcher: EventDispatcher::new()?,
            backend,
            loader: AudioTrackLoader::new(settings.decode.target_sample_rate),
            extractor,
            settings,
        })
    }

    /// Swap in a different envelope extractor (e.g. with a custom onset detector)
    pub fn with_extractor(mut self, extractor: EnvelopeExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    // ===== Callbacks =====

    /// Called with `(position_seconds, openness)` on every loop tick
    pub fn on_update<F>(&self, f: F)
    where
        F: Fn(f64, f32) + Send + Sync + 'static,
    {
        self.dispatcher.set_on_update(Arc::new(f));
    }

    /// Called once when playback reaches the end of the track
    pub fn on_complete<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.dispatcher.set_on_complete(Arc::new(f));
    }

    /// Called once if the playback loop fails
    pub fn on_error<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.dispatcher.set_on_error(Arc::new(f));
    }

    /// Called when audio output is unavailable and animation continues silently
    pub fn on_degraded<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.dispatcher.set_on_degraded(Arc::new(f));
    }

    /// Every event, for presenters living on an async runtime
    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.dispatcher.subscribe()
    }

    // ===== Control surface =====

    /// Decode a file and build its envelope, replacing any loaded track.
    ///
    /// On failure the previous track (if any) stays loaded and untouched.
    pub fn load(&self, path: &Path) -> Result<()> {
        let track = self.loader.load(path)?;
        let curve = self.extractor.build(&track)?;
        self.install(LoadedMedia::new(track, curve, Some(path.to_path_buf())));
        Ok(())
    }

    /// Load already-decoded audio, e.g. from a TTS collaborator
    pub fn load_track(&self, track: Arc<AudioTrack>) -> Result<()> {
        let curve = self.extractor.build(&track)?;
        self.install(LoadedMedia::new(track, curve, None));
        Ok(())
    }

    fn install(&self, media: LoadedMedia) {
        let mut worker = self.worker.lock();
        self.stop_worker(&mut worker);

        info!(
            "Track ready: {:.3}s, {} envelope frames",
            media.duration(),
            media.curve.len()
        );
        self.session.lock().replace_media(Some(Arc::new(media)));
        self.dispatcher
            .sender()
            .send(PlaybackEvent::StateChanged(PlayerState::Stopped));
    }

    /// Stop playback and release the track
    pub fn unload(&self) {
        let mut worker = self.worker.lock();
        self.stop_worker(&mut worker);

        let mut session = self.session.lock();
        if session.media.is_some() {
            session.replace_media(None);
            drop(session);
            debug!("Track unloaded");
            self.dispatcher
                .sender()
                .send(PlaybackEvent::StateChanged(PlayerState::Idle));
        }
    }

    /// Start playing from `from` (clamped), or from the current position.
    ///
    /// Calling this while already playing does nothing. Audio device
    /// problems don't fail the call: playback continues on the wall clock
    /// and `on_degraded` fires.
    pub fn play(&self, from: Option<f64>) -> Result<()> {
        let mut worker = self.worker.lock();

        if self.session.lock().state == PlayerState::Playing {
            if worker.as_ref().map_or(false, |w| !w.handle.is_finished()) {
                debug!("play() while already playing, ignoring");
                return Ok(());
            }
        }
        // Reap a loop that finished on its own
        self.stop_worker(&mut worker);

        {
            let mut session = self.session.lock();
            let media = session
                .media
                .clone()
                .ok_or_else(|| Error::InvalidState("no track loaded".to_string()))?;
            if media.curve.is_empty() {
                return Err(Error::EmptyEnvelope);
            }
            if let Some(position) = from {
                session.set_position(position);
            }
        }

        *worker = Some(self.spawn_worker()?);
        Ok(())
    }

    /// Stop advancing, keeping the position
    pub fn pause(&self) {
        let mut worker = self.worker.lock();
        self.stop_worker(&mut worker);
    }

    /// Stop advancing and rewind to the start
    pub fn stop(&self) {
        let mut worker = self.worker.lock();
        self.stop_worker(&mut worker);

        let mut session = self.session.lock();
        if session.media.is_some() {
            let was_completed = session.state == PlayerState::Completed;
            session.state = PlayerState::Stopped;
            session.set_position(0.0);
            drop(session);
            if was_completed {
                self.dispatcher
                    .sender()
                    .send(PlaybackEvent::StateChanged(PlayerState::Stopped));
            }
        }
    }

    /// Move to `position` seconds (clamped to the track).
    ///
    /// The new position is visible immediately. If playing, the loop is
    /// restarted from there and no update from the old loop follows.
    /// Otherwise `on_update` is called once with the new position so a
    /// paused presenter can redraw.
    pub fn seek(&self, position: f64) -> Result<()> {
        let mut worker = self.worker.lock();

        let was_playing = {
            let session = self.session.lock();
            if session.media.is_none() {
                return Err(Error::InvalidState("seek before any track was loaded".to_string()));
            }
            session.state == PlayerState::Playing
        };

        if was_playing {
            self.stop_worker(&mut worker);
        }

        let (position, frame_index, openness) = {
            let mut session = self.session.lock();
            let position = session.set_position(position);
            if session.state == PlayerState::Completed {
                session.state = PlayerState::Stopped;
            }
            let openness = session
                .media
                .as_ref()
                .map_or(0.0, |m| m.openness_at(position));
            (position, session.frame_index, openness)
        };
        debug!("Seek to {:.3}s (frame {})", position, frame_index);

        let events = self.dispatcher.sender();
        events.send(PlaybackEvent::Seeked {
            position,
            frame_index,
            openness,
        });
        if !was_playing {
            // No run is live, so this can't interleave with loop ticks
            events.send(PlaybackEvent::Update {
                position,
                frame_index,
                openness,
            });
        }

        if was_playing {
            *worker = Some(self.spawn_worker()?);
        }
        Ok(())
    }

    /// Track length in seconds; 0 when nothing is loaded
    pub fn get_duration(&self) -> f64 {
        self.session
            .lock()
            .media
            .as_ref()
            .map_or(0.0, |m| m.duration())
    }

    pub fn get_position(&self) -> f64 {
        self.session.lock().position
    }

    pub fn is_playing(&self) -> bool {
        self.session.lock().state == PlayerState::Playing
    }

    pub fn state(&self) -> PlayerState {
        self.session.lock().state
    }

    pub fn current_frame_index(&self) -> usize {
        self.session.lock().frame_index
    }

    /// Openness of the loaded curve at `time`
    pub fn openness_at(&self, time: f64) -> Option<f32> {
        self.session
            .lock()
            .media
            .as_ref()
            .map(|m| m.openness_at(time))
    }

    pub fn curve(&self) -> Option<Arc<EnvelopeCurve>> {
        self.session.lock().media.as_ref().map(|m| m.curve.clone())
    }

    pub fn track(&self) -> Option<Arc<AudioTrack>> {
        self.session.lock().media.as_ref().map(|m| m.track.clone())
    }

    // ===== Loop management =====

    /// Start a loop from the session's current position. Caller holds the worker lock.
    fn spawn_worker(&self) -> Result<Worker> {
        let (generation, media, start) = {
            let mut session = self.session.lock();
            let media = session
                .media
                .clone()
                .ok_or_else(|| Error::InvalidState("no track loaded".to_string()))?;
            session.generation += 1;
            session.state = PlayerState::Playing;
            (session.generation, media, session.position)
        };
        self.dispatcher.set_live(Some(generation));

        let cancel = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        let ctx = RunContext {
            generation,
            media,
            start,
            session: self.session.clone(),
            events: self.dispatcher.sender(),
            backend: self.backend.clone(),
            volume: self.settings.playback.volume.clamp(0.0, 1.0),
            stall_timeout: self.settings.playback.device_stall_timeout(),
            cancel: cancel.clone(),
        };

        let spawned = thread::Builder::new()
            .name("lipsync-playback".to_string())
            .spawn(move || worker::run(ctx, done_tx));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                // Never leave Playing without a loop behind it
                let mut session = self.session.lock();
                if session.generation == generation {
                    session.state = PlayerState::Stopped;
                }
                self.dispatcher.set_live(None);
                return Err(Error::Io(e));
            }
        };

        info!("Playback started at {:.3}s (run {})", start, generation);
        self.dispatcher
            .sender()
            .send(PlaybackEvent::StateChanged(PlayerState::Playing));

        Ok(Worker {
            handle,
            cancel,
            done: done_rx,
            generation,
        })
    }

    /// Signal the loop, wait (bounded) for it to exit and drain queued events.
    /// Caller holds the worker lock.
    fn stop_worker(&self, slot: &mut Option<Worker>) {
        let was_playing = {
            let mut session = self.session.lock();
            let playing = session.state == PlayerState::Playing;
            if playing {
                session.state = PlayerState::Stopped;
            }
            session.generation += 1;
            playing
        };
        self.dispatcher.set_live(None);

        if let Some(worker) = slot.take() {
            worker.cancel.store(true, Ordering::SeqCst);
            worker.handle.thread().unpark();

            match worker.done.recv_timeout(self.settings.playback.stop_timeout()) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    let _ = worker.handle.join();
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    // It can no longer write to the session or deliver updates
                    warn!(
                        "Playback run {} did not stop within {:?}, abandoning it",
                        worker.generation,
                        self.settings.playback.stop_timeout()
                    );
                }
            }
        }

        self.dispatcher
            .flush(self.settings.playback.dispatch_flush_timeout());

        if was_playing {
            info!("Playback stopped");
            self.dispatcher
                .sender()
                .send(PlaybackEvent::StateChanged(PlayerState::Stopped));
        }
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            self.stop_worker(&mut worker);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn silent_settings() -> EngineSettings {
        let mut settings = EngineSettings::default();
        settings.playback.audio_enabled = false;
        settings.envelope.onset_boost = None;
        settings
    }

    fn controller() -> PlaybackController {
        PlaybackController::new(silent_settings()).unwrap()
    }

    fn tone(seconds: f64, sample_rate: u32) -> Arc<AudioTrack> {
        let n = (seconds * sample_rate as f64) as usize;
        let samples = (0..n).map(|i| ((i as f32) * 0.05).sin() * 0.5).collect();
        Arc::new(AudioTrack::new(samples, sample_rate).unwrap())
    }

    #[test]
    fn test_idle_controller() {
        let c = controller();
        assert_eq!(c.state(), PlayerState::Idle);
        assert_eq!(c.get_duration(), 0.0);
        assert!(matches!(c.seek(1.0), Err(Error::InvalidState(_))));
        assert!(matches!(c.play(None), Err(Error::InvalidState(_))));
        c.pause();
        c.stop();
        assert_eq!(c.state(), PlayerState::Idle);
    }

    #[test]
    fn test_empty_track_cannot_play() {
        let c = controller();
        c.load_track(Arc::new(AudioTrack::new(Vec::new(), 22050).unwrap()))
            .unwrap();
        assert_eq!(c.state(), PlayerState::Stopped);
        assert_eq!(c.get_duration(), 0.0);
        assert!(matches!(c.play(None), Err(Error::EmptyEnvelope)));
        assert!(!c.is_playing());
    }

    #[test]
    fn test_seek_clamps_when_stopped() {
        let c = controller();
        c.load_track(tone(2.0, 22050)).unwrap();

        c.seek(1.25).unwrap();
        assert_eq!(c.get_position(), 1.25);
        assert_eq!(c.current_frame_index(), 53);

        c.seek(10.0).unwrap();
        assert_eq!(c.get_position(), 2.0);
        c.seek(-4.0).unwrap();
        assert_eq!(c.get_position(), 0.0);
        assert_eq!(c.state(), PlayerState::Stopped);
    }

    #[test]
    fn test_seek_while_paused_reaches_update_callback() {
        let c = controller();
        let track = tone(2.0, 22050);
        c.load_track(track).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        c.on_update(move |t, openness| sink.lock().push((t, openness)));

        c.seek(1.0).unwrap();
        assert!(c.dispatcher.flush(Duration::from_secs(1)));

        let expected = c.openness_at(1.0).unwrap();
        assert_eq!(*seen.lock(), vec![(1.0, expected)]);
        assert_eq!(c.current_frame_index(), 43);
        assert!(!c.is_playing());
    }

    #[test]
    fn test_pause_keeps_position_stop_rewinds() {
        let c = controller();
        c.load_track(tone(2.0, 22050)).unwrap();

        c.play(Some(0.5)).unwrap();
        assert!(c.is_playing());
        thread::sleep(Duration::from_millis(60));
        c.pause();
        assert!(!c.is_playing());
        let paused_at = c.get_position();
        assert!(paused_at >= 0.5 && paused_at < 1.0, "paused at {}", paused_at);

        thread::sleep(Duration::from_millis(60));
        assert_eq!(c.get_position(), paused_at);

        c.stop();
        assert_eq!(c.get_position(), 0.0);
        assert_eq!(c.state(), PlayerState::Stopped);
    }

    #[test]
    fn test_unload_returns_to_idle() {
        let c = controller();
        c.load_track(tone(1.0, 8000)).unwrap();
        c.play(None).unwrap();
        c.unload();
        assert_eq!(c.state(), PlayerState::Idle);
        assert!(c.curve().is_none());
        assert!(!c.is_playing());
    }
}
