// Playback loop
// One of these runs per play() on its own thread, advancing the session once per envelope frame

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::events::{EventSender, PlaybackEvent};
use super::session::{LoadedMedia, PlaybackSession, PlayerState};
use crate::audio::{AudioBackend, AudioSink};

pub(crate) struct RunContext {
    pub generation: u64,
    pub media: Arc<LoadedMedia>,
    pub start: f64,
    pub session: Arc<Mutex<PlaybackSession>>,
    pub events: EventSender,
    pub backend: Arc<dyn AudioBackend>,
    pub volume: f32,
    pub stall_timeout: Duration,
    pub cancel: Arc<AtomicBool>,
}

#[derive(Debug, PartialEq)]
enum RunOutcome {
    Completed,
    Cancelled,
    /// Session moved on to another run
    Superseded,
}

/// Signals the controller when the loop thread is done, however it exits
struct ExitSignal(mpsc::SyncSender<()>);

impl Drop for ExitSignal {
    fn drop(&mut self) {
        let _ = self.0.try_send(());
    }
}

pub(crate) fn run(ctx: RunContext, done: mpsc::SyncSender<()>) {
    let _exit = ExitSignal(done);
    let generation = ctx.generation;
    let session = ctx.session.clone();
    let events = ctx.events.clone();

    match catch_unwind(AssertUnwindSafe(|| run_loop(&ctx))) {
        Ok(outcome) => debug!("Playback run {} ended: {:?}", generation, outcome),
        Err(_) => {
            error!("Playback run {} failed", generation);
            let mut s = session.lock();
            if s.generation == generation && s.state == PlayerState::Playing {
                s.state = PlayerState::Stopped;
                drop(s);
                events.send(PlaybackEvent::Error("playback loop failed unexpectedly".to_string()));
                events.send(PlaybackEvent::StateChanged(PlayerState::Stopped));
            }
        }
    }
}

/// Wall-clock position source, anchored at a known track position
struct WallClock {
    anchor: Option<(Instant, f64)>,
}

impl WallClock {
    /// First call anchors at `from` and returns it unchanged
    fn position(&mut self, from: f64) -> f64 {
        match self.anchor {
            Some((at, base)) => base + at.elapsed().as_secs_f64(),
            None => {
                self.anchor = Some((Instant::now(), from));
                from
            }
        }
    }

    fn reanchor(&mut self, at: f64) {
        self.anchor = Some((Instant::now(), at));
    }
}

fn run_loop(ctx: &RunContext) -> RunOutcome {
    let clock = ctx.media.clock;
    let curve = ctx.media.curve.clone();
    let duration = clock.duration();
    let tick = Duration::from_secs_f64(clock.frame_duration().max(0.001));

    let mut sink: Option<Box<dyn AudioSink>> =
        match ctx.backend.open(ctx.media.track.clone(), ctx.start, ctx.volume) {
            Ok(sink) => Some(sink),
            Err(e) => {
                warn!("Continuing without audio: {}", e);
                ctx.events
                    .send_run(ctx.generation, PlaybackEvent::Degraded(e.to_string()));
                None
            }
        };

    let mut wall = WallClock { anchor: None };
    let mut last_position = ctx.start;
    let mut last_emitted: Option<f64> = None;
    let mut last_progress = Instant::now();

    loop {
        if ctx.cancel.load(Ordering::SeqCst) {
            return RunOutcome::Cancelled;
        }

        // Device position when there is one, wall clock otherwise
        let mut reported = None;
        if let Some(s) = sink.as_mut() {
            let fault = match s.pump() {
                Err(e) => Some(e.to_string()),
                Ok(()) => match s.position() {
                    None => Some("device stopped reporting a position".to_string()),
                    Some(p) if p > last_position => {
                        last_progress = Instant::now();
                        reported = Some(p);
                        None
                    }
                    Some(p) if last_progress.elapsed() > ctx.stall_timeout => Some(format!(
                        "device position stuck at {:.3}s for {:?}",
                        p, ctx.stall_timeout
                    )),
                    Some(p) => {
                        reported = Some(p);
                        None
                    }
                },
            };

            if let Some(reason) = fault {
                warn!("Audio output lost, switching to wall clock: {}", reason);
                sink = None;
                wall.reanchor(last_position);
                ctx.events
                    .send_run(ctx.generation, PlaybackEvent::Degraded(reason));
            }
        }

        let raw = reported.unwrap_or_else(|| wall.position(last_position));
        let position = clock.clamp_time(raw).max(last_position);
        last_position = position;

        // Device hasn't moved since the last update; updates must strictly advance
        if last_emitted.map_or(false, |e| position <= e) {
            thread::park_timeout(tick);
            continue;
        }

        let frame_index = clock.frame_index_for(position);
        let openness = curve.get(frame_index).unwrap_or(0.0);

        if !ctx
            .session
            .lock()
            .commit_tick(ctx.generation, position, frame_index)
        {
            return RunOutcome::Superseded;
        }

        ctx.events.send_run(
            ctx.generation,
            PlaybackEvent::Update {
                position,
                frame_index,
                openness,
            },
        );
        last_emitted = Some(position);

        if position >= duration {
            return finish(ctx);
        }

        // Stop requests unpark us early
        thread::park_timeout(tick);
    }
}

fn finish(ctx: &RunContext) -> RunOutcome {
    {
        let mut s = ctx.session.lock();
        if s.generation != ctx.generation || s.state != PlayerState::Playing {
            return RunOutcome::Superseded;
        }
        s.state = PlayerState::Completed;
        s.position = 0.0;
        s.frame_index = 0;
    }

    info!("Playback completed");
    ctx.events.send(PlaybackEvent::Completed);
    ctx.events
        .send(PlaybackEvent::StateChanged(PlayerState::Completed));
    RunOutcome::Completed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wall_clock_starts_at_anchor() {
        let mut wall = WallClock { anchor: None };
        let first = wall.position(1.5);
        assert_eq!(first, 1.5);

        thread::sleep(Duration::from_millis(5));
        assert!(wall.position(0.0) > 1.5);

        wall.reanchor(0.25);
        assert!(wall.position(9.0) < 0.5);
    }
}
