// Playback event dispatch
// Events are queued by the controller and the loop, then delivered on a dedicated thread
// so presenter callbacks never run inside the session lock or on the playback loop.
// Loop ticks are coalesced: a slow presenter sees the newest position, not a backlog.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc as async_mpsc};
use tracing::{debug, error, warn};

use super::session::PlayerState;

const BROADCAST_CAPACITY: usize = 256;

/// No playback run is live
const NO_RUN: u64 = 0;

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// One loop tick
    Update {
        position: f64,
        frame_index: usize,
        openness: f32,
    },
    /// Position changed by an explicit seek
    Seeked {
        position: f64,
        frame_index: usize,
        openness: f32,
    },
    StateChanged(PlayerState),
    /// The curve was played to the end
    Completed,
    /// Audio output was lost; animation continues on the wall clock
    Degraded(String),
    /// The playback loop failed and stopped
    Error(String),
}

type UpdateFn = Arc<dyn Fn(f64, f32) + Send + Sync>;
type CompleteFn = Arc<dyn Fn() + Send + Sync>;
type MessageFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Newest undelivered loop tick and the run that produced it
type PendingUpdate = Arc<Mutex<Option<(u64, PlaybackEvent)>>>;

#[derive(Default)]
struct Callbacks {
    on_update: Option<UpdateFn>,
    on_complete: Option<CompleteFn>,
    on_error: Option<MessageFn>,
    on_degraded: Option<MessageFn>,
}

enum Command {
    Event {
        /// Run that produced the event; None for events that are never stale
        generation: Option<u64>,
        event: PlaybackEvent,
    },
    /// The pending update slot was filled
    UpdateReady,
    Flush(mpsc::SyncSender<()>),
    Shutdown,
}

/// Cloneable handle used to queue events
#[derive(Clone)]
pub(crate) struct EventSender {
    tx: async_mpsc::UnboundedSender<Command>,
    pending: PendingUpdate,
}

impl EventSender {
    /// Event tied to playback run `generation`; dropped if that run is no longer live.
    /// An `Update` replaces any update still waiting for delivery.
    pub fn send_run(&self, generation: u64, event: PlaybackEvent) {
        if let PlaybackEvent::Update { .. } = event {
            self.replace_pending(generation, event);
            return;
        }
        let _ = self.tx.send(Command::Event {
            generation: Some(generation),
            event,
        });
    }

    fn replace_pending(&self, generation: u64, event: PlaybackEvent) {
        let was_empty = {
            let mut slot = self.pending.lock();
            // Never let an older run overwrite a newer one's tick
            if let Some((queued, _)) = slot.as_ref() {
                if *queued > generation {
                    return;
                }
            }
            slot.replace((generation, event)).is_none()
        };
        if was_empty {
            let _ = self.tx.send(Command::UpdateReady);
        }
    }

    /// Event that is never stale; always queued in order
    pub fn send(&self, event: PlaybackEvent) {
        let _ = self.tx.send(Command::Event {
            generation: None,
            event,
        });
    }
}

pub(crate) struct EventDispatcher {
    sender: EventSender,
    callbacks: Arc<Mutex<Callbacks>>,
    broadcast: broadcast::Sender<PlaybackEvent>,
    live_generation: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl EventDispatcher {
    pub fn new() -> std::io::Result<Self> {
        let (tx, rx) = async_mpsc::unbounded_channel();
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        let callbacks = Arc::new(Mutex::new(Callbacks::default()));
        let live_generation = Arc::new(AtomicU64::new(NO_RUN));
        let pending: PendingUpdate = Arc::new(Mutex::new(None));

        let worker = DispatchWorker {
            rx,
            pending: pending.clone(),
            callbacks: callbacks.clone(),
            broadcast: broadcast.clone(),
            live_generation: live_generation.clone(),
        };
        let thread = thread::Builder::new()
            .name("lipsync-events".to_string())
            .spawn(move || worker.run())?;
        let thread_id = thread.thread().id();

        Ok(Self {
            sender: EventSender { tx, pending },
            callbacks,
            broadcast,
            live_generation,
            thread: Some(thread),
            thread_id,
        })
    }

    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    /// Mark which playback run may still deliver updates
    pub fn set_live(&self, generation: Option<u64>) {
        self.live_generation
            .store(generation.unwrap_or(NO_RUN), Ordering::SeqCst);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.broadcast.subscribe()
    }

    pub fn set_on_update(&self, f: UpdateFn) {
        self.callbacks.lock().on_update = Some(f);
    }

    pub fn set_on_complete(&self, f: CompleteFn) {
        self.callbacks.lock().on_complete = Some(f);
    }

    pub fn set_on_error(&self, f: MessageFn) {
        self.callbacks.lock().on_error = Some(f);
    }

    pub fn set_on_degraded(&self, f: MessageFn) {
        self.callbacks.lock().on_degraded = Some(f);
    }

    fn on_dispatch_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Wait until everything queued so far has been delivered.
    /// Returns immediately when called from inside a callback.
    pub fn flush(&self, timeout: Duration) -> bool {
        if self.on_dispatch_thread() {
            return true;
        }
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        if self.sender.tx.send(Command::Flush(ack_tx)).is_err() {
            return false;
        }
        match ack_rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(_) => {
                warn!("Event queue did not drain within {:?}", timeout);
                false
            }
        }
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        let _ = self.sender.tx.send(Command::Shutdown);
        if let Some(handle) = self.thread.take() {
            if !self.on_dispatch_thread() {
                let _ = handle.join();
            }
        }
    }
}

struct DispatchWorker {
    rx: async_mpsc::UnboundedReceiver<Command>,
    pending: PendingUpdate,
    callbacks: Arc<Mutex<Callbacks>>,
    broadcast: broadcast::Sender<PlaybackEvent>,
    live_generation: Arc<AtomicU64>,
}

impl DispatchWorker {
    fn run(mut self) {
        while let Some(command) = self.rx.blocking_recv() {
            match command {
                Command::Event { generation, event } => {
                    if let Some(g) = generation {
                        if g != self.live_generation.load(Ordering::SeqCst) {
                            continue;
                        }
                    }
                    self.deliver(event);
                }
                Command::UpdateReady => {
                    let taken = self.pending.lock().take();
                    if let Some((generation, event)) = taken {
                        if generation == self.live_generation.load(Ordering::SeqCst) {
                            self.deliver(event);
                        }
                    }
                }
                Command::Flush(ack) => {
                    let _ = ack.try_send(());
                }
                Command::Shutdown => break,
            }
        }
        debug!("Event dispatcher exiting");
    }

    fn deliver(&self, event: PlaybackEvent) {
        // Clone out so callbacks run without holding the registry lock
        let (on_update, on_complete, on_error, on_degraded) = {
            let cb = self.callbacks.lock();
            (
                cb.on_update.clone(),
                cb.on_complete.clone(),
                cb.on_error.clone(),
                cb.on_degraded.clone(),
            )
        };

        let result = catch_unwind(AssertUnwindSafe(|| match &event {
            PlaybackEvent::Update {
                position, openness, ..
            } => {
                if let Some(f) = &on_update {
                    f(*position, *openness);
                }
            }
            PlaybackEvent::Completed => {
                if let Some(f) = &on_complete {
                    f();
                }
            }
            PlaybackEvent::Error(message) => {
                if let Some(f) = &on_error {
                    f(message);
                }
            }
            PlaybackEvent::Degraded(message) => {
                if let Some(f) = &on_degraded {
                    f(message);
                }
            }
            PlaybackEvent::Seeked { .. } | PlaybackEvent::StateChanged(_) => {}
        }));
        if result.is_err() {
            error!("Playback callback panicked while handling {:?}", event);
        }

        // No subscribers is fine
        let _ = self.broadcast.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn update(position: f64) -> PlaybackEvent {
        PlaybackEvent::Update {
            position,
            frame_index: 0,
            openness: 0.5,
        }
    }

    #[test]
    fn test_stale_run_events_dropped() {
        let dispatcher = EventDispatcher::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher.set_on_update(Arc::new(move |t: f64, _: f32| sink.lock().push(t)));

        let degraded = Arc::new(AtomicUsize::new(0));
        let d = degraded.clone();
        dispatcher.set_on_degraded(Arc::new(move |_: &str| {
            d.fetch_add(1, Ordering::SeqCst);
        }));

        dispatcher.set_live(Some(1));
        let sender = dispatcher.sender();
        sender.send_run(1, update(0.1));
        assert!(dispatcher.flush(Duration::from_secs(1)));
        sender.send_run(2, update(0.2));
        sender.send_run(2, PlaybackEvent::Degraded("stale".into()));
        assert!(dispatcher.flush(Duration::from_secs(1)));

        dispatcher.set_live(Some(2));
        sender.send_run(1, update(0.3));
        sender.send_run(1, PlaybackEvent::Degraded("stale".into()));
        assert!(dispatcher.flush(Duration::from_secs(1)));
        sender.send_run(2, update(0.4));
        assert!(dispatcher.flush(Duration::from_secs(1)));

        assert_eq!(*seen.lock(), vec![0.1, 0.4]);
        assert_eq!(degraded.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_slow_presenter_gets_latest_update() {
        let dispatcher = EventDispatcher::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher.set_on_update(Arc::new(move |t: f64, _: f32| {
            sink.lock().push(t);
            thread::sleep(Duration::from_millis(50));
        }));

        dispatcher.set_live(Some(1));
        let sender = dispatcher.sender();
        for i in 1..=20 {
            sender.send_run(1, update(i as f64 * 0.01));
            thread::sleep(Duration::from_millis(5));
        }
        assert!(dispatcher.flush(Duration::from_secs(2)));

        let seen = seen.lock();
        assert!(seen.len() < 10, "{} updates delivered", seen.len());
        assert_eq!(*seen.last().unwrap(), 20.0 * 0.01);
        for pair in seen.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn test_older_run_cannot_overwrite_pending_update() {
        let dispatcher = EventDispatcher::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher.set_on_update(Arc::new(move |t: f64, _: f32| sink.lock().push(t)));

        // Dispatcher is blocked until the gate opens, so both land in the slot
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();
        let g = gate.clone();
        dispatcher.set_on_complete(Arc::new(move || {
            let _wait = g.lock();
        }));
        let sender = dispatcher.sender();
        sender.send(PlaybackEvent::Completed);

        dispatcher.set_live(Some(5));
        sender.send_run(5, update(0.5));
        sender.send_run(4, update(0.4));
        drop(held);

        assert!(dispatcher.flush(Duration::from_secs(1)));
        assert_eq!(*seen.lock(), vec![0.5]);
    }

    #[test]
    fn test_last_registration_wins() {
        let dispatcher = EventDispatcher::new().unwrap();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = first.clone();
        dispatcher.set_on_complete(Arc::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        let s = second.clone();
        dispatcher.set_on_complete(Arc::new(move || {
            s.fetch_add(1, Ordering::SeqCst);
        }));

        dispatcher.sender().send(PlaybackEvent::Completed);
        assert!(dispatcher.flush(Duration::from_secs(1)));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_callback_keeps_dispatcher_alive() {
        let dispatcher = EventDispatcher::new().unwrap();
        let errors = Arc::new(AtomicUsize::new(0));
        dispatcher.set_on_complete(Arc::new(|| panic!("presenter bug")));
        let e = errors.clone();
        dispatcher.set_on_error(Arc::new(move |_: &str| {
            e.fetch_add(1, Ordering::SeqCst);
        }));

        let sender = dispatcher.sender();
        sender.send(PlaybackEvent::Completed);
        sender.send(PlaybackEvent::Error("boom".into()));
        assert!(dispatcher.flush(Duration::from_secs(1)));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribers_receive_events() {
        let dispatcher = EventDispatcher::new().unwrap();
        let mut rx = dispatcher.subscribe();
        dispatcher.sender().send(PlaybackEvent::StateChanged(PlayerState::Playing));
        assert!(dispatcher.flush(Duration::from_secs(1)));
        assert_eq!(
            rx.try_recv().unwrap(),
            PlaybackEvent::StateChanged(PlayerState::Playing)
        );
    }
}
