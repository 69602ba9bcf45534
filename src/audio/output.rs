// Audio output using cpal
// The device callback counts consumed frames; that count is the playback position the listener hears

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapRb,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::loader::AudioTrack;
use super::resample::resample_mono;
use crate::error::{Error, Result};

const RING_BUFFER_SECONDS: f64 = 0.25;

type RingProducer = ringbuf::HeapProd<f32>;
type RingConsumer = ringbuf::HeapCons<f32>;

/// Something that can open an output sink for a track
pub trait AudioBackend: Send + Sync {
    /// Start playing `track` from `start` seconds.
    ///
    /// Must return within a bounded time; `DeviceUnavailable` sends the
    /// controller into wall-clock (silent) mode.
    fn open(&self, track: Arc<AudioTrack>, start: f64, volume: f32) -> Result<Box<dyn AudioSink>>;
}

/// A running output stream
pub trait AudioSink: Send {
    /// Top up the device buffer. Must not block.
    fn pump(&mut self) -> Result<()>;

    /// Playback position in track seconds as reported by the device,
    /// or None when the device can no longer report one
    fn position(&self) -> Option<f64>;
}

/// Backend for running without audio hardware
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

impl AudioBackend for NullBackend {
    fn open(&self, _track: Arc<AudioTrack>, _start: f64, _volume: f32) -> Result<Box<dyn AudioSink>> {
        Err(Error::DeviceUnavailable("audio output disabled".to_string()))
    }
}

/// Default output device through cpal
pub struct CpalBackend {
    open_timeout: Duration,
}

impl CpalBackend {
    pub fn new(open_timeout: Duration) -> Self {
        Self { open_timeout }
    }
}

struct DeviceReady {
    producer: RingProducer,
    sample_rate: u32,
    channels: u16,
}

struct DeviceShared {
    consumed: AtomicU64,
    error: AtomicBool,
    shutdown: AtomicBool,
}

impl AudioBackend for CpalBackend {
    fn open(&self, track: Arc<AudioTrack>, start: f64, volume: f32) -> Result<Box<dyn AudioSink>> {
        let shared = Arc::new(DeviceShared {
            consumed: AtomicU64::new(0),
            error: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });
        let volume = volume.clamp(0.0, 1.0);

        // cpal streams can't move between threads, so one thread owns it for its whole life
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<DeviceReady>>(1);
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("lipsync-audio-device".to_string())
            .spawn(move || device_thread(thread_shared, volume, ready_tx))
            .map_err(|e| Error::DeviceUnavailable(format!("Failed to spawn device thread: {}", e)))?;

        let ready = match await_ready(&ready_rx, self.open_timeout) {
            Ok(ready) => ready,
            Err(e) => {
                // A thread stuck in the driver exits on its own once the call returns
                shared.shutdown.store(true, Ordering::SeqCst);
                handle.thread().unpark();
                warn!("Audio output not available: {}", e);
                return Err(e);
            }
        };

        let start = start.clamp(0.0, track.duration());
        let start_sample = ((start * track.sample_rate() as f64) as usize).min(track.sample_count());
        let pending = match resample_mono(
            &track.samples()[start_sample..],
            track.sample_rate(),
            ready.sample_rate,
        ) {
            Ok(p) => p,
            Err(e) => {
                shared.shutdown.store(true, Ordering::SeqCst);
                handle.thread().unpark();
                return Err(Error::DeviceUnavailable(format!("Cannot convert to device rate: {}", e)));
            }
        };

        info!(
            "Audio output open: {} Hz, {} channel(s), starting at {:.3}s",
            ready.sample_rate, ready.channels, start
        );

        Ok(Box::new(CpalSink {
            producer: ready.producer,
            pending,
            cursor: 0,
            device_rate: ready.sample_rate,
            channels: ready.channels.max(1) as usize,
            start,
            end: track.duration(),
            shared,
            thread: Some(handle),
        }))
    }
}

/// Wait for the device thread's answer, giving up after `timeout`
fn await_ready<T>(ready_rx: &mpsc::Receiver<Result<T>>, timeout: Duration) -> Result<T> {
    match ready_rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(Error::DeviceUnavailable(format!(
            "device open timed out after {:?}",
            timeout
        ))),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(Error::DeviceUnavailable(
            "device thread exited before opening".to_string(),
        )),
    }
}

fn device_thread(
    shared: Arc<DeviceShared>,
    volume: f32,
    ready_tx: mpsc::SyncSender<Result<DeviceReady>>,
) {
    let stream = match build_output(&shared, volume) {
        Ok((stream, ready)) => {
            if ready_tx.send(Ok(ready)).is_err() {
                // Opener gave up waiting
                return;
            }
            stream
        }
        Err(e) => {
            error!("Failed to open audio output: {}", e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    while !shared.shutdown.load(Ordering::SeqCst) {
        thread::park_timeout(Duration::from_millis(50));
    }

    drop(stream);
    debug!("Audio device thread exiting");
}

fn build_output(shared: &Arc<DeviceShared>, volume: f32) -> Result<(Stream, DeviceReady)> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::DeviceUnavailable("No output device available".to_string()))?;

    let config = device
        .default_output_config()
        .map_err(|e| Error::DeviceUnavailable(format!("Failed to get default output config: {}", e)))?;

    let sample_rate = config.sample_rate().0;
    let channels = config.channels();

    let capacity = ((sample_rate as f64 * RING_BUFFER_SECONDS) as usize).max(1024) * channels as usize;
    let (producer, consumer) = HeapRb::<f32>::new(capacity).split();

    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config.into(), consumer, volume, shared.clone())?,
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config.into(), consumer, volume, shared.clone())?,
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config.into(), consumer, volume, shared.clone())?,
        format => {
            return Err(Error::DeviceUnavailable(format!("Unsupported sample format: {:?}", format)))
        }
    };

    stream
        .play()
        .map_err(|e| Error::DeviceUnavailable(format!("Failed to start stream: {}", e)))?;

    Ok((
        stream,
        DeviceReady {
            producer,
            sample_rate,
            channels,
        },
    ))
}

fn build_stream<T: cpal::SizedSample + cpal::FromSample<f32>>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut consumer: RingConsumer,
    volume: f32,
    shared: Arc<DeviceShared>,
) -> Result<Stream> {
    let error_shared = shared.clone();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut played = 0u64;
                for sample in data.iter_mut() {
                    let value = match consumer.try_pop() {
                        Some(v) => {
                            played += 1;
                            v * volume
                        }
                        None => 0.0,
                    };
                    *sample = T::from_sample(value);
                }
                shared.consumed.fetch_add(played, Ordering::Release);
            },
            move |err| {
                error!("Audio output error: {}", err);
                error_shared.error.store(true, Ordering::SeqCst);
            },
            None,
        )
        .map_err(|e| Error::DeviceUnavailable(format!("Failed to build output stream: {}", e)))
}

struct CpalSink {
    producer: RingProducer,
    /// Mono samples at the device rate, starting at `start`
    pending: Vec<f32>,
    /// Mono samples already handed to the ring buffer
    cursor: usize,
    device_rate: u32,
    channels: usize,
    start: f64,
    end: f64,
    shared: Arc<DeviceShared>,
    thread: Option<JoinHandle<()>>,
}

impl AudioSink for CpalSink {
    fn pump(&mut self) -> Result<()> {
        if self.shared.error.load(Ordering::SeqCst) {
            return Err(Error::DeviceUnavailable("output stream reported an error".to_string()));
        }

        let frames_free = self.producer.vacant_len() / self.channels;
        let frames = frames_free.min(self.pending.len() - self.cursor);
        for &sample in &self.pending[self.cursor..self.cursor + frames] {
            for _ in 0..self.channels {
                // Space was checked above
                let _ = self.producer.try_push(sample);
            }
        }
        self.cursor += frames;
        Ok(())
    }

    fn position(&self) -> Option<f64> {
        if self.shared.error.load(Ordering::SeqCst) {
            return None;
        }

        let frames = self.shared.consumed.load(Ordering::Acquire) / self.channels as u64;
        if self.cursor == self.pending.len() && frames >= self.pending.len() as u64 {
            return Some(self.end);
        }
        Some((self.start + frames as f64 / self.device_rate as f64).min(self.end))
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Instant;

    #[test]
    fn test_device_open_is_bounded() {
        let (tx, rx) = mpsc::sync_channel::<Result<u32>>(1);
        let slow = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            let _ = tx.send(Ok(48000));
        });

        let started = Instant::now();
        let err = await_ready(&rx, Duration::from_millis(50)).unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(matches!(err, Error::DeviceUnavailable(_)));
        drop(rx);
        slow.join().unwrap();
    }

    #[test]
    fn test_device_open_result_passes_through() {
        let (tx, rx) = mpsc::sync_channel::<Result<u32>>(1);
        tx.send(Ok(44100)).unwrap();
        assert_eq!(await_ready(&rx, Duration::from_millis(50)).unwrap(), 44100);

        tx.send(Err(Error::DeviceUnavailable("no device".into()))).unwrap();
        assert!(await_ready(&rx, Duration::from_millis(50)).is_err());

        drop(tx);
        assert!(matches!(
            await_ready(&rx, Duration::from_millis(50)),
            Err(Error::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn test_null_backend_is_unavailable() {
        let track = Arc::new(AudioTrack::new(vec![0.0; 10], 10).unwrap());
        let err = NullBackend.open(track, 0.0, 1.0).err().unwrap();
        assert!(err.is_recoverable());
    }
}
