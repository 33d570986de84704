//! Microphone capture on a dedicated thread.
//!
//! cpal streams are not `Send`, and capture must never be starved by the
//! async scheduler, so a single OS thread owns the input stream and is
//! driven through a small command channel. Captured frames flow out
//! through a bounded queue; the audio callback never blocks on a slow
//! consumer.

use crate::error::PipelineError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, Stream, StreamConfig};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, unbounded};
use std::sync::atomic::{AtomicU64, Ordering};

/// Frames buffered between the audio callback and the segmenter.
const FRAME_QUEUE_CAPACITY: usize = 256;

/// Frames dropped because the segmenter stalled (reset per capture).
static DROPPED_FRAMES: AtomicU64 = AtomicU64::new(0);

/// Output side of an active capture: frames plus the stream parameters
/// needed to segment them. The frame channel disconnects when capture
/// stops, which is the segmenter's flush signal.
pub struct CaptureStream {
    pub frames: Receiver<Vec<i16>>,
    pub sample_rate: u32,
    pub channels: u16,
}

enum Command {
    Start(Sender<Result<CaptureStream, PipelineError>>),
    Stop(Sender<()>),
}

/// Handle to the capture thread. Cloning shares the same microphone; only
/// one stream is ever open at a time.
#[derive(Clone)]
pub struct AudioCapture {
    commands: Sender<Command>,
}

impl AudioCapture {
    pub fn spawn() -> Self {
        let (commands, receiver) = unbounded::<Command>();
        std::thread::Builder::new()
            .name("parla-capture".to_string())
            .spawn(move || capture_thread(receiver))
            .expect("failed to spawn capture thread");
        Self { commands }
    }

    /// Open the default input device and begin producing frames. Device
    /// failures are fatal to the session and reported here, before any
    /// frame exists.
    pub fn start(&self) -> Result<CaptureStream, PipelineError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.commands
            .send(Command::Start(reply_tx))
            .map_err(|_| PipelineError::Device("capture thread is gone".to_string()))?;
        reply_rx
            .recv()
            .unwrap_or_else(|_| Err(PipelineError::Device("capture thread is gone".to_string())))
    }

    /// Stop the active stream. Idempotent; the frame channel disconnects
    /// once the stream is dropped.
    pub fn stop(&self) {
        let (reply_tx, reply_rx) = bounded(1);
        if self.commands.send(Command::Stop(reply_tx)).is_ok() {
            let _ = reply_rx.recv();
        }
    }

    /// Frames dropped during the last capture because the consumer stalled.
    pub fn dropped_frames() -> u64 {
        DROPPED_FRAMES.load(Ordering::Relaxed)
    }
}

fn capture_thread(receiver: Receiver<Command>) {
    let mut active: Option<Stream> = None;
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Start(reply) => {
                if active.is_some() {
                    let _ = reply.send(Err(PipelineError::Device(
                        "capture is already running".to_string(),
                    )));
                    continue;
                }
                match open_stream() {
                    Ok((stream, capture)) => {
                        active = Some(stream);
                        let _ = reply.send(Ok(capture));
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }
            Command::Stop(reply) => {
                active.take();
                let _ = reply.send(());
            }
        }
    }
}

fn open_stream() -> Result<(Stream, CaptureStream), PipelineError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| PipelineError::Device("no default input device".to_string()))?;
    let input_config = device
        .default_input_config()
        .map_err(|err| PipelineError::Device(format!("input config: {err}")))?;
    let config: StreamConfig = input_config.clone().into();

    DROPPED_FRAMES.store(0, Ordering::Relaxed);
    let (frame_tx, frame_rx) = bounded::<Vec<i16>>(FRAME_QUEUE_CAPACITY);

    let err_fn = |err| tracing::warn!("audio stream error (non-fatal): {err}");
    let stream = match input_config.sample_format() {
        SampleFormat::I16 => build_stream::<i16>(&device, &config, frame_tx, err_fn)?,
        SampleFormat::U16 => build_stream::<u16>(&device, &config, frame_tx, err_fn)?,
        SampleFormat::F32 => build_stream::<f32>(&device, &config, frame_tx, err_fn)?,
        other => {
            return Err(PipelineError::Device(format!(
                "unsupported sample format: {other:?}"
            )));
        }
    };
    stream
        .play()
        .map_err(|err| PipelineError::Device(format!("failed to start stream: {err}")))?;

    let capture = CaptureStream {
        frames: frame_rx,
        sample_rate: config.sample_rate,
        channels: config.channels,
    };
    Ok((stream, capture))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    frame_tx: Sender<Vec<i16>>,
    err_fn: impl Fn(cpal::StreamError) + Send + 'static,
) -> Result<Stream, PipelineError>
where
    T: cpal::SizedSample,
    i16: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let frame: Vec<i16> = data.iter().map(|&s| cpal::Sample::from_sample(s)).collect();
                // try_send keeps the audio thread from ever blocking;
                // a full queue means the consumer stalled and the frame
                // is dropped rather than the callback delayed.
                if let Err(TrySendError::Full(_)) = frame_tx.try_send(frame) {
                    let dropped = DROPPED_FRAMES.fetch_add(1, Ordering::Relaxed);
                    if dropped == 0 {
                        tracing::warn!("frame queue full, dropping audio frames");
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|err| PipelineError::Device(format!("failed to open stream: {err}")))
}
