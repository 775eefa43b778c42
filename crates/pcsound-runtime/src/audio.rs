use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::Context;
use cpal::{
    FromSample, Sample, SampleFormat, SizedSample,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use crossbeam_channel::{Receiver, Sender, bounded};
use pcsound_core::{AudioOutput, Error as CoreError};
use ringbuf::{
    HeapRb,
    traits::{Consumer, Producer, Split},
};

use crate::runtime::{
    RuntimeError,
    types::{AUDIO_THREAD_NAME, STREAM_REPLY_TIMEOUT},
};

/// How long `write_data` waits for ring space before dropping the remainder.
const WRITE_TIMEOUT: Duration = Duration::from_millis(50);
const WRITE_RETRY: Duration = Duration::from_millis(1);

enum StreamCommand {
    Play(Sender<Result<(), RuntimeError>>),
    Close,
}

/// [`AudioOutput`] on cpal's default device.
///
/// The cpal stream lives on its own thread, so the output itself can move to
/// the mixer thread. Samples travel through a lock-free SPSC ring sized for
/// `latency`.
pub struct CpalOutput {
    producer: ringbuf::HeapProd<f32>,
    sample_rate: u32,
    /// Asks the device callback to drop everything queued.
    clear_flag: Arc<AtomicBool>,
    commands: Sender<StreamCommand>,
    stream_thread: Option<JoinHandle<()>>,
    disposed: bool,
}

impl CpalOutput {
    /// Opens the default output device. The stream is created paused; the
    /// mixer starts it.
    pub fn open(latency: Duration) -> Result<Self, RuntimeError> {
        let (reply_tx, reply_rx) = bounded(1);
        let (commands, command_rx) = bounded(4);
        let clear_flag = Arc::new(AtomicBool::new(false));
        let thread_clear = Arc::clone(&clear_flag);

        let stream_thread = thread::Builder::new()
            .name(AUDIO_THREAD_NAME.to_string())
            .spawn(move || stream_thread(latency, thread_clear, reply_tx, command_rx))
            .map_err(|err| RuntimeError::ThreadSpawn {
                name: AUDIO_THREAD_NAME,
                error: err.to_string(),
            })?;

        let (producer, sample_rate) = reply_rx
            .recv_timeout(STREAM_REPLY_TIMEOUT)
            .map_err(|err| RuntimeError::BuildStream(err.to_string()))??;

        tracing::info!(sample_rate, ?latency, "audio output opened");
        Ok(Self {
            producer,
            sample_rate,
            clear_flag,
            commands,
            stream_thread: Some(stream_thread),
            disposed: false,
        })
    }

    /// Output sample rate of the device; configure the mixer to match.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Drops all queued samples.
    pub fn clear(&self) {
        self.clear_flag.store(true, Ordering::SeqCst);
    }
}

impl AudioOutput for CpalOutput {
    fn start(&mut self) -> pcsound_core::Result<()> {
        let (reply_tx, reply_rx) = bounded(1);
        self.commands
            .send(StreamCommand::Play(reply_tx))
            .map_err(|_| CoreError::Backend("audio thread is gone".into()))?;
        reply_rx
            .recv_timeout(STREAM_REPLY_TIMEOUT)
            .map_err(|err| CoreError::Backend(err.to_string()))?
            .map_err(|err| CoreError::Backend(err.to_string()))
    }

    /// Pushes interleaved stereo samples, waiting a bounded time for space.
    fn write_data(&mut self, samples: &[f32]) -> pcsound_core::Result<()> {
        if self.disposed {
            return Err(CoreError::Backend("audio output disposed".into()));
        }
        let deadline = Instant::now() + WRITE_TIMEOUT;
        let mut pending = samples;
        while !pending.is_empty() {
            let pushed = self.producer.push_slice(pending);
            pending = &pending[pushed..];
            if pending.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                tracing::trace!(dropped = pending.len(), "audio ring full, dropping samples");
                break;
            }
            thread::sleep(WRITE_RETRY);
        }
        Ok(())
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        let _ = self.commands.send(StreamCommand::Close);
        if let Some(join) = self.stream_thread.take()
            && join.join().is_err()
        {
            tracing::error!("audio thread panicked");
        }
        tracing::info!("audio output closed");
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.dispose();
    }
}

type StreamReply = Result<(ringbuf::HeapProd<f32>, u32), RuntimeError>;

fn stream_thread(
    latency: Duration,
    clear_flag: Arc<AtomicBool>,
    reply: Sender<StreamReply>,
    commands: Receiver<StreamCommand>,
) {
    let (stream, producer, sample_rate) = match build_stream(latency, clear_flag) {
        Ok(parts) => parts,
        Err(err) => {
            let _ = reply.send(Err(err));
            return;
        }
    };
    if reply.send(Ok((producer, sample_rate))).is_err() {
        return;
    }

    while let Ok(command) = commands.recv() {
        match command {
            StreamCommand::Play(done) => {
                let result = stream
                    .play()
                    .map_err(|err| RuntimeError::PlayStream(err.to_string()));
                let _ = done.send(result);
            }
            StreamCommand::Close => break,
        }
    }
    drop(stream);
}

fn build_stream(
    latency: Duration,
    clear_flag: Arc<AtomicBool>,
) -> Result<(cpal::Stream, ringbuf::HeapProd<f32>, u32), RuntimeError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(RuntimeError::NoOutputDevice)?;
    let supported = device
        .default_output_config()
        .context("no default output config")
        .map_err(|err| RuntimeError::BuildStream(format!("{err:#}")))?;

    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let sample_rate = config.sample_rate;

    // Interleaved stereo, so two slots per frame.
    let capacity = ((sample_rate as f64 * latency.as_secs_f64()).ceil() as usize * 2).max(2);
    let (producer, consumer) = HeapRb::<f32>::new(capacity).split();

    let stream = match sample_format {
        SampleFormat::F32 => open_stream::<f32>(&device, &config, consumer, clear_flag),
        SampleFormat::I16 => open_stream::<i16>(&device, &config, consumer, clear_flag),
        SampleFormat::U16 => open_stream::<u16>(&device, &config, consumer, clear_flag),
        other => Err(RuntimeError::BuildStream(format!(
            "unsupported sample format {other:?}"
        ))),
    }?;
    if let Err(err) = stream.pause() {
        tracing::debug!("output stream cannot start paused: {err}");
    }
    Ok((stream, producer, sample_rate))
}

fn open_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut consumer: ringbuf::HeapCons<f32>,
    clear_flag: Arc<AtomicBool>,
) -> Result<cpal::Stream, RuntimeError>
where
    T: Sample + SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let err_fn = |err: cpal::StreamError| tracing::error!("audio stream error: {err}");
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                if clear_flag.swap(false, Ordering::SeqCst) {
                    consumer.clear();
                }
                for frame in data.chunks_mut(channels.max(1)) {
                    let left = consumer.try_pop().unwrap_or(0.0);
                    let right = consumer.try_pop().unwrap_or(left);
                    match channels {
                        0 => {}
                        1 => frame[0] = ((left + right) * 0.5).to_sample::<T>(),
                        _ => {
                            frame[0] = left.to_sample::<T>();
                            frame[1] = right.to_sample::<T>();
                            for ch in &mut frame[2..] {
                                *ch = right.to_sample::<T>();
                            }
                        }
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|err| RuntimeError::BuildStream(err.to_string()))
}
