//! Audio capture from microphone

use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;

use super::microphone::{AudioSource, MicEvent};
use crate::error::CaptureError;
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Buffers queued between the device callback and the consumer
const CHANNEL_DEPTH: usize = 256;

/// How often the device thread checks whether the consumer went away
const CLOSE_POLL: Duration = Duration::from_millis(50);

/// Captures audio from the default input device
///
/// cpal streams are not `Send`, so each opened stream lives on its own
/// thread and forwards buffers over a channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalSource;

impl CpalSource {
    /// Create a capture source for the default input device
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Get the sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }
}

impl AudioSource for CpalSource {
    fn open(&self) -> std::result::Result<mpsc::Receiver<MicEvent>, CaptureError> {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);

        std::thread::Builder::new()
            .name("parley-mic".to_string())
            .spawn(move || run_input_stream(&tx, &ready_tx))
            .map_err(|e| CaptureError::Route(e.to_string()))?;

        match wait_for_device(|| ready_rx.recv()) {
            Ok(Ok(())) => Ok(rx),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CaptureError::Route("capture thread exited".to_string())),
        }
    }
}

/// Run a blocking wait for the device thread
///
/// On a multi-threaded runtime the worker hands its other tasks off first.
fn wait_for_device<T>(wait: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(wait)
        }
        _ => wait(),
    }
}

/// Own a cpal input stream until the consumer drops its receiver
fn run_input_stream(
    tx: &mpsc::Sender<MicEvent>,
    ready: &std_mpsc::SyncSender<std::result::Result<(), CaptureError>>,
) {
    let stream = match build_input_stream(tx) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready.send(Err(classify_device_error(&e.to_string())));
        return;
    }

    let _ = ready.send(Ok(()));
    tracing::debug!("audio capture started");

    while !tx.is_closed() {
        std::thread::sleep(CLOSE_POLL);
    }

    drop(stream);
    tracing::debug!("audio capture stopped");
}

fn build_input_stream(
    tx: &mpsc::Sender<MicEvent>,
) -> std::result::Result<cpal::Stream, CaptureError> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| CaptureError::Route("no input device available".to_string()))?;

    let config = input_config(&device)?;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = SAMPLE_RATE,
        channels = config.channels,
        "audio capture initialized"
    );

    let data_tx = tx.clone();
    let err_tx = tx.clone();

    device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // Drop buffers rather than block the audio thread
                let _ = data_tx.try_send(MicEvent::Samples(data.to_vec()));
            },
            move |err| {
                tracing::error!(error = %err, "audio capture error");
                let _ = err_tx.try_send(MicEvent::Failed(err.to_string()));
            },
            None,
        )
        .map_err(|e| classify_device_error(&e.to_string()))
}

fn input_config(device: &cpal::Device) -> std::result::Result<StreamConfig, CaptureError> {
    let supported_config = device
        .supported_input_configs()
        .map_err(|e| classify_device_error(&e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        })
        .ok_or_else(|| CaptureError::Route("no suitable audio config found".to_string()))?;

    Ok(supported_config
        .with_sample_rate(SampleRate(SAMPLE_RATE))
        .config())
}

/// Map a device error message onto a capture failure
fn classify_device_error(message: &str) -> CaptureError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        CaptureError::PermissionDenied
    } else if lower.contains("busy") {
        CaptureError::DeviceBusy
    } else {
        CaptureError::Route(message.to_string())
    }
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn wav_round_trips_through_hound() {
        let samples = vec![0.0, 0.5, -0.5, 1.0];
        let wav = samples_to_wav(&samples, SAMPLE_RATE).unwrap();

        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.sample_rate, SAMPLE_RATE);
        assert_eq!(spec.channels, 1);
        assert_eq!(reader.len(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn device_wait_does_not_starve_the_worker() {
        let (tx, rx) = std_mpsc::channel();

        // The waiter occupies the only worker; the sender must still run
        let waiter = tokio::spawn(async move { wait_for_device(|| rx.recv()) });
        let sender = tokio::spawn(async move {
            tokio::task::yield_now().await;
            tx.send(7).unwrap();
        });

        assert_eq!(waiter.await.unwrap(), Ok(7));
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn device_wait_on_current_thread_runtime() {
        assert_eq!(wait_for_device(|| 3), 3);
    }

    #[test]
    fn device_wait_outside_a_runtime() {
        assert_eq!(wait_for_device(|| "ready"), "ready");
    }

    #[test]
    fn device_errors_are_classified() {
        assert_eq!(
            classify_device_error("Permission denied by the OS"),
            CaptureError::PermissionDenied
        );
        assert_eq!(
            classify_device_error("Device or resource busy"),
            CaptureError::DeviceBusy
        );
        assert!(matches!(
            classify_device_error("device disconnected"),
            CaptureError::Route(_)
        ));
    }
}
