//! Microphone ownership
//!
//! The microphone is a single-owner resource. Speech capture and the
//! barge-in level sampler both read from it, but only one of them may hold
//! it at any instant; [`Microphone::claim`] enforces that.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::error::CaptureError;

/// Item delivered by an open audio source
#[derive(Debug, Clone, PartialEq)]
pub enum MicEvent {
    /// A buffer of mono samples in `[-1, 1]`
    Samples(Vec<f32>),
    /// The device stream failed; no further samples follow
    Failed(String),
}

/// A device (or fake) that produces audio buffers
///
/// The underlying stream stays open until the returned receiver is dropped.
pub trait AudioSource: Send + Sync + 'static {
    /// Open the device and start delivering buffers
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` or `Route` if the device cannot be opened
    fn open(&self) -> Result<mpsc::Receiver<MicEvent>, CaptureError>;
}

/// Who currently owns the microphone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicUse {
    /// Full-rate capture feeding the speech recognizer
    Capture,
    /// Low-rate level polling during playback
    LevelSampler,
}

/// Arbitrates access to a single audio source
#[derive(Clone)]
pub struct Microphone {
    source: Arc<dyn AudioSource>,
    owner: Arc<Mutex<Option<MicUse>>>,
}

impl std::fmt::Debug for Microphone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Microphone")
            .field("owner", &self.owner())
            .finish_non_exhaustive()
    }
}

impl Microphone {
    /// Wrap an audio source
    #[must_use]
    pub fn new(source: impl AudioSource) -> Self {
        Self::from_arc(Arc::new(source))
    }

    /// Wrap a shared audio source
    #[must_use]
    pub fn from_arc(source: Arc<dyn AudioSource>) -> Self {
        Self {
            source,
            owner: Arc::new(Mutex::new(None)),
        }
    }

    /// Current owner, if any
    #[must_use]
    pub fn owner(&self) -> Option<MicUse> {
        match self.owner.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Take exclusive ownership and open the device
    ///
    /// # Errors
    ///
    /// Returns `DeviceBusy` if another consumer holds the microphone, or the
    /// source's error if the device cannot be opened
    pub fn claim(&self, usage: MicUse) -> Result<MicLease, CaptureError> {
        {
            let mut owner = match self.owner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(current) = *owner {
                tracing::debug!(?current, requested = ?usage, "microphone busy");
                return Err(CaptureError::DeviceBusy);
            }
            *owner = Some(usage);
        }

        // Ownership is recorded before the device opens so a concurrent claim
        // cannot slip in; roll it back if opening fails.
        match self.source.open() {
            Ok(receiver) => {
                tracing::trace!(?usage, "microphone claimed");
                Ok(MicLease {
                    usage,
                    owner: Arc::clone(&self.owner),
                    receiver: Some(receiver),
                })
            }
            Err(e) => {
                release(&self.owner, usage);
                Err(e)
            }
        }
    }
}

/// Exclusive hold on the microphone
///
/// Ownership is released when the lease is dropped.
#[derive(Debug)]
pub struct MicLease {
    usage: MicUse,
    owner: Arc<Mutex<Option<MicUse>>>,
    receiver: Option<mpsc::Receiver<MicEvent>>,
}

impl MicLease {
    /// What this lease was claimed for
    #[must_use]
    pub const fn usage(&self) -> MicUse {
        self.usage
    }

    /// Take the buffer stream out of the lease
    ///
    /// The lease keeps ownership; the stream closes when the receiver drops.
    pub fn take_receiver(&mut self) -> Option<mpsc::Receiver<MicEvent>> {
        self.receiver.take()
    }

    /// Borrow the buffer stream while keeping it tied to the lease
    pub fn receiver_mut(&mut self) -> Option<&mut mpsc::Receiver<MicEvent>> {
        self.receiver.as_mut()
    }
}

impl Drop for MicLease {
    fn drop(&mut self) {
        release(&self.owner, self.usage);
        tracing::trace!(usage = ?self.usage, "microphone released");
    }
}

fn release(owner: &Mutex<Option<MicUse>>, usage: MicUse) {
    let mut guard = match owner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if *guard == Some(usage) {
        *guard = None;
    }
}
