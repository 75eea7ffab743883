//! Gesture-gated playback of the shared notification clip.
//!
//! Some platforms refuse to play audio until the user has interacted with the
//! application. [`SoundGate`] primes the clip inside the first interaction it
//! sees and only then lets [`SoundGate::play_sound`] through.

use std::{
    io::Write,
    path::Path,
    sync::{Mutex, MutexGuard},
};
#[cfg(feature = "audio")]
use std::{
    fs::File,
    io::BufReader,
    path::PathBuf,
    sync::mpsc as std_mpsc,
    thread,
};

#[cfg(feature = "audio")]
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};
use tracing::{debug, info};
#[cfg(feature = "audio")]
use tracing::warn;

use crate::error::AudioPlaybackError;

/// The single process-wide audio resource. Only [`SoundGate`] drives it.
pub trait AudioClip: Send + Sync {
    fn play(&self) -> Result<(), AudioPlaybackError>;
    fn pause(&self);
    fn rewind(&self);
}

/// Capability surface the rest of the client depends on, so targets without
/// an autoplay restriction can plug in [`AlwaysUnlocked`].
pub trait SoundCapability: Send + Sync {
    fn try_unlock(&self) -> bool;
    fn is_unlocked(&self) -> bool;
    fn play(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundGateState {
    Locked,
    Unlocking,
    Unlocked,
}

/// User-originated interactions that count as a gesture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interaction {
    Click,
    KeyPress,
    Touch,
}

struct GateInner {
    state: SoundGateState,
    listening: bool,
}

pub struct SoundGate<A: AudioClip> {
    clip: A,
    inner: Mutex<GateInner>,
}

impl<A: AudioClip> SoundGate<A> {
    /// Creates a locked gate with its interaction listeners installed.
    pub fn new(clip: A) -> Self {
        Self {
            clip,
            inner: Mutex::new(GateInner {
                state: SoundGateState::Locked,
                listening: true,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> SoundGateState {
        self.lock().state
    }

    pub fn is_listening(&self) -> bool {
        self.lock().listening
    }

    /// Feeds a user interaction to the gate. Priming happens synchronously
    /// inside this call, which is what the gesture rule requires.
    pub fn handle_interaction(&self, interaction: Interaction) -> bool {
        {
            let mut guard = self.lock();
            if !guard.listening || guard.state != SoundGateState::Locked {
                return guard.state == SoundGateState::Unlocked;
            }
            guard.state = SoundGateState::Unlocking;
        }

        let primed = self.prime();
        let mut guard = self.lock();
        if primed {
            guard.state = SoundGateState::Unlocked;
            guard.listening = false;
            info!(?interaction, "sound: audio unlocked by user interaction");
        } else {
            guard.state = SoundGateState::Locked;
        }
        primed
    }

    fn prime(&self) -> bool {
        match self.clip.play() {
            Ok(()) => {
                self.clip.pause();
                self.clip.rewind();
                true
            }
            Err(err) => {
                debug!(error = %err, "sound: priming rejected, staying locked");
                false
            }
        }
    }

    /// Plays the clip from the start. Silent while locked; failures are swallowed.
    pub fn play_sound(&self) {
        if self.state() != SoundGateState::Unlocked {
            debug!("sound: playback skipped, audio still locked");
            return;
        }
        self.clip.rewind();
        if let Err(err) = self.clip.play() {
            debug!(error = %err, "sound: notification playback failed");
        }
    }

    /// Removes the interaction listeners. The unlock state is kept.
    pub fn dispose(&self) {
        self.lock().listening = false;
    }
}

impl<A: AudioClip> SoundCapability for SoundGate<A> {
    fn try_unlock(&self) -> bool {
        self.handle_interaction(Interaction::Click)
    }

    fn is_unlocked(&self) -> bool {
        self.state() == SoundGateState::Unlocked
    }

    fn play(&self) {
        self.play_sound();
    }
}

/// For environments without an autoplay rule.
pub struct AlwaysUnlocked<A: AudioClip>(pub A);

impl<A: AudioClip> SoundCapability for AlwaysUnlocked<A> {
    fn try_unlock(&self) -> bool {
        true
    }

    fn is_unlocked(&self) -> bool {
        true
    }

    fn play(&self) {
        self.0.rewind();
        if let Err(err) = self.0.play() {
            debug!(error = %err, "sound: notification playback failed");
        }
    }
}

impl<A: AudioClip + ?Sized> AudioClip for Box<A> {
    fn play(&self) -> Result<(), AudioPlaybackError> {
        (**self).play()
    }

    fn pause(&self) {
        (**self).pause()
    }

    fn rewind(&self) {
        (**self).rewind()
    }
}

/// Loads the notification clip at `path`, falling back to the terminal bell
/// when there is no audio output or the build has no audio support.
pub fn notification_clip(path: &Path) -> Box<dyn AudioClip> {
    #[cfg(feature = "audio")]
    match FileClip::open(path) {
        Ok(clip) => return Box::new(clip),
        Err(err) => warn!(
            path = %path.display(),
            error = %err,
            "sound: notification clip unavailable, using terminal bell"
        ),
    }
    #[cfg(not(feature = "audio"))]
    info!(
        path = %path.display(),
        "sound: built without audio support, using terminal bell"
    );
    Box::new(TerminalBell)
}

/// Plays a decoded audio file through the default output device.
///
/// The output stream cannot leave the thread that opened it, so a dedicated
/// thread owns it for as long as the clip lives; playback goes through the
/// `Send` stream handle.
#[cfg(feature = "audio")]
pub struct FileClip {
    path: PathBuf,
    handle: OutputStreamHandle,
    sink: Mutex<Option<Sink>>,
    // Dropping this ends the output thread.
    _output: std_mpsc::Sender<()>,
}

#[cfg(feature = "audio")]
impl FileClip {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AudioPlaybackError> {
        let path = path.into();
        if !path.is_file() {
            return Err(AudioPlaybackError::Unavailable(format!(
                "no clip at {}",
                path.display()
            )));
        }

        let (handle_tx, handle_rx) = std_mpsc::channel();
        let (output, shutdown) = std_mpsc::channel::<()>();
        thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || match OutputStream::try_default() {
                Ok((_stream, handle)) => {
                    if handle_tx.send(Ok(handle)).is_ok() {
                        let _ = shutdown.recv();
                    }
                }
                Err(err) => {
                    let _ = handle_tx.send(Err(err.to_string()));
                }
            })
            .map_err(|err| AudioPlaybackError::Unavailable(err.to_string()))?;

        let handle = handle_rx
            .recv()
            .map_err(|err| AudioPlaybackError::Unavailable(err.to_string()))?
            .map_err(AudioPlaybackError::Unavailable)?;
        debug!(path = %path.display(), "sound: audio output opened");

        Ok(Self {
            path,
            handle,
            sink: Mutex::new(None),
            _output: output,
        })
    }

    fn lock_sink(&self) -> MutexGuard<'_, Option<Sink>> {
        self.sink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(feature = "audio")]
impl AudioClip for FileClip {
    fn play(&self) -> Result<(), AudioPlaybackError> {
        let file = File::open(&self.path)
            .map_err(|err| AudioPlaybackError::Unavailable(err.to_string()))?;
        let source = Decoder::new(BufReader::new(file))
            .map_err(|err| AudioPlaybackError::Rejected(err.to_string()))?;
        let sink = Sink::try_new(&self.handle)
            .map_err(|err| AudioPlaybackError::Rejected(err.to_string()))?;
        sink.append(source);
        // Replacing the previous sink stops whatever it was still playing.
        *self.lock_sink() = Some(sink);
        Ok(())
    }

    fn pause(&self) {
        if let Some(sink) = self.lock_sink().as_ref() {
            sink.pause();
        }
    }

    fn rewind(&self) {
        if let Some(sink) = self.lock_sink().take() {
            sink.stop();
        }
    }
}

/// Rings the terminal bell. Used when no audio file can be played.
pub struct TerminalBell;

impl AudioClip for TerminalBell {
    fn play(&self) -> Result<(), AudioPlaybackError> {
        let mut stderr = std::io::stderr();
        stderr
            .write_all(b"\x07")
            .and_then(|()| stderr.flush())
            .map_err(|err| AudioPlaybackError::Unavailable(err.to_string()))
    }

    fn pause(&self) {}

    fn rewind(&self) {}
}

#[cfg(test)]
#[path = "tests/sound_tests.rs"]
mod tests;
