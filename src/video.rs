//! Video surface that renders the remote stream on the player.

use crate::error::PlaybackError;
use crate::peer::RemoteStream;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Element lifecycle events on which playback is re-attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackEvent {
    LoadedMetadata,
    CanPlay,
    Pause,
    Waiting,
    Stalled,
}

impl PlaybackEvent {
    pub const RETRY_TRIGGERS: [PlaybackEvent; 5] = [
        PlaybackEvent::LoadedMetadata,
        PlaybackEvent::CanPlay,
        PlaybackEvent::Pause,
        PlaybackEvent::Waiting,
        PlaybackEvent::Stalled,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type PlaybackListener = Arc<dyn Fn() + Send + Sync>;

#[async_trait]
pub trait VideoElement: Send + Sync {
    fn set_autoplay(&self, on: bool);
    fn set_plays_inline(&self, on: bool);
    fn set_muted(&self, on: bool);
    fn set_src_object(&self, stream: Option<RemoteStream>);
    fn src_object(&self) -> Option<RemoteStream>;
    async fn play(&self) -> Result<(), PlaybackError>;
    fn pause(&self);
    fn add_listener(&self, event: PlaybackEvent, listener: PlaybackListener) -> ListenerId;
    fn remove_listener(&self, id: ListenerId);
}

pub trait VideoElementFactory: Send + Sync {
    fn create(&self) -> Arc<dyn VideoElement>;
}

#[derive(Default)]
struct OffscreenState {
    autoplay: bool,
    plays_inline: bool,
    muted: bool,
    src: Option<RemoteStream>,
    playing: bool,
    autoplay_blocked: bool,
    play_attempts: u32,
    next_listener: u64,
    listeners: Vec<(ListenerId, PlaybackEvent, PlaybackListener)>,
}

/// Headless video element. Playback state is tracked in memory; the host
/// (or a test) reports platform events through [`OffscreenVideo::dispatch`].
#[derive(Default)]
pub struct OffscreenVideo {
    state: Mutex<OffscreenState>,
}

impl OffscreenVideo {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, OffscreenState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Simulates an autoplay policy refusing `play()`.
    pub fn set_autoplay_blocked(&self, blocked: bool) {
        self.lock().autoplay_blocked = blocked;
    }

    /// Fires `event` at every listener registered for it.
    pub fn dispatch(&self, event: PlaybackEvent) {
        let listeners: Vec<PlaybackListener> = self
            .lock()
            .listeners
            .iter()
            .filter(|(_, e, _)| *e == event)
            .map(|(_, _, l)| l.clone())
            .collect();
        for listener in listeners {
            listener();
        }
    }

    /// A pause not requested by the page, e.g. background throttling.
    pub fn suspend(&self) {
        self.lock().playing = false;
        self.dispatch(PlaybackEvent::Pause);
    }

    pub fn is_playing(&self) -> bool {
        self.lock().playing
    }

    pub fn play_attempts(&self) -> u32 {
        self.lock().play_attempts
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// (autoplay, plays_inline, muted)
    pub fn flags(&self) -> (bool, bool, bool) {
        let state = self.lock();
        (state.autoplay, state.plays_inline, state.muted)
    }
}

#[async_trait]
impl VideoElement for OffscreenVideo {
    fn set_autoplay(&self, on: bool) {
        self.lock().autoplay = on;
    }

    fn set_plays_inline(&self, on: bool) {
        self.lock().plays_inline = on;
    }

    fn set_muted(&self, on: bool) {
        self.lock().muted = on;
    }

    fn set_src_object(&self, stream: Option<RemoteStream>) {
        let mut state = self.lock();
        if stream.is_none() {
            state.playing = false;
        }
        state.src = stream;
    }

    fn src_object(&self) -> Option<RemoteStream> {
        self.lock().src.clone()
    }

    async fn play(&self) -> Result<(), PlaybackError> {
        let mut state = self.lock();
        state.play_attempts += 1;
        if state.src.is_none() {
            return Err(PlaybackError("no source attached".to_string()));
        }
        if state.autoplay_blocked {
            return Err(PlaybackError("autoplay blocked".to_string()));
        }
        state.playing = true;
        Ok(())
    }

    fn pause(&self) {
        let was_playing = {
            let mut state = self.lock();
            std::mem::replace(&mut state.playing, false)
        };
        if was_playing {
            self.dispatch(PlaybackEvent::Pause);
        }
    }

    fn add_listener(&self, event: PlaybackEvent, listener: PlaybackListener) -> ListenerId {
        let mut state = self.lock();
        state.next_listener += 1;
        let id = ListenerId(state.next_listener);
        state.listeners.push((id, event, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.lock().listeners.retain(|(l, _, _)| *l != id);
    }
}

/// Creates [`OffscreenVideo`] elements and keeps a handle to each so the
/// host can drive their events.
#[derive(Default)]
pub struct OffscreenVideoFactory {
    created: Mutex<Vec<Arc<OffscreenVideo>>>,
}

impl OffscreenVideoFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> Vec<Arc<OffscreenVideo>> {
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn last(&self) -> Option<Arc<OffscreenVideo>> {
        self.created().last().cloned()
    }
}

impl VideoElementFactory for OffscreenVideoFactory {
    fn create(&self) -> Arc<dyn VideoElement> {
        let video = Arc::new(OffscreenVideo::new());
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(video.clone());
        debug!("Created offscreen video element");
        video
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_play_requires_source_and_policy() {
        let video = OffscreenVideo::new();
        assert!(video.play().await.is_err());

        video.set_src_object(Some(RemoteStream::new("s1")));
        video.set_autoplay_blocked(true);
        assert!(video.play().await.is_err());
        assert!(!video.is_playing());

        video.set_autoplay_blocked(false);
        video.play().await.unwrap();
        assert!(video.is_playing());
        assert_eq!(video.play_attempts(), 3);
    }

    #[test]
    fn test_listeners_fire_per_event_and_detach() {
        let video = OffscreenVideo::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = video.add_listener(
            PlaybackEvent::Stalled,
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        video.dispatch(PlaybackEvent::Stalled);
        video.dispatch(PlaybackEvent::CanPlay);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        video.remove_listener(id);
        video.dispatch(PlaybackEvent::Stalled);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(video.listener_count(), 0);
    }

    #[test]
    fn test_clearing_source_stops_playback() {
        let video = OffscreenVideo::new();
        video.set_src_object(Some(RemoteStream::new("s1")));
        video.set_src_object(None);
        assert!(video.src_object().is_none());
        assert!(!video.is_playing());
    }
}
