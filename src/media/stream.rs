//! Inbound media stream: the set of tracks received by the Remote connection.

use std::sync::Arc;

use parking_lot::Mutex;

use super::Track;

/// Callback fired when a track joins the stream
pub type AddTrackCallback = Arc<dyn Fn(&Track) + Send + Sync>;

struct StreamInner {
    id: String,
    tracks: Mutex<Vec<Track>>,
    listeners: Mutex<Vec<AddTrackCallback>>,
}

/// Monotonically growing set of received tracks
#[derive(Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

impl MediaStream {
    pub fn new(id: &str) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: id.to_string(),
                tracks: Mutex::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Register an add-track listener
    pub fn on_add_track(&self, callback: AddTrackCallback) {
        self.inner.listeners.lock().push(callback);
    }

    /// Add a track and notify listeners.
    ///
    /// Returns false (and notifies nobody) if a track with the same id is already present.
    pub fn add_track(&self, track: Track) -> bool {
        {
            let mut tracks = self.inner.tracks.lock();
            if tracks.iter().any(|t| t.id() == track.id()) {
                return false;
            }
            tracks.push(track.clone());
        }

        let listeners = self.inner.listeners.lock().clone();
        for listener in &listeners {
            listener(&track);
        }
        true
    }

    /// Snapshot of the tracks received so far
    pub fn tracks(&self) -> Vec<Track> {
        self.inner.tracks.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.tracks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
