//! The call side: where published frames go.

#[cfg(feature = "loopback")]
mod loopback;

#[cfg(feature = "loopback")]
pub use loopback::V4L2Output;

use crate::error::MediaError;
use crate::frame::FrameMarker;
use image::RgbImage;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Identifies one installed backend session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// What feeds the outgoing video track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrackSource {
    /// The raw camera track.
    Camera,
    /// The processed track of one backend session.
    Processed { session: SessionId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTrack {
    pub id: String,
}

/// The sender currently attached to the outgoing video track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoSender {
    pub source: TrackSource,
    /// How many times the outgoing track has been replaced.
    pub replacements: u64,
}

/// Peer-connection surface the pipeline publishes into.
pub trait CallTransport: Send {
    /// Swap the outgoing video track without renegotiating.
    fn replace_outgoing_video(&mut self, source: TrackSource) -> Result<(), MediaError>;

    fn attach_audio_tracks(&mut self, tracks: &[AudioTrack]) -> Result<(), MediaError>;

    fn outgoing_video_sender(&self) -> VideoSender;

    /// Send one frame on the current outgoing track.
    fn write_frame(&mut self, frame: &RgbImage, marker: FrameMarker) -> Result<(), MediaError>;
}

impl<T: CallTransport + ?Sized> CallTransport for Box<T> {
    fn replace_outgoing_video(&mut self, source: TrackSource) -> Result<(), MediaError> {
        (**self).replace_outgoing_video(source)
    }

    fn attach_audio_tracks(&mut self, tracks: &[AudioTrack]) -> Result<(), MediaError> {
        (**self).attach_audio_tracks(tracks)
    }

    fn outgoing_video_sender(&self) -> VideoSender {
        (**self).outgoing_video_sender()
    }

    fn write_frame(&mut self, frame: &RgbImage, marker: FrameMarker) -> Result<(), MediaError> {
        (**self).write_frame(frame, marker)
    }
}

/// One frame as it left the pipeline.
#[derive(Debug, Clone)]
pub struct Published {
    pub marker: FrameMarker,
    pub source: TrackSource,
    pub image: Option<RgbImage>,
}

#[derive(Debug, Default)]
pub struct TransportLog {
    pub published: Vec<Published>,
    pub replacements: Vec<TrackSource>,
    pub audio: Vec<AudioTrack>,
    current: Option<TrackSource>,
}

/// In-memory transport: remembers everything it is asked to do.
///
/// Clones share the same log, so a test can keep one while the pipeline owns
/// another. Used when no real output device is configured.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    log: Arc<Mutex<TransportLog>>,
    keep_images: bool,
    retention: Option<usize>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also keep a copy of every published image.
    pub fn keeping_images(mut self) -> Self {
        self.keep_images = true;
        self
    }

    /// Keep only about the last `frames` publishes.
    pub fn with_retention(mut self, frames: usize) -> Self {
        self.retention = Some(frames.max(1));
        self
    }

    pub fn log(&self) -> MutexGuard<'_, TransportLog> {
        // A poisoned log is still readable; the panicking writer is a test failure anyway
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CallTransport for RecordingTransport {
    fn replace_outgoing_video(&mut self, source: TrackSource) -> Result<(), MediaError> {
        let mut log = self.log();
        log.replacements.push(source);
        log.current = Some(source);
        Ok(())
    }

    fn attach_audio_tracks(&mut self, tracks: &[AudioTrack]) -> Result<(), MediaError> {
        self.log().audio.extend_from_slice(tracks);
        Ok(())
    }

    fn outgoing_video_sender(&self) -> VideoSender {
        let log = self.log();
        VideoSender {
            source: log.current.unwrap_or(TrackSource::Camera),
            replacements: log.replacements.len() as u64,
        }
    }

    fn write_frame(&mut self, frame: &RgbImage, marker: FrameMarker) -> Result<(), MediaError> {
        let keep = self.keep_images;
        let mut log = self.log();
        let source = log.current.ok_or_else(|| {
            MediaError::Transport("no outgoing video track attached".to_string())
        })?;
        log.published.push(Published {
            marker,
            source,
            image: keep.then(|| frame.clone()),
        });
        if let Some(retention) = self.retention {
            let len = log.published.len();
            if len >= retention * 2 {
                log.published.drain(..len - retention);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_need_a_track() {
        let mut transport = RecordingTransport::new();
        let frame = RgbImage::new(2, 2);
        assert!(transport.write_frame(&frame, FrameMarker(0)).is_err());

        transport.replace_outgoing_video(TrackSource::Camera).unwrap();
        transport.write_frame(&frame, FrameMarker(0)).unwrap();
        assert_eq!(transport.log().published.len(), 1);
        assert!(transport.log().published[0].image.is_none());
    }

    #[test]
    fn clones_share_the_log() {
        let observer = RecordingTransport::new().keeping_images();
        let mut transport = observer.clone();
        let session = TrackSource::Processed {
            session: SessionId(3),
        };
        transport.replace_outgoing_video(session).unwrap();
        transport
            .write_frame(&RgbImage::new(2, 2), FrameMarker(9))
            .unwrap();

        let sender = observer.outgoing_video_sender();
        assert_eq!(sender.source, session);
        assert_eq!(sender.replacements, 1);
        assert_eq!(observer.log().published[0].marker, FrameMarker(9));
        assert!(observer.log().published[0].image.is_some());
    }

    #[test]
    fn retention_bounds_the_log() {
        let mut transport = RecordingTransport::new().with_retention(10);
        transport.replace_outgoing_video(TrackSource::Camera).unwrap();
        for i in 0..45 {
            transport.write_frame(&RgbImage::new(1, 1), FrameMarker(i)).unwrap();
        }
        let log = transport.log();
        assert!(log.published.len() < 20);
        assert_eq!(log.published.last().unwrap().marker, FrameMarker(44));
    }
}
