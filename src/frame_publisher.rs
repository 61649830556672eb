//! frame_publisher.rs — Single-slot latest-frame buffer for stream readers.
//!
//! One writer (the capture loop) replaces the slot; any number of readers
//! clone the JPEG bytes out. The lock is held only to swap or clone, never
//! while encoding or pacing.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::Serialize;

use crate::camera_capture::{encode_jpeg, Frame};

const EMPTY_SLOT_WAIT: Duration = Duration::from_millis(100);

/// The most recent frame, already JPEG-encoded.
#[derive(Debug, Clone)]
pub struct PublishedFrame {
    pub jpeg: Bytes,
    pub frame_number: u64,
    pub annotated: bool,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamHealth {
    pub streaming: bool,
    /// Frames captured so far, published or not.
    pub frame_count: u64,
}

struct Inner {
    slot: Mutex<Option<PublishedFrame>>,
    has_annotated: AtomicBool,
    closed: AtomicBool,
    frames_seen: AtomicU64,
    jpeg_quality: u8,
}

#[derive(Clone)]
pub struct FramePublisher {
    inner: Arc<Inner>,
}

impl FramePublisher {
    pub fn new(jpeg_quality: u8) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(None),
                has_annotated: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                frames_seen: AtomicU64::new(0),
                jpeg_quality,
            }),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<PublishedFrame>> {
        // A panicked writer leaves a whole frame or none; the slot stays usable.
        self.inner.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Encode `frame` and make it the latest frame.
    pub fn publish(
        &self,
        frame: &Frame,
        frame_number: u64,
        annotated: bool,
    ) -> Result<(), image::ImageError> {
        let jpeg = Bytes::from(encode_jpeg(frame, self.inner.jpeg_quality)?);
        self.publish_jpeg(jpeg, frame_number, annotated);
        Ok(())
    }

    pub fn publish_jpeg(&self, jpeg: Bytes, frame_number: u64, annotated: bool) {
        let published = PublishedFrame {
            jpeg,
            frame_number,
            annotated,
            published_at: Utc::now(),
        };
        *self.slot() = Some(published);
        self.count_frame(frame_number);
        if annotated {
            self.inner.has_annotated.store(true, Ordering::Release);
        }
    }

    /// Record that capture has reached frame `frame_number`, even if that
    /// frame is never published.
    pub fn count_frame(&self, frame_number: u64) {
        self.inner.frames_seen.fetch_max(frame_number, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> Option<PublishedFrame> {
        self.slot().clone()
    }

    pub fn has_annotated(&self) -> bool {
        self.inner.has_annotated.load(Ordering::Acquire)
    }

    pub fn health(&self) -> StreamHealth {
        StreamHealth {
            streaming: self.slot().is_some(),
            frame_count: self.inner.frames_seen.load(Ordering::Acquire),
        }
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Per-consumer frame stream paced at `interval`. Waits while the slot is
    /// empty and ends once the publisher is closed.
    pub fn stream(&self, interval: Duration) -> impl Stream<Item = PublishedFrame> + Send + 'static {
        stream::unfold((self.clone(), false), move |(publisher, paced)| async move {
            if paced {
                tokio::time::sleep(interval).await;
            }
            loop {
                if publisher.is_closed() {
                    return None;
                }
                match publisher.snapshot() {
                    Some(frame) => return Some((frame, (publisher, true))),
                    None => tokio::time::sleep(EMPTY_SLOT_WAIT).await,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use image::{Rgb, RgbImage};

    fn frame() -> Frame {
        RgbImage::from_pixel(16, 16, Rgb([200, 10, 10]))
    }

    #[test]
    fn test_empty_publisher() {
        let publisher = FramePublisher::new(85);
        assert!(publisher.snapshot().is_none());
        assert_eq!(
            publisher.health(),
            StreamHealth {
                streaming: false,
                frame_count: 0
            }
        );
        assert!(!publisher.has_annotated());
    }

    #[test]
    fn test_publish_replaces_slot() {
        let publisher = FramePublisher::new(85);
        publisher.publish(&frame(), 3, false).unwrap();
        assert!(!publisher.has_annotated());

        publisher.publish(&frame(), 5, true).unwrap();
        let latest = publisher.snapshot().unwrap();
        assert_eq!(latest.frame_number, 5);
        assert!(latest.annotated);
        assert_eq!(&latest.jpeg[..2], &[0xFF, 0xD8]);
        assert!(publisher.has_annotated());
        assert_eq!(publisher.health().frame_count, 5);
        assert!(publisher.health().streaming);
    }

    #[test]
    fn test_health_counts_unpublished_frames() {
        let publisher = FramePublisher::new(85);
        publisher.count_frame(4);
        assert_eq!(publisher.health().frame_count, 4);
        assert!(!publisher.health().streaming);

        publisher.publish(&frame(), 5, true).unwrap();
        for n in 6..=9 {
            publisher.count_frame(n);
        }
        assert_eq!(publisher.health().frame_count, 9);
        assert_eq!(publisher.snapshot().unwrap().frame_number, 5);
    }

    #[test]
    fn test_clones_share_the_slot() {
        let writer = FramePublisher::new(85);
        let reader = writer.clone();
        writer.publish_jpeg(Bytes::from_static(b"jpeg"), 1, true);
        assert_eq!(reader.snapshot().unwrap().jpeg, Bytes::from_static(b"jpeg"));
    }

    #[tokio::test]
    async fn test_stream_yields_then_ends_on_close() {
        let publisher = FramePublisher::new(85);
        let mut frames = Box::pin(publisher.stream(Duration::from_millis(5)));

        let writer = publisher.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.publish_jpeg(Bytes::from_static(b"a"), 10, true);
        });

        let first = frames.next().await.unwrap();
        assert_eq!(first.frame_number, 10);

        publisher.close();
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_on_closed_empty_publisher_ends() {
        let publisher = FramePublisher::new(85);
        publisher.close();
        let mut frames = Box::pin(publisher.stream(Duration::from_millis(5)));
        assert!(frames.next().await.is_none());
    }
}
