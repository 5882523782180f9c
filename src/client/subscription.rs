//! Subscriber handle over a stream's images
//!
//! A subscription aggregates every image (one per publishing session) the
//! driver has connected to it. The image list is shared with the conductor,
//! which appends on available-image events and removes on unavailable-image
//! events; polling snapshots the list and round-robins across it so one
//! busy session cannot starve the rest.

use crate::client::image::Image;
use crate::logbuffer::reader::{ControlledAction, Header};
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// The image list shared between a subscription and the conductor.
pub(crate) type ImageList = Arc<Mutex<Vec<Arc<Image>>>>;

/// A subscriber's handle to one (channel, stream id) pair.
pub struct Subscription {
    channel: String,
    stream_id: i32,
    registration_id: i64,
    channel_status_id: i32,
    images: ImageList,
    // Kept off the shared cache lines; every poll bumps it.
    round_robin: CachePadded<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl Subscription {
    pub(crate) fn new(
        channel: String,
        stream_id: i32,
        registration_id: i64,
        channel_status_id: i32,
        images: ImageList,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            channel,
            stream_id,
            registration_id,
            channel_status_id,
            images,
            round_robin: CachePadded::new(AtomicUsize::new(0)),
            closed,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    pub fn channel_status_id(&self) -> i32 {
        self.channel_status_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether any publisher is currently connected.
    pub fn is_connected(&self) -> bool {
        !self.is_closed() && !self.images.lock().is_empty()
    }

    /// Number of connected images.
    pub fn image_count(&self) -> usize {
        self.images.lock().len()
    }

    /// Snapshot of the current images.
    pub fn images(&self) -> Vec<Arc<Image>> {
        self.images.lock().clone()
    }

    /// The image for a given session, if connected.
    pub fn image_by_session(&self, session_id: i32) -> Option<Arc<Image>> {
        self.images
            .lock()
            .iter()
            .find(|image| image.session_id() == session_id)
            .cloned()
    }

    /// Poll each image in round-robin order, delivering published fragments.
    ///
    /// Returns the total number of fragments delivered across images.
    pub fn poll<H>(&self, handler: &mut H, fragments_limit: usize) -> usize
    where
        H: FnMut(&[u8], &Header),
    {
        if self.is_closed() {
            return 0;
        }

        let images = self.images.lock().clone();
        if images.is_empty() {
            return 0;
        }

        let start = self.round_robin.fetch_add(1, Ordering::Relaxed) % images.len();
        let mut fragments_read = 0;

        for step in 0..images.len() {
            if fragments_read >= fragments_limit {
                break;
            }
            let image = &images[(start + step) % images.len()];
            fragments_read += image.poll(handler, fragments_limit - fragments_read);
        }

        fragments_read
    }

    /// Controlled variant of [`poll`](Subscription::poll).
    pub fn controlled_poll<H>(&self, handler: &mut H, fragments_limit: usize) -> usize
    where
        H: FnMut(&[u8], &Header) -> ControlledAction,
    {
        if self.is_closed() {
            return 0;
        }

        let images = self.images.lock().clone();
        if images.is_empty() {
            return 0;
        }

        let start = self.round_robin.fetch_add(1, Ordering::Relaxed) % images.len();
        let mut fragments_read = 0;

        for step in 0..images.len() {
            if fragments_read >= fragments_limit {
                break;
            }
            let image = &images[(start + step) % images.len()];
            fragments_read += image.controlled_poll(handler, fragments_limit - fragments_read);
        }

        fragments_read
    }

    /// Block-poll every image, delivering contiguous frame runs.
    ///
    /// Returns the total bytes consumed.
    pub fn block_poll<H>(&self, handler: &mut H, block_length_limit: i32) -> i64
    where
        H: FnMut(&[u8], i32, i32),
    {
        if self.is_closed() {
            return 0;
        }

        let images = self.images.lock().clone();
        let mut bytes = 0i64;
        for image in &images {
            bytes += image.block_poll(handler, block_length_limit) as i64;
        }
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::mapped::LogBuffers;
    use crate::buffer::AtomicBuffer;
    use crate::counters::{CountersReader, COUNTER_LENGTH};
    use crate::logbuffer::appender::TermAppender;
    use crate::logbuffer::{pack_tail, TERM_MIN_LENGTH, TERM_TAIL_COUNTER_OFFSET};
    use tempfile::tempdir;

    fn image_with_messages(
        dir: &std::path::Path,
        name: &str,
        session_id: i32,
        counters: &CountersReader,
        position_id: i32,
        messages: &[&[u8]],
    ) -> Arc<Image> {
        let log = Arc::new(
            LogBuffers::create(dir.join(name), TERM_MIN_LENGTH, 0, 1408, session_id, 10).unwrap(),
        );
        log.tail_block(0)
            .put_i64(TERM_TAIL_COUNTER_OFFSET, pack_tail(0, 0));
        let appender =
            TermAppender::new(log.term_buffer(0), log.tail_block(0), log.header_template());
        for msg in messages {
            appender.append_unfragmented(msg, None);
        }
        Arc::new(Image::new(
            log,
            counters,
            position_id,
            session_id,
            session_id as i64,
            "test".to_string(),
        ))
    }

    #[test]
    fn test_poll_round_robins_across_images() {
        let dir = tempdir().unwrap();
        let mut values = vec![0u8; 8 * COUNTER_LENGTH as usize];
        let counters = CountersReader::new(AtomicBuffer::wrap_slice(&mut values));

        let images: ImageList = Arc::new(Mutex::new(vec![
            image_with_messages(dir.path(), "a.logbuffer", 1, &counters, 1, &[b"a1", b"a2"]),
            image_with_messages(dir.path(), "b.logbuffer", 2, &counters, 2, &[b"b1"]),
        ]));

        let subscription = Subscription::new(
            "bus://remote:4040".to_string(),
            10,
            5,
            0,
            images,
            Arc::new(AtomicBool::new(false)),
        );

        assert!(subscription.is_connected());
        assert_eq!(subscription.image_count(), 2);

        let mut seen = Vec::new();
        let fragments =
            subscription.poll(&mut |payload: &[u8], _: &Header| seen.push(payload.to_vec()), 10);
        assert_eq!(fragments, 3);
        seen.sort();
        assert_eq!(seen, vec![b"a1".to_vec(), b"a2".to_vec(), b"b1".to_vec()]);
    }

    #[test]
    fn test_fragment_limit_spans_images() {
        let dir = tempdir().unwrap();
        let mut values = vec![0u8; 8 * COUNTER_LENGTH as usize];
        let counters = CountersReader::new(AtomicBuffer::wrap_slice(&mut values));

        let images: ImageList = Arc::new(Mutex::new(vec![
            image_with_messages(dir.path(), "a.logbuffer", 1, &counters, 1, &[b"a1", b"a2"]),
            image_with_messages(dir.path(), "b.logbuffer", 2, &counters, 2, &[b"b1", b"b2"]),
        ]));

        let subscription = Subscription::new(
            "bus://remote:4040".to_string(),
            10,
            5,
            0,
            images,
            Arc::new(AtomicBool::new(false)),
        );

        let mut count = 0;
        assert_eq!(
            subscription.poll(&mut |_: &[u8], _: &Header| count += 1, 3),
            3
        );
    }

    #[test]
    fn test_closed_subscription_returns_nothing() {
        let dir = tempdir().unwrap();
        let mut values = vec![0u8; 8 * COUNTER_LENGTH as usize];
        let counters = CountersReader::new(AtomicBuffer::wrap_slice(&mut values));

        let closed = Arc::new(AtomicBool::new(false));
        let images: ImageList = Arc::new(Mutex::new(vec![image_with_messages(
            dir.path(),
            "a.logbuffer",
            1,
            &counters,
            1,
            &[b"a1"],
        )]));

        let subscription = Subscription::new(
            "bus://remote:4040".to_string(),
            10,
            5,
            0,
            images,
            Arc::clone(&closed),
        );

        closed.store(true, Ordering::Release);
        assert!(!subscription.is_connected());
        assert_eq!(subscription.poll(&mut |_: &[u8], _: &Header| {}, 10), 0);
    }
}
