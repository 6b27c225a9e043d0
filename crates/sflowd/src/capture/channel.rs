//! In-process capture backend.
//!
//! Frames are pushed with [`ChannelCapture::inject`] into whichever source is
//! currently open for the device. Opening a device again replaces the feed.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;

use super::{CaptureBackend, CapturedFrame, PacketSource};
use crate::error::{SflowError, SflowResult};

const FEED_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct Feeds {
    senders: HashMap<String, mpsc::Sender<CapturedFrame>>,
    failing: HashSet<String>,
    opens: HashMap<String, u32>,
}

#[derive(Debug, Default)]
pub struct ChannelCapture {
    feeds: Mutex<Feeds>,
}

impl ChannelCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a frame on the open source for `device`. Returns false when no
    /// source is open or its queue is full.
    pub fn inject(&self, device: &str, frame: Vec<u8>) -> bool {
        self.inject_frame(device, CapturedFrame::new(frame))
    }

    /// Like [`ChannelCapture::inject`] but with an explicit wire length.
    pub fn inject_frame(&self, device: &str, frame: CapturedFrame) -> bool {
        let feeds = self.feeds.lock();
        match feeds.senders.get(device) {
            Some(tx) => tx.try_send(frame).is_ok(),
            None => false,
        }
    }

    /// True while a source for `device` is open.
    pub fn is_open(&self, device: &str) -> bool {
        self.feeds
            .lock()
            .senders
            .get(device)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Times `device` was successfully opened.
    pub fn open_count(&self, device: &str) -> u32 {
        self.feeds.lock().opens.get(device).copied().unwrap_or(0)
    }

    /// Makes subsequent opens of `device` fail.
    pub fn fail_open(&self, device: &str, fail: bool) {
        let mut feeds = self.feeds.lock();
        if fail {
            feeds.failing.insert(device.to_string());
        } else {
            feeds.failing.remove(device);
        }
    }

    /// Ends the open source for `device` as if the device went away.
    pub fn close(&self, device: &str) {
        self.feeds.lock().senders.remove(device);
    }
}

#[async_trait]
impl CaptureBackend for ChannelCapture {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn open(&self, device: &str) -> SflowResult<Box<dyn PacketSource>> {
        let mut feeds = self.feeds.lock();
        if feeds.failing.contains(device) {
            return Err(SflowError::capture(device, "no such device"));
        }

        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        feeds.senders.insert(device.to_string(), tx);
        *feeds.opens.entry(device.to_string()).or_insert(0) += 1;
        Ok(Box::new(ChannelSource { rx }))
    }
}

struct ChannelSource {
    rx: mpsc::Receiver<CapturedFrame>,
}

#[async_trait]
impl PacketSource for ChannelSource {
    async fn next_packet(&mut self) -> SflowResult<Option<CapturedFrame>> {
        Ok(self.rx.recv().await)
    }
}
