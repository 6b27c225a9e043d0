//! Packet capture collaborator.
//!
//! An interface task opens one [`PacketSource`] per run and drops it on
//! shutdown; reopening after a restart yields a fresh source.

#[cfg(target_os = "linux")]
mod afpacket;
mod channel;

#[cfg(target_os = "linux")]
pub use afpacket::AfPacketCapture;
pub use channel::ChannelCapture;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::CaptureKind;
use crate::error::SflowResult;

#[async_trait]
pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Opens a live capture on `device`.
    async fn open(&self, device: &str) -> SflowResult<Box<dyn PacketSource>>;
}

/// One captured frame. `data` may be shorter than the frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    pub data: Vec<u8>,
    /// Length of the frame on the wire
    pub frame_length: u32,
}

impl CapturedFrame {
    /// A frame captured in full.
    pub fn new(data: Vec<u8>) -> Self {
        let frame_length = data.len() as u32;
        Self { data, frame_length }
    }

    /// A frame of `frame_length` bytes of which only `data` was copied.
    pub fn truncated(data: Vec<u8>, frame_length: u32) -> Self {
        let frame_length = frame_length.max(data.len() as u32);
        Self { data, frame_length }
    }
}

#[async_trait]
pub trait PacketSource: Send {
    /// Next captured frame. `Ok(None)` means the source is exhausted.
    async fn next_packet(&mut self) -> SflowResult<Option<CapturedFrame>>;
}

/// Builds the configured capture backend.
pub fn create(kind: CaptureKind) -> SflowResult<Arc<dyn CaptureBackend>> {
    match kind {
        #[cfg(target_os = "linux")]
        CaptureKind::Afpacket => Ok(Arc::new(AfPacketCapture::new())),
        #[cfg(not(target_os = "linux"))]
        CaptureKind::Afpacket => Err(crate::error::SflowError::Config(
            "afpacket capture is only available on Linux".to_string(),
        )),
        CaptureKind::Channel => Ok(Arc::new(ChannelCapture::new())),
    }
}
