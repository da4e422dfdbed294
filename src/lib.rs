#[macro_use]
extern crate log;
#[macro_use]
extern crate num_derive;
#[macro_use]
extern crate structure;

pub mod device;
pub mod error;
pub mod logger;
pub mod negotiation;
pub mod pattern;
pub mod pool;
pub mod session;
pub mod usb_proto;
pub mod uvc_proto;

pub use crate::device::UvcDevice;
pub use crate::error::UvcError;
pub use crate::session::Session;

/// The single active format/frame pair the function exposes: packed
/// YUYV, 16 bits per pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub buffer_count: u32,
}

impl Default for StreamConfig {
    fn default() -> StreamConfig {
        StreamConfig { width: 640, height: 360, fps: 30, buffer_count: 4 }
    }
}

impl StreamConfig {
    /// Byte size of one frame.
    pub fn frame_size(&self) -> usize {
        (self.width * self.height * 2) as usize
    }

    /// Frame interval in the 100ns units the protocol speaks.
    pub fn frame_interval_100ns(&self) -> u32 {
        10_000_000 / self.fps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = StreamConfig::default();
        assert_eq!(config.frame_size(), 640 * 360 * 2);
        assert_eq!(config.frame_interval_100ns(), 333_333);
    }
}
