use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::ptr;
use std::slice;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};

use crate::error::{Result, UvcError};
use crate::uvc_proto::{
    decode_event, Event, EventSubscription, RequestPayload, UvcEventType, EVENT_SIZE,
    SUBSCRIPTION_SIZE,
};
use crate::StreamConfig;

// videodev2.h
pub const V4L2_BUF_TYPE_VIDEO_OUTPUT: u32 = 2;
pub const V4L2_MEMORY_MMAP: u32 = 1;
pub const V4L2_FIELD_NONE: u32 = 1;
pub const V4L2_PIX_FMT_YUYV: u32 = 0x5659_5559; // 'YUYV'
pub const V4L2_COLORSPACE_SRGB: u32 = 8;
pub const V4L2_YCBCR_ENC_601: u32 = 1;
pub const V4L2_QUANTIZATION_LIM_RANGE: u32 = 2;
pub const V4L2_XFER_FUNC_SRGB: u32 = 2;

#[repr(C)]
pub struct RawEvent(pub [u8; EVENT_SIZE]);

#[repr(C)]
pub struct RawSubscription(pub [u8; SUBSCRIPTION_SIZE]);

#[repr(C)]
pub struct RawResponse(pub [u8; RequestPayload::SIZE]);

/// v4l2_format: buffer type plus a 200-byte union. The union carries
/// types with 8-byte alignment, so the payload starts at offset 8.
#[repr(C)]
pub struct V4l2Format {
    pub type_: u32,
    pub fmt: FormatUnion,
}

#[repr(C, align(8))]
pub struct FormatUnion(pub [u8; 200]);

#[repr(C)]
pub struct V4l2RequestBuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub reserved: [u32; 1],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union BufferM {
    pub offset: u32,
    pub userptr: libc::c_ulong,
    pub planes: *mut libc::c_void,
    pub fd: i32,
}

/// v4l2_buffer, 64-bit layout (88 bytes, checked in tests).
#[repr(C)]
pub struct V4l2Buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: libc::timeval,
    pub timecode: V4l2Timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: BufferM,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: u32,
}

impl V4l2Buffer {
    fn for_output(index: u32) -> V4l2Buffer {
        // C ABI struct handed to the kernel, all-zero is the valid
        // initial state
        let mut buf: V4l2Buffer = unsafe { std::mem::zeroed() };
        buf.index = index;
        buf.type_ = V4L2_BUF_TYPE_VIDEO_OUTPUT;
        buf.memory = V4L2_MEMORY_MMAP;
        buf
    }
}

ioctl_readwrite!(vidioc_s_fmt, b'V', 5, V4l2Format);
ioctl_readwrite!(vidioc_reqbufs, b'V', 8, V4l2RequestBuffers);
ioctl_readwrite!(vidioc_querybuf, b'V', 9, V4l2Buffer);
ioctl_readwrite!(vidioc_qbuf, b'V', 15, V4l2Buffer);
ioctl_readwrite!(vidioc_dqbuf, b'V', 17, V4l2Buffer);
ioctl_write_ptr!(vidioc_streamon, b'V', 18, libc::c_int);
ioctl_write_ptr!(vidioc_streamoff, b'V', 19, libc::c_int);
ioctl_read!(vidioc_dqevent, b'V', 89, RawEvent);
ioctl_write_ptr!(vidioc_subscribe_event, b'V', 90, RawSubscription);
ioctl_write_ptr!(uvcioc_send_response, b'U', 1, RawResponse);

fn pix_format_bytes(config: &StreamConfig) -> [u8; 48] {
    let mut buf = Vec::with_capacity(48);
    // width, height, pixelformat, field, bytesperline, sizeimage,
    // colorspace, priv, flags, ycbcr_enc, quantization, xfer_func
    let format = structure!("<IIIIIIIIIIII");
    format.pack_into(&mut buf,
                     config.width, config.height, V4L2_PIX_FMT_YUYV, V4L2_FIELD_NONE,
                     config.width * 2, config.frame_size() as u32, V4L2_COLORSPACE_SRGB, 0,
                     0, V4L2_YCBCR_ENC_601, V4L2_QUANTIZATION_LIM_RANGE, V4L2_XFER_FUNC_SRGB,
    ).unwrap();
    let mut out = [0u8; 48];
    out.copy_from_slice(&buf);
    out
}

/// The opened UVC function character device.
///
/// All kernel interaction goes through here: event subscription and
/// dequeue, control-transfer responses, format and buffer ioctls, and
/// the bounded poll waits the session and pump loops sit in.
pub struct UvcDevice {
    file: File,
}

impl UvcDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<UvcDevice> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path.as_ref())
            .map_err(|e| UvcError::io("open", e))?;
        info!("opened {}", path.as_ref().display());
        Ok(UvcDevice { file })
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn subscribe(&self, event_type: UvcEventType) -> Result<()> {
        let raw = RawSubscription(EventSubscription::new(event_type).to_bytes());
        unsafe { vidioc_subscribe_event(self.fd(), &raw) }
            .map_err(|e| UvcError::io("VIDIOC_SUBSCRIBE_EVENT", e))?;
        Ok(())
    }

    pub fn subscribe_all(&self) -> Result<()> {
        for event_type in [
            UvcEventType::Connect,
            UvcEventType::Disconnect,
            UvcEventType::StreamOn,
            UvcEventType::StreamOff,
            UvcEventType::Setup,
            UvcEventType::Data,
        ] {
            self.subscribe(event_type)?;
        }
        Ok(())
    }

    pub fn dequeue_event(&self) -> Result<Event> {
        let mut raw = RawEvent([0u8; EVENT_SIZE]);
        unsafe { vidioc_dqevent(self.fd(), &mut raw) }
            .map_err(|e| UvcError::io("VIDIOC_DQEVENT", e))?;
        decode_event(&raw.0)
    }

    pub fn send_response(&self, payload: &RequestPayload) -> Result<()> {
        let raw = RawResponse(payload.to_bytes());
        unsafe { uvcioc_send_response(self.fd(), &raw) }
            .map_err(|e| UvcError::io("UVCIOC_SEND_RESPONSE", e))?;
        Ok(())
    }

    pub fn set_format(&self, config: &StreamConfig) -> Result<()> {
        let mut fmt = V4l2Format { type_: V4L2_BUF_TYPE_VIDEO_OUTPUT, fmt: FormatUnion([0u8; 200]) };
        fmt.fmt.0[..48].copy_from_slice(&pix_format_bytes(config));
        unsafe { vidioc_s_fmt(self.fd(), &mut fmt) }
            .map_err(|e| UvcError::io("VIDIOC_S_FMT", e))?;
        debug!("format set: {}x{} YUYV", config.width, config.height);
        Ok(())
    }

    /// Asks the kernel for `count` mmap buffers; returns how many were
    /// actually granted.
    pub fn request_buffers(&self, count: u32) -> Result<u32> {
        let mut req = V4l2RequestBuffers {
            count,
            type_: V4L2_BUF_TYPE_VIDEO_OUTPUT,
            memory: V4L2_MEMORY_MMAP,
            capabilities: 0,
            reserved: [0],
        };
        unsafe { vidioc_reqbufs(self.fd(), &mut req) }
            .map_err(|e| UvcError::io("VIDIOC_REQBUFS", e))?;
        Ok(req.count)
    }

    /// Returns (length, mmap offset) for the buffer at `index`.
    pub fn query_buffer(&self, index: u32) -> Result<(u32, u32)> {
        let mut buf = V4l2Buffer::for_output(index);
        unsafe { vidioc_querybuf(self.fd(), &mut buf) }
            .map_err(|e| UvcError::io("VIDIOC_QUERYBUF", e))?;
        Ok((buf.length, unsafe { buf.m.offset }))
    }

    pub fn queue_buffer(&self, index: u32, bytes_used: u32) -> Result<()> {
        let mut buf = V4l2Buffer::for_output(index);
        buf.bytesused = bytes_used;
        buf.field = V4L2_FIELD_NONE;
        unsafe { vidioc_qbuf(self.fd(), &mut buf) }
            .map_err(|e| UvcError::io("VIDIOC_QBUF", e))?;
        Ok(())
    }

    /// Reclaims a buffer the kernel is done transmitting. `None` when
    /// nothing is ready (the device is non-blocking).
    pub fn dequeue_buffer(&self) -> Result<Option<u32>> {
        let mut buf = V4l2Buffer::for_output(0);
        match unsafe { vidioc_dqbuf(self.fd(), &mut buf) } {
            Ok(_) => Ok(Some(buf.index)),
            Err(Errno::EAGAIN) => Ok(None),
            Err(e) => Err(UvcError::io("VIDIOC_DQBUF", e)),
        }
    }

    pub fn stream_on(&self) -> Result<()> {
        let type_: libc::c_int = V4L2_BUF_TYPE_VIDEO_OUTPUT as libc::c_int;
        unsafe { vidioc_streamon(self.fd(), &type_) }
            .map_err(|e| UvcError::io("VIDIOC_STREAMON", e))?;
        Ok(())
    }

    pub fn stream_off(&self) -> Result<()> {
        let type_: libc::c_int = V4L2_BUF_TYPE_VIDEO_OUTPUT as libc::c_int;
        unsafe { vidioc_streamoff(self.fd(), &type_) }
            .map_err(|e| UvcError::io("VIDIOC_STREAMOFF", e))?;
        Ok(())
    }

    /// Waits up to `timeout` for a queued event. `Ok(false)` on timeout
    /// or EINTR so callers can re-check their shutdown flag.
    pub fn wait_event(&self, timeout: Duration) -> Result<bool> {
        self.wait(PollFlags::POLLPRI, timeout)
    }

    /// Waits up to `timeout` for the driver to have a transmitted
    /// buffer ready to reclaim.
    pub fn wait_writable(&self, timeout: Duration) -> Result<bool> {
        self.wait(PollFlags::POLLOUT, timeout)
    }

    fn wait(&self, flags: PollFlags, timeout: Duration) -> Result<bool> {
        let timeout = PollTimeout::try_from(timeout.as_millis()).unwrap_or(PollTimeout::MAX);
        let mut fds = [PollFd::new(self.file.as_fd(), flags)];
        match poll(&mut fds, timeout) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(fds[0].revents().map_or(false, |r| r.intersects(flags))),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(UvcError::io("poll", e)),
        }
    }
}

/// RAII mapping of one kernel frame buffer into our address space.
pub struct MappedBuffer {
    ptr: *mut libc::c_void,
    len: usize,
}

// the mapping is exclusively owned; the raw pointer is what blocks the
// auto impl
unsafe impl Send for MappedBuffer {}

impl MappedBuffer {
    pub fn map(device: &UvcDevice, length: u32, offset: u32) -> Result<MappedBuffer> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                length as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                device.fd(),
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(UvcError::io("mmap", io::Error::last_os_error()));
        }
        Ok(MappedBuffer { ptr, len: length as usize })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr as *mut u8, self.len) }
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::mem;

    use super::*;

    // The ioctl numbers are derived from these sizes, so the layouts
    // must match the kernel ABI exactly.
    #[test]
    fn kernel_abi_struct_sizes() {
        assert_eq!(mem::size_of::<RawEvent>(), 136);
        assert_eq!(mem::size_of::<RawSubscription>(), 32);
        assert_eq!(mem::size_of::<RawResponse>(), 64);
        assert_eq!(mem::size_of::<V4l2Format>(), 208);
        assert_eq!(mem::size_of::<V4l2RequestBuffers>(), 20);
        assert_eq!(mem::size_of::<V4l2Buffer>(), 88);
    }

    #[test]
    fn pix_format_layout() {
        let config = StreamConfig::default();
        let bytes = pix_format_bytes(&config);
        assert_eq!(&bytes[0..4], &640u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &360u32.to_le_bytes());
        assert_eq!(&bytes[8..12], b"YUYV");
        assert_eq!(&bytes[16..20], &(640u32 * 2).to_le_bytes());
        assert_eq!(&bytes[20..24], &(640u32 * 360 * 2).to_le_bytes());
    }

    #[test]
    fn output_buffer_template() {
        let buf = V4l2Buffer::for_output(3);
        assert_eq!(buf.index, 3);
        assert_eq!(buf.type_, V4L2_BUF_TYPE_VIDEO_OUTPUT);
        assert_eq!(buf.memory, V4L2_MEMORY_MMAP);
        assert_eq!(buf.bytesused, 0);
    }
}
