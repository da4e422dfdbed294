use std::io::Write;
use std::time::Duration;

use anyhow::Error;

use crate::error::UvcError;
use crate::usb_proto::SetupPacket;

// UVC
// https://www.spinelelectronics.com/pdf/UVC%201.5%20Class%20specification.pdf
// https://github.com/torvalds/linux/blob/master/include/uapi/linux/usb/g_uvc.h
// https://github.com/torvalds/linux/blob/master/include/uapi/linux/videodev2.h

#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq)]
#[repr(u8)]
pub enum UvcRequestCodes {
    Undefined = 0x00,
    SetCur = 0x01,
    GetCur = 0x81,
    GetMin = 0x82,
    GetMax = 0x83,
    GetRes = 0x84,
    GetLen = 0x85,
    GetInfo = 0x86,
    GetDef = 0x87,
}

/// Video-Streaming interface control selectors (wValue high byte).
#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamSelector {
    Probe = 0x01,
    Commit = 0x02,
}

pub const V4L2_EVENT_PRIVATE_START: u32 = 0x0800_0000;

#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq)]
#[repr(u32)]
pub enum UvcEventType {
    Connect = V4L2_EVENT_PRIVATE_START,
    Disconnect = V4L2_EVENT_PRIVATE_START + 1,
    StreamOn = V4L2_EVENT_PRIVATE_START + 2,
    StreamOff = V4L2_EVENT_PRIVATE_START + 3,
    Setup = V4L2_EVENT_PRIVATE_START + 4,
    Data = V4L2_EVENT_PRIVATE_START + 5,
}

/// UVC 1.5, table 4-75: video probe and commit controls.
///
/// This is the parameter block the host and device pass back and forth
/// during PROBE/COMMIT negotiation. 34 bytes packed little-endian; the
/// size itself is part of the protocol (GET_LEN reports it and hosts
/// check it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingControl {
    pub bm_hint: u16,
    pub b_format_index: u8,
    pub b_frame_index: u8,
    pub dw_frame_interval: u32,
    pub w_key_frame_rate: u16,
    pub w_pframe_rate: u16,
    pub w_comp_quality: u16,
    pub w_comp_window_size: u16,
    pub w_delay: u16,
    pub dw_max_video_frame_size: u32,
    pub dw_max_payload_transfer_size: u32,
    pub dw_clock_frequency: u32,
    pub bm_framing_info: u8,
    pub b_prefered_version: u8,
    pub b_min_version: u8,
    pub b_max_version: u8,
}

impl StreamingControl {
    pub const SIZE: usize = 34;

    pub fn zeroed() -> StreamingControl {
        StreamingControl {
            bm_hint: 0,
            b_format_index: 0,
            b_frame_index: 0,
            dw_frame_interval: 0,
            w_key_frame_rate: 0,
            w_pframe_rate: 0,
            w_comp_quality: 0,
            w_comp_window_size: 0,
            w_delay: 0,
            dw_max_video_frame_size: 0,
            dw_max_payload_transfer_size: 0,
            dw_clock_frequency: 0,
            bm_framing_info: 0,
            b_prefered_version: 0,
            b_min_version: 0,
            b_max_version: 0,
        }
    }

    pub fn serialize(&self, mut buffer: impl Write) -> Result<(), Error> {
        let format = structure!("<HBBIHHHHHIIIBBBB");
        format.pack_into(&mut buffer,
                         self.bm_hint, self.b_format_index, self.b_frame_index, self.dw_frame_interval,
                         self.w_key_frame_rate, self.w_pframe_rate, self.w_comp_quality, self.w_comp_window_size,
                         self.w_delay, self.dw_max_video_frame_size, self.dw_max_payload_transfer_size,
                         self.dw_clock_frequency, self.bm_framing_info, self.b_prefered_version,
                         self.b_min_version, self.b_max_version,
        )?;
        Ok(())
    }

    pub fn deserialize(mut buffer: &mut &[u8]) -> Result<StreamingControl, Error> {
        let format = structure!("<HBBIHHHHHIIIBBBB");
        let (bm_hint, b_format_index, b_frame_index, dw_frame_interval, w_key_frame_rate, w_pframe_rate,
            w_comp_quality, w_comp_window_size, w_delay, dw_max_video_frame_size, dw_max_payload_transfer_size,
            dw_clock_frequency, bm_framing_info, b_prefered_version, b_min_version, b_max_version)
            = format.unpack_from(&mut buffer)?;
        Ok(StreamingControl {
            bm_hint,
            b_format_index,
            b_frame_index,
            dw_frame_interval,
            w_key_frame_rate,
            w_pframe_rate,
            w_comp_quality,
            w_comp_window_size,
            w_delay,
            dw_max_video_frame_size,
            dw_max_payload_transfer_size,
            dw_clock_frequency,
            bm_framing_info,
            b_prefered_version,
            b_min_version,
            b_max_version,
        })
    }

    pub fn to_bytes(&self) -> [u8; StreamingControl::SIZE] {
        let mut buf = Vec::with_capacity(StreamingControl::SIZE);
        self.serialize(&mut buf).unwrap();
        let mut out = [0u8; StreamingControl::SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Applies a DATA-phase payload: the block becomes `bytes` truncated
    /// or zero-extended to the structure size.
    pub fn apply_bytes(&mut self, bytes: &[u8]) {
        let mut raw = [0u8; StreamingControl::SIZE];
        let n = bytes.len().min(StreamingControl::SIZE);
        raw[..n].copy_from_slice(&bytes[..n]);
        let mut slice = &raw[..];
        // raw is always a full block
        *self = StreamingControl::deserialize(&mut slice).unwrap();
    }

    /// Negotiated frame interval, converted from 100ns units.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_nanos(self.dw_frame_interval as u64 * 100)
    }

    pub fn fps(&self) -> i32 {
        (1.0f32 / (self.dw_frame_interval as f32 / 10000000.0)).round() as i32
    }
}

pub const RESPONSE_DATA_MAX: usize = 60;

/// Payload of a control transfer, in both directions: the data stage of
/// a host-to-device SET_CUR (delivered in a DATA event) and the response
/// we hand back to the kernel after a SETUP event. A negative length
/// tells the kernel to answer the host with a protocol STALL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPayload {
    pub length: i32,
    pub data: [u8; RESPONSE_DATA_MAX],
}

impl RequestPayload {
    pub const SIZE: usize = 64;

    /// "Level 2 halted" by long-standing gadget convention; the kernel
    /// maps any negative length to a stall on the control endpoint.
    pub fn stall() -> RequestPayload {
        RequestPayload { length: -libc::EL2HLT, data: [0u8; RESPONSE_DATA_MAX] }
    }

    pub fn empty(length: i32) -> RequestPayload {
        RequestPayload { length, data: [0u8; RESPONSE_DATA_MAX] }
    }

    pub fn with_bytes(bytes: &[u8]) -> RequestPayload {
        let mut data = [0u8; RESPONSE_DATA_MAX];
        let n = bytes.len().min(RESPONSE_DATA_MAX);
        data[..n].copy_from_slice(&bytes[..n]);
        RequestPayload { length: n as i32, data }
    }

    pub fn is_stall(&self) -> bool {
        self.length < 0
    }

    /// The valid prefix of `data`, empty for stalls.
    pub fn payload(&self) -> &[u8] {
        let n = (self.length.max(0) as usize).min(RESPONSE_DATA_MAX);
        &self.data[..n]
    }

    pub fn serialize(&self, mut buffer: impl Write) -> Result<(), Error> {
        let format = structure!("<i60s");
        format.pack_into(&mut buffer, self.length, &self.data[..])?;
        Ok(())
    }

    pub fn deserialize(mut buffer: &mut &[u8]) -> Result<RequestPayload, Error> {
        let format = structure!("<i60s");
        let (length, raw) = format.unpack_from(&mut buffer)?;
        let mut data = [0u8; RESPONSE_DATA_MAX];
        data.copy_from_slice(&raw[..]);
        Ok(RequestPayload { length, data })
    }

    pub fn to_bytes(&self) -> [u8; RequestPayload::SIZE] {
        let mut buf = Vec::with_capacity(RequestPayload::SIZE);
        self.serialize(&mut buf).unwrap();
        let mut out = [0u8; RequestPayload::SIZE];
        out.copy_from_slice(&buf);
        out
    }
}

/// Size of the kernel event envelope on 64-bit Linux: 4 (type) + 64
/// (union payload) + 4 + 4 (pending, sequence) + 4 (alignment) + 16
/// (timestamp) + 4 (id) + 32 (reserved) + 4 (tail padding).
pub const EVENT_SIZE: usize = 136;

/// Size of the union payload area embedded in the envelope, large
/// enough for a full [RequestPayload].
pub const EVENT_PAYLOAD_SIZE: usize = 64;

pub const SUBSCRIPTION_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventTimestamp {
    pub sec: i64,
    pub usec: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventKind {
    Connect,
    Disconnect,
    StreamOn,
    StreamOff,
    Setup(SetupPacket),
    Data(RequestPayload),
}

impl EventKind {
    pub fn event_type(&self) -> UvcEventType {
        match self {
            EventKind::Connect => UvcEventType::Connect,
            EventKind::Disconnect => UvcEventType::Disconnect,
            EventKind::StreamOn => UvcEventType::StreamOn,
            EventKind::StreamOff => UvcEventType::StreamOff,
            EventKind::Setup(_) => UvcEventType::Setup,
            EventKind::Data(_) => UvcEventType::Data,
        }
    }
}

/// One dequeued kernel event: the decoded payload plus the envelope
/// bookkeeping fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub pending: u32,
    pub sequence: u32,
    pub timestamp: EventTimestamp,
    pub id: u32,
}

pub fn decode_event(bytes: &[u8]) -> Result<Event, UvcError> {
    if bytes.len() < EVENT_SIZE {
        return Err(UvcError::MalformedEvent(format!(
            "event envelope too short: {} < {}", bytes.len(), EVENT_SIZE
        )));
    }

    let format = structure!("<I64sIIIqqI32sI");
    let mut slice = &bytes[..];
    let (event_type, payload, pending, sequence, _pad, sec, usec, id, _reserved, _tail) = format
        .unpack_from(&mut slice)
        .map_err(|e| UvcError::MalformedEvent(e.to_string()))?;

    let kind = match num_traits::FromPrimitive::from_u32(event_type) {
        Some(UvcEventType::Connect) => EventKind::Connect,
        Some(UvcEventType::Disconnect) => EventKind::Disconnect,
        Some(UvcEventType::StreamOn) => EventKind::StreamOn,
        Some(UvcEventType::StreamOff) => EventKind::StreamOff,
        Some(UvcEventType::Setup) => {
            let mut req = &payload[..SetupPacket::size()];
            let pkt = SetupPacket::deserialize(&mut req)
                .map_err(|e| UvcError::MalformedEvent(e.to_string()))?;
            EventKind::Setup(pkt)
        }
        Some(UvcEventType::Data) => {
            let mut req = &payload[..RequestPayload::SIZE];
            let data = RequestPayload::deserialize(&mut req)
                .map_err(|e| UvcError::MalformedEvent(e.to_string()))?;
            EventKind::Data(data)
        }
        None => {
            return Err(UvcError::MalformedEvent(format!(
                "unknown event type {:#010x}", event_type
            )));
        }
    };

    Ok(Event {
        kind,
        pending,
        sequence,
        timestamp: EventTimestamp { sec, usec },
        id,
    })
}

pub fn encode_event(event: &Event) -> Result<[u8; EVENT_SIZE], Error> {
    let mut payload = [0u8; EVENT_PAYLOAD_SIZE];
    match &event.kind {
        EventKind::Setup(pkt) => {
            let mut cursor = &mut payload[..];
            pkt.serialize(&mut cursor)?;
        }
        EventKind::Data(data) => {
            let mut cursor = &mut payload[..];
            data.serialize(&mut cursor)?;
        }
        _ => {}
    }

    let format = structure!("<I64sIIIqqI32sI");
    let mut buf = Vec::with_capacity(EVENT_SIZE);
    format.pack_into(&mut buf,
                     event.kind.event_type() as u32, &payload[..], event.pending, event.sequence, 0,
                     event.timestamp.sec, event.timestamp.usec, event.id, &[0u8; 32][..], 0,
    )?;
    let mut out = [0u8; EVENT_SIZE];
    out.copy_from_slice(&buf);
    Ok(out)
}

/// v4l2_event_subscription: which event class the kernel should queue
/// for us. The id and flags fields stay zero for UVC gadget events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSubscription {
    pub event_type: u32,
    pub id: u32,
    pub flags: u32,
}

impl EventSubscription {
    pub fn new(event_type: UvcEventType) -> EventSubscription {
        EventSubscription { event_type: event_type as u32, id: 0, flags: 0 }
    }

    pub fn serialize(&self, mut buffer: impl Write) -> Result<(), Error> {
        let format = structure!("<III20s");
        format.pack_into(&mut buffer, self.event_type, self.id, self.flags, &[0u8; 20][..])?;
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; SUBSCRIPTION_SIZE] {
        let mut buf = Vec::with_capacity(SUBSCRIPTION_SIZE);
        self.serialize(&mut buf).unwrap();
        let mut out = [0u8; SUBSCRIPTION_SIZE];
        out.copy_from_slice(&buf);
        out
    }
}

#[cfg(test)]
mod tests {
    use float_eq::float_eq;

    use super::*;

    fn sample_control() -> StreamingControl {
        StreamingControl {
            bm_hint: 1,
            b_format_index: 1,
            b_frame_index: 1,
            dw_frame_interval: 333333,
            w_key_frame_rate: 0,
            w_pframe_rate: 0,
            w_comp_quality: 0,
            w_comp_window_size: 0,
            w_delay: 0,
            dw_max_video_frame_size: 640 * 360 * 2,
            dw_max_payload_transfer_size: 3072,
            dw_clock_frequency: 48_000_000,
            bm_framing_info: 3,
            b_prefered_version: 1,
            b_min_version: 1,
            b_max_version: 1,
        }
    }

    #[test]
    fn streaming_control_wire_size() {
        assert_eq!(structure!("<HBBIHHHHHIIIBBBB").size(), StreamingControl::SIZE);
        assert_eq!(sample_control().to_bytes().len(), 34);
    }

    #[test]
    fn streaming_control_round_trip() {
        let ctrl = sample_control();
        let bytes = ctrl.to_bytes();
        let mut slice = &bytes[..];
        let actual = StreamingControl::deserialize(&mut slice).unwrap();
        assert_eq!(actual, ctrl);
    }

    #[test]
    fn streaming_control_apply_truncates_and_zero_extends() {
        // A short payload zero-extends: only the leading fields survive.
        let mut ctrl = sample_control();
        ctrl.apply_bytes(&[0x02, 0x00, 0x03, 0x05]);
        assert_eq!(ctrl.bm_hint, 2);
        assert_eq!(ctrl.b_format_index, 3);
        assert_eq!(ctrl.b_frame_index, 5);
        assert_eq!(ctrl.dw_frame_interval, 0);
        assert_eq!(ctrl.dw_clock_frequency, 0);

        // An over-long payload truncates to the structure size.
        let mut long = [0xaau8; 64];
        long[..34].copy_from_slice(&sample_control().to_bytes());
        let mut ctrl = StreamingControl::zeroed();
        ctrl.apply_bytes(&long);
        assert_eq!(ctrl, sample_control());
    }

    #[test]
    fn streaming_control_fps() {
        let mut ctrl = sample_control();
        assert_eq!(ctrl.fps(), 30);
        ctrl.dw_frame_interval = 166666;
        assert_eq!(ctrl.fps(), 60);
        let expected = 1.0f32 / (333333.0 / 10000000.0);
        assert!(float_eq!(sample_control().fps() as f32, expected.round(), abs <= 0.5));
    }

    #[test]
    fn request_payload_round_trip() {
        let payload = RequestPayload::with_bytes(&sample_control().to_bytes());
        assert_eq!(payload.length, 34);
        let mut buf = vec![];
        payload.serialize(&mut buf).unwrap();
        assert_eq!(buf.len(), RequestPayload::SIZE);

        let mut slice = &buf[..];
        let actual = RequestPayload::deserialize(&mut slice).unwrap();
        assert_eq!(actual, payload);
    }

    #[test]
    fn request_payload_stall_is_negative() {
        let stall = RequestPayload::stall();
        assert!(stall.is_stall());
        assert_eq!(stall.length, -51);
        assert!(stall.payload().is_empty());
    }

    #[test]
    fn event_round_trip_all_kinds() {
        let kinds = [
            EventKind::Connect,
            EventKind::Disconnect,
            EventKind::StreamOn,
            EventKind::StreamOff,
            EventKind::Setup(SetupPacket {
                b_request_type: 0xa1,
                b_request: 0x86,
                w_value: 0x0100,
                w_index: 0x0001,
                w_length: 1,
            }),
            EventKind::Data(RequestPayload::with_bytes(&sample_control().to_bytes())),
        ];

        for (i, kind) in kinds.iter().enumerate() {
            let event = Event {
                kind: *kind,
                pending: 0,
                sequence: i as u32,
                timestamp: EventTimestamp { sec: 12, usec: 345678 },
                id: 0,
            };
            let bytes = encode_event(&event).unwrap();
            assert_eq!(bytes.len(), EVENT_SIZE);
            let actual = decode_event(&bytes).unwrap();
            assert_eq!(actual, event);
        }
    }

    #[test]
    fn decode_event_rejects_short_buffer() {
        let err = decode_event(&[0u8; 16]).unwrap_err();
        assert!(matches!(err, UvcError::MalformedEvent(_)));
    }

    #[test]
    fn decode_event_rejects_unknown_type() {
        let mut bytes = [0u8; EVENT_SIZE];
        bytes[..4].copy_from_slice(&0xdead_beefu32.to_le_bytes());
        let err = decode_event(&bytes).unwrap_err();
        assert!(matches!(err, UvcError::MalformedEvent(_)));
    }

    #[test]
    fn subscription_wire_size() {
        let sub = EventSubscription::new(UvcEventType::Setup);
        let bytes = sub.to_bytes();
        assert_eq!(bytes.len(), SUBSCRIPTION_SIZE);
        assert_eq!(&bytes[..4], &(V4L2_EVENT_PRIVATE_START + 4).to_le_bytes());
        assert!(bytes[4..].iter().all(|b| *b == 0));
    }
}
