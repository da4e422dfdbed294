use crate::usb_proto::{Recip, SetupPacket, XferType};
use crate::uvc_proto::{RequestPayload, StreamSelector, StreamingControl, UvcRequestCodes, RESPONSE_DATA_MAX};
use crate::StreamConfig;

/// Interface numbers fixed by the gadget's configfs descriptor layout.
pub const CONTROL_INTERFACE: u8 = 0;
pub const STREAMING_INTERFACE: u8 = 1;

/// Frame interval bounds advertised to the host, in 100ns units:
/// 20 fps at the slow end, 60 fps at the fast end.
const FRAME_INTERVAL_SLOWEST: u32 = 500_000;
const FRAME_INTERVAL_FASTEST: u32 = 166_666;
const DEFAULT_FRAME_INTERVAL: u32 = 333_333;

const MAX_PAYLOAD_TRANSFER_SIZE: u32 = 3072;
const CLOCK_FREQUENCY: u32 = 48_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationOutcome {
    None,
    /// The host completed a COMMIT data phase; the committed block is
    /// now authoritative for the stream format.
    Committed,
}

/// PROBE/COMMIT negotiation state.
///
/// The host drives this with class-specific control transfers on the
/// streaming interface: a dance of GET_* reads against the probe block,
/// SET_CUR writes (whose data arrives in a separate DATA event), and a
/// final SET_CUR(COMMIT) that locks in the parameters. State is the two
/// parameter blocks plus which SET_CUR is awaiting its data phase.
#[derive(Debug)]
pub struct Negotiator {
    probe: StreamingControl,
    commit: StreamingControl,
    pending: Option<StreamSelector>,
    defaults: StreamingControl,
}

impl Negotiator {
    pub fn new(config: &StreamConfig) -> Negotiator {
        let defaults = StreamingControl {
            bm_hint: 1,
            b_format_index: 1,
            b_frame_index: 1,
            dw_frame_interval: DEFAULT_FRAME_INTERVAL,
            w_key_frame_rate: 0,
            w_pframe_rate: 0,
            w_comp_quality: 0,
            w_comp_window_size: 0,
            w_delay: 0,
            dw_max_video_frame_size: config.frame_size() as u32,
            dw_max_payload_transfer_size: MAX_PAYLOAD_TRANSFER_SIZE,
            dw_clock_frequency: CLOCK_FREQUENCY,
            bm_framing_info: 3,
            b_prefered_version: 1,
            b_min_version: 1,
            b_max_version: 1,
        };
        Negotiator { probe: defaults, commit: defaults, pending: None, defaults }
    }

    /// Drops any half-finished transfer and restores the default
    /// parameter blocks. Run on CONNECT and DISCONNECT.
    pub fn reset(&mut self) {
        self.probe = self.defaults;
        self.commit = self.defaults;
        self.pending = None;
    }

    /// The block STREAMON should configure the stream from. Defaults
    /// until the host completes a COMMIT.
    pub fn committed(&self) -> &StreamingControl {
        &self.commit
    }

    pub fn handle_setup(&mut self, pkt: &SetupPacket) -> RequestPayload {
        if pkt.xfer_type() != Some(XferType::Class) || pkt.recipient() != Some(Recip::Iface) {
            debug!("non-class setup request {:#04x}/{:#04x}, stalling", pkt.b_request_type, pkt.b_request);
            return RequestPayload::stall();
        }
        match pkt.interface() {
            CONTROL_INTERFACE => self.handle_control_interface(pkt),
            STREAMING_INTERFACE => self.handle_streaming_interface(pkt),
            other => {
                warn!("class request for unknown interface {}, stalling", other);
                RequestPayload::stall()
            }
        }
    }

    /// Camera terminal and processing unit controls. We claim GET/SET
    /// capability for everything and otherwise leave the data zeroed,
    /// enough to keep host enumeration happy.
    fn handle_control_interface(&self, pkt: &SetupPacket) -> RequestPayload {
        let length = (pkt.w_length as usize).min(RESPONSE_DATA_MAX) as i32;
        let mut resp = RequestPayload::empty(length);
        resp.data[0] = 0x03;
        resp
    }

    fn handle_streaming_interface(&mut self, pkt: &SetupPacket) -> RequestPayload {
        let selector: Option<StreamSelector> = num_traits::FromPrimitive::from_u8(pkt.control_selector());
        let selector = match selector {
            Some(s) => s,
            None => {
                warn!("unknown streaming control selector {:#04x}, stalling", pkt.control_selector());
                return RequestPayload::stall();
            }
        };
        let request: Option<UvcRequestCodes> = num_traits::FromPrimitive::from_u8(pkt.b_request);
        let block = match selector {
            StreamSelector::Probe => &self.probe,
            StreamSelector::Commit => &self.commit,
        };
        match request {
            Some(UvcRequestCodes::SetCur) => {
                debug!("SET_CUR({:?}): awaiting data phase", selector);
                self.pending = Some(selector);
                RequestPayload::empty(StreamingControl::SIZE as i32)
            }
            Some(UvcRequestCodes::GetCur) => RequestPayload::with_bytes(&block.to_bytes()),
            Some(UvcRequestCodes::GetMin) => {
                let mut min = self.defaults;
                min.dw_frame_interval = FRAME_INTERVAL_SLOWEST;
                RequestPayload::with_bytes(&min.to_bytes())
            }
            Some(UvcRequestCodes::GetMax) => {
                let mut max = self.defaults;
                max.dw_frame_interval = FRAME_INTERVAL_FASTEST;
                RequestPayload::with_bytes(&max.to_bytes())
            }
            Some(UvcRequestCodes::GetDef) => RequestPayload::with_bytes(&self.defaults.to_bytes()),
            Some(UvcRequestCodes::GetRes) => RequestPayload::with_bytes(&[0u8; StreamingControl::SIZE]),
            Some(UvcRequestCodes::GetLen) => {
                RequestPayload::with_bytes(&(StreamingControl::SIZE as u16).to_le_bytes())
            }
            Some(UvcRequestCodes::GetInfo) => RequestPayload::with_bytes(&[0x03]),
            Some(UvcRequestCodes::Undefined) | None => {
                warn!("unknown request {:#04x} for {:?}, stalling", pkt.b_request, selector);
                RequestPayload::stall()
            }
        }
    }

    /// Completes the data phase of a pending SET_CUR. Data with no
    /// pending transfer is a host protocol hiccup and is ignored.
    pub fn handle_data(&mut self, payload: &RequestPayload) -> NegotiationOutcome {
        match self.pending.take() {
            Some(StreamSelector::Probe) => {
                self.probe.apply_bytes(payload.payload());
                debug!("probe updated: format={} frame={} interval={} ({} fps)",
                       self.probe.b_format_index, self.probe.b_frame_index,
                       self.probe.dw_frame_interval, self.probe.fps());
                NegotiationOutcome::None
            }
            Some(StreamSelector::Commit) => {
                self.commit.apply_bytes(payload.payload());
                info!("host committed format={} frame={} interval={} ({} fps)",
                      self.commit.b_format_index, self.commit.b_frame_index,
                      self.commit.dw_frame_interval, self.commit.fps());
                NegotiationOutcome::Committed
            }
            None => {
                warn!("data phase with no pending SET_CUR, ignoring {} bytes", payload.payload().len());
                NegotiationOutcome::None
            }
        }
    }
}
