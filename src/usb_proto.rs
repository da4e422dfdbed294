// derived from /usr/include/linux/usb/ch9.h

use std::io::Write;

use anyhow::Error;

// 9.3 USB Device Requests
#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq)]
#[repr(u8)]
pub enum XferDir {
    ToDev = 0x00,
    ToHost = 0x80,
}
pub const USB_DIR_MASK: u8 = 0x1 << 7;

#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq)]
#[repr(u8)]
pub enum XferType {
    Std = 0x00,
    Class = 0x20,
    Vendor = 0x40,
    Reserved = 0x60,
}
pub const USB_XFER_TYPE_MASK: u8 = 0x03 << 5;

#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq)]
#[repr(u8)]
pub enum Recip {
    Dev = 0x00,
    Iface = 0x01,
    Ep = 0x02,
    Other = 0x03,
}
pub const USB_RECIP_MASK: u8 = 0x1f;

/// Decoded USB control setup packet, immutable once parsed from an
/// event. wValue and wIndex keep their raw layout; the accessors below
/// split out the UVC control selector and interface number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub b_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl SetupPacket {
    pub fn serialize(&self, mut buffer: impl Write) -> Result<(), Error> {
        let format = structure!("<BBHHH");
        format.pack_into(&mut buffer, self.b_request_type, self.b_request, self.w_value, self.w_index, self.w_length)?;
        Ok(())
    }

    pub fn deserialize(mut buffer: &mut &[u8]) -> Result<SetupPacket, Error> {
        let format = structure!("<BBHHH");
        let (b_request_type, b_request, w_value, w_index, w_length) = format.unpack_from(&mut buffer)?;
        Ok(SetupPacket { b_request_type, b_request, w_value, w_index, w_length })
    }

    pub fn size() -> usize {
        structure!("<BBHHH").size()
    }

    pub fn xfer_type(&self) -> Option<XferType> {
        num_traits::FromPrimitive::from_u8(self.b_request_type & USB_XFER_TYPE_MASK)
    }

    pub fn recipient(&self) -> Option<Recip> {
        num_traits::FromPrimitive::from_u8(self.b_request_type & USB_RECIP_MASK)
    }

    /// High byte of wValue selects the class-specific control.
    pub fn control_selector(&self) -> u8 {
        (self.w_value >> 8) as u8
    }

    /// Low byte of wValue addresses the channel within a control.
    pub fn channel(&self) -> u8 {
        (self.w_value & 0xff) as u8
    }

    /// Low byte of wIndex addresses the interface (or entity) the
    /// request is directed at.
    pub fn interface(&self) -> u8 {
        (self.w_index & 0xff) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_packet_round_trip() {
        let pkt = SetupPacket {
            b_request_type: 0xa1,
            b_request: 0x81,
            w_value: 0x0100,
            w_index: 0x0001,
            w_length: 34,
        };
        let mut buf = vec![];
        pkt.serialize(&mut buf).unwrap();
        assert_eq!(buf.len(), SetupPacket::size());

        let mut slice = &buf[..];
        let actual = SetupPacket::deserialize(&mut slice).unwrap();
        assert_eq!(actual, pkt);
    }

    #[test]
    fn setup_packet_field_extraction() {
        let pkt = SetupPacket {
            b_request_type: 0x21, // class request, interface recipient
            b_request: 0x01,
            w_value: 0x0200,
            w_index: 0x0001,
            w_length: 34,
        };
        assert_eq!(pkt.xfer_type(), Some(XferType::Class));
        assert_eq!(pkt.recipient(), Some(Recip::Iface));
        assert_eq!(pkt.control_selector(), 0x02);
        assert_eq!(pkt.channel(), 0x00);
        assert_eq!(pkt.interface(), 1);
    }

    #[test]
    fn setup_packet_standard_request_type() {
        let pkt = SetupPacket {
            b_request_type: 0x80,
            b_request: 0x06,
            w_value: 0x0100,
            w_index: 0,
            w_length: 18,
        };
        assert_eq!(pkt.xfer_type(), Some(XferType::Std));
        assert_eq!(pkt.recipient(), Some(Recip::Dev));
    }
}
