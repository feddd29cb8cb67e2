//! Wire-format packet value (§3, §4.A) and flag bitfield.

use crate::error::{DeviceIdError, PacketError};
use crate::util::{buf2hex, u16_le, u32_le, set_u16_le, set_u32_le};
use modular_bitfield::prelude::*;

pub const HEADER_SIZE: usize = 16;
pub const MAX_PAYLOAD_SIZE: usize = 236;
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;

pub const SERVICE_INDEX_CTRL: u8 = 0x00;
pub const SERVICE_INDEX_PIPE: u8 = 0x3e;
pub const SERVICE_INDEX_CRC_ACK: u8 = 0x3f;
const SERVICE_INDEX_MASK: u8 = 0x3f;
const SERVICE_INDEX_INV_MASK: u8 = 0xc0;

const CMD_GET_REG: u16 = 0x1000;
const CMD_SET_REG: u16 = 0x2000;
const CMD_EVENT_MASK: u16 = 0x8000;
const CMD_EVENT_CODE_MASK: u16 = 0xff;
const CMD_EVENT_COUNTER_MASK: u16 = 0x7f;
const CMD_EVENT_COUNTER_POS: u16 = 8;
const CMD_REG_MASK: u16 = 0x0fff;

/// `flags` byte of the header (offset 3).
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags {
    pub command: bool,
    pub ack_requested: bool,
    pub identifier_is_service_class: bool,
    #[skip]
    __: B5,
}

/// An 8-byte device identifier, displayed as lowercase hex (the same
/// representation the reference implementation's `device_identifier`
/// property returns).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub [u8; 8]);

impl DeviceId {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DeviceIdError> {
        if bytes.len() != 8 {
            return Err(DeviceIdError::WrongLength { len: bytes.len() });
        }
        let mut b = [0u8; 8];
        b.copy_from_slice(bytes);
        Ok(DeviceId(b))
    }

    pub fn hex(&self) -> String {
        buf2hex(&self.0)
    }

    pub fn short_id(&self, hash: impl Fn(&[u8]) -> u32) -> String {
        crate::util::short_id(hash(&self.0) & 0x3fff_ffff)
    }
}

impl std::fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceId({})", self.hex())
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl From<[u8; 8]> for DeviceId {
    fn from(b: [u8; 8]) -> Self {
        DeviceId(b)
    }
}

/// A parsed (or about-to-be-sent) bus frame: 16-byte header plus payload.
///
/// Construct with [`Packet::command`]/[`Packet::report`] for outgoing
/// traffic, or [`Packet::from_bytes`] for an inbound byte buffer split at
/// offset 16.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    header: [u8; HEADER_SIZE],
    payload: Vec<u8>,
}

impl Packet {
    fn new_raw(service_command: u16, payload: Vec<u8>) -> Result<Self, PacketError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(PacketError::Oversize {
                len: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let mut header = [0u8; HEADER_SIZE];
        header[2] = payload.len() as u8;
        header[12] = payload.len() as u8;
        set_u16_le(&mut header, 14, service_command);
        Ok(Packet { header, payload })
    }

    /// A report (non-command) packet, as sent by a server in response to a
    /// GET, or as an event/announce payload.
    pub fn report(service_command: u16, payload: Vec<u8>) -> Result<Self, PacketError> {
        Self::new_raw(service_command, payload)
    }

    /// A command packet (COMMAND flag set), as sent by a client.
    pub fn command(service_command: u16, payload: Vec<u8>) -> Result<Self, PacketError> {
        let mut pkt = Self::new_raw(service_command, payload)?;
        pkt.set_flags(Flags::new().with_command(true));
        Ok(pkt)
    }

    /// Pack little-endian fixed-width integers into a payload and build a
    /// report packet, mirroring `JDPacket.packed` / `util.pack` in the
    /// reference implementation. Only the widths actually used by this core
    /// are supported.
    pub fn packed_u32(service_command: u16, value: u32) -> Packet {
        let mut buf = vec![0u8; 4];
        set_u32_le(&mut buf, 0, value);
        Self::report(service_command, buf).expect("4 bytes always fits")
    }

    pub fn packed_u64(service_command: u16, value: u64) -> Packet {
        let buf = value.to_le_bytes().to_vec();
        Self::report(service_command, buf).expect("8 bytes always fits")
    }

    /// Parse a received frame. `bytes` must be the full frame (header +
    /// payload); `header[12]` is authoritative for payload length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_SIZE {
            return Err(PacketError::Malformed {
                have: bytes.len(),
                need: HEADER_SIZE,
            });
        }
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&bytes[..HEADER_SIZE]);
        let size = header[12] as usize;
        if bytes.len() < HEADER_SIZE + size {
            return Err(PacketError::Malformed {
                have: bytes.len(),
                need: HEADER_SIZE + size,
            });
        }
        let payload = bytes[HEADER_SIZE..HEADER_SIZE + size].to_vec();
        Ok(Packet { header, payload })
    }

    /// Serialize back to the wire representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) -> Result<(), PacketError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(PacketError::Oversize {
                len: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        self.header[2] = payload.len() as u8;
        self.header[12] = payload.len() as u8;
        self.payload = payload;
        Ok(())
    }

    pub fn size(&self) -> u8 {
        self.header[12]
    }

    pub fn crc(&self) -> u16 {
        u16_le(&self.header, 0)
    }

    /// Set by the physical layer on transmit (opaque to routing, used as the
    /// ACK correlator). The core never computes this itself.
    pub fn set_crc(&mut self, crc: u16) {
        set_u16_le(&mut self.header, 0, crc);
    }

    pub fn flags(&self) -> Flags {
        Flags::from_bytes([self.header[3]])
    }

    fn set_flags(&mut self, flags: Flags) {
        self.header[3] = flags.into_bytes()[0];
    }

    pub fn is_command(&self) -> bool {
        self.flags().command()
    }

    pub fn is_report(&self) -> bool {
        !self.is_command()
    }

    pub fn set_command(&mut self, val: bool) {
        let mut f = self.flags();
        f.set_command(val);
        self.set_flags(f);
    }

    pub fn requires_ack(&self) -> bool {
        self.flags().ack_requested()
    }

    pub fn set_requires_ack(&mut self, val: bool) {
        let mut f = self.flags();
        f.set_ack_requested(val);
        self.set_flags(f);
    }

    /// If the IDENTIFIER_IS_SERVICE_CLASS flag is set, the low 32 bits of the
    /// identifier field are a service class and this packet addresses every
    /// server of that class (a "multi-command").
    pub fn multicommand_class(&self) -> Option<u32> {
        if self.flags().identifier_is_service_class() {
            Some(u32_le(&self.header, 4))
        } else {
            None
        }
    }

    pub fn device_identifier(&self) -> DeviceId {
        DeviceId::from_bytes(&self.header[4..12]).expect("header slice is always 8 bytes")
    }

    pub fn set_device_identifier(&mut self, id: DeviceId) {
        self.header[4..12].copy_from_slice(&id.0);
        let mut f = self.flags();
        f.set_identifier_is_service_class(false);
        self.set_flags(f);
    }

    pub fn set_multicommand_class(&mut self, service_class: u32) {
        set_u32_le(&mut self.header, 4, service_class);
        self.header[8..12].fill(0);
        let mut f = self.flags();
        f.set_identifier_is_service_class(true);
        self.set_flags(f);
    }

    pub fn service_index(&self) -> u8 {
        self.header[13] & SERVICE_INDEX_MASK
    }

    pub fn set_service_index(&mut self, idx: u8) {
        self.header[13] = (self.header[13] & SERVICE_INDEX_INV_MASK) | (idx & SERVICE_INDEX_MASK);
    }

    pub fn service_command(&self) -> u16 {
        u16_le(&self.header, 14)
    }

    pub fn set_service_command(&mut self, cmd: u16) {
        set_u16_le(&mut self.header, 14, cmd);
    }

    pub fn is_reg_get(&self) -> bool {
        self.service_command() >> 12 == CMD_GET_REG >> 12
    }

    pub fn is_reg_set(&self) -> bool {
        self.service_command() >> 12 == CMD_SET_REG >> 12
    }

    pub fn reg_code(&self) -> u16 {
        self.service_command() & CMD_REG_MASK
    }

    pub fn is_event(&self) -> bool {
        self.is_report() && (self.service_command() & CMD_EVENT_MASK) != 0
    }

    pub fn event_code(&self) -> Option<u16> {
        self.is_event().then(|| self.service_command() & CMD_EVENT_CODE_MASK)
    }

    pub fn event_counter(&self) -> Option<u8> {
        self.is_event()
            .then(|| ((self.service_command() >> CMD_EVENT_COUNTER_POS) & CMD_EVENT_COUNTER_MASK) as u8)
    }

    /// Build the `service_command` for an event report: bit15 set, the given
    /// 7-bit counter in bits 8..15, the event code in bits 0..8.
    pub fn make_event_command(counter: u8, event_code: u8) -> u16 {
        CMD_EVENT_MASK | ((counter as u16 & CMD_EVENT_COUNTER_MASK) << CMD_EVENT_COUNTER_POS) | (event_code as u16)
    }

    pub fn make_get_reg_command(reg: u16) -> u16 {
        CMD_GET_REG | (reg & CMD_REG_MASK)
    }

    pub fn make_set_reg_command(reg: u16) -> u16 {
        CMD_SET_REG | (reg & CMD_REG_MASK)
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("device_identifier", &self.device_identifier())
            .field("service_index", &self.service_index())
            .field("flags", &self.flags())
            .field("service_command", &format_args!("{:#06x}", self.service_command()))
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_report() {
        let mut pkt = Packet::report(0x1101, vec![1, 2, 3]).unwrap();
        pkt.set_device_identifier(DeviceId([1, 2, 3, 4, 5, 6, 7, 8]));
        pkt.set_service_index(5);
        let bytes = pkt.to_bytes();
        let parsed = Packet::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.to_bytes(), bytes);
        assert_eq!(parsed.service_index(), 5);
        assert_eq!(parsed.payload(), &[1, 2, 3]);
    }

    #[test]
    fn oversize_payload_rejected() {
        let big = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert_eq!(
            Packet::report(0, big).unwrap_err(),
            PacketError::Oversize {
                len: MAX_PAYLOAD_SIZE + 1,
                max: MAX_PAYLOAD_SIZE
            }
        );
    }

    #[test]
    fn malformed_short_buffer_rejected() {
        assert!(Packet::from_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn command_flag_and_ack_flag() {
        let mut pkt = Packet::command(0x82, vec![]).unwrap();
        assert!(pkt.is_command());
        assert!(!pkt.requires_ack());
        pkt.set_requires_ack(true);
        assert!(pkt.requires_ack());
    }

    #[test]
    fn register_get_set_classification() {
        let get = Packet::report(Packet::make_get_reg_command(0x101), vec![]).unwrap();
        assert!(get.is_reg_get());
        assert!(!get.is_reg_set());
        assert_eq!(get.reg_code(), 0x101);

        let set = Packet::report(Packet::make_set_reg_command(0x80), vec![1]).unwrap();
        assert!(set.is_reg_set());
        assert!(!set.is_reg_get());
    }

    #[test]
    fn event_encoding_round_trips_counter_and_code() {
        let cmd = Packet::make_event_command(42, 7);
        let pkt = Packet::report(cmd, vec![]).unwrap();
        assert!(pkt.is_event());
        assert_eq!(pkt.event_counter(), Some(42));
        assert_eq!(pkt.event_code(), Some(7));
    }

    #[test]
    fn multicommand_class_round_trips() {
        let mut pkt = Packet::command(0, vec![]).unwrap();
        pkt.set_multicommand_class(0x1f14_0409);
        assert_eq!(pkt.multicommand_class(), Some(0x1f14_0409));
        assert_eq!(&pkt.to_bytes()[8..12], &[0, 0, 0, 0]);
    }

    #[test]
    fn device_id_hex_display() {
        let id = DeviceId([0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        assert_eq!(id.hex(), "0102030405060708");
    }
}
