// NHRP packet model and wire codec.
//
// The PDU is laid out as the 28-byte fixed + mandatory header, the source
// NBMA address and subaddress, the source and destination protocol
// addresses, the raw payload, and finally a chain of typed extensions closed
// by a compulsory end marker:
//
//   +------------------------+
//   | header (28 bytes)      |  packet size / extension offset back-patched
//   +------------------------+
//   | src nbma addr, subaddr |
//   | src protocol addr      |
//   | dst protocol addr      |
//   | payload (slot 0)       |
//   +------------------------+ <- extension offset
//   | type|C  | length       |  one per populated slot 1.., length back-patched
//   | content ...            |
//   +------------------------+
//   | 0x8000  | 0            |  end marker
//   +------------------------+

use std::fmt::Write as _;
use std::ops::Range;

use crate::address::{Address, AddressFamily};
use crate::error::NhrpError;

/// A multi-byte field at a fixed offset in the header.
type Field = Range<usize>;

const AFNUM: Field = 0..2;
const PROTOCOL_TYPE: Field = 2..4;
const SNAP: Field = 4..9;
const HOP_COUNT: usize = 9;
const PACKET_SIZE: Field = 10..12;
const CHECKSUM: Field = 12..14;
const EXTENSION_OFFSET: Field = 14..16;
const VERSION: usize = 16;
const PACKET_TYPE: usize = 17;
const SRC_NBMA_ADDRESS_LEN: usize = 18;
const SRC_NBMA_SUBADDRESS_LEN: usize = 19;
const SRC_PROTOCOL_ADDRESS_LEN: usize = 20;
const DST_PROTOCOL_ADDRESS_LEN: usize = 21;
const FLAGS: Field = 22..24;
const REQUEST_ID: Field = 24..28;

pub const HEADER_LEN: usize = REQUEST_ID.end;
pub const EXTENSION_HEADER_LEN: usize = 4;

/// Largest PDU handed to the transmit path.
pub const MAX_PDU_SIZE: usize = 1500;

pub const NHRP_VERSION_RFC2332: u8 = 1;

pub const NHRP_PACKET_RESOLUTION_REQUEST: u8 = 1;
pub const NHRP_PACKET_RESOLUTION_REPLY: u8 = 2;
pub const NHRP_PACKET_REGISTRATION_REQUEST: u8 = 3;
pub const NHRP_PACKET_REGISTRATION_REPLY: u8 = 4;
pub const NHRP_PACKET_PURGE_REQUEST: u8 = 5;
pub const NHRP_PACKET_PURGE_REPLY: u8 = 6;
pub const NHRP_PACKET_ERROR_INDICATION: u8 = 7;

/// Slot 0 carries the packet payload; it is never emitted as an extension.
pub const NHRP_EXTENSION_PAYLOAD: usize = 0;
pub const NHRP_EXTENSION_END: u16 = 0;
pub const NHRP_EXTENSION_RESPONDER_ADDRESS: usize = 3;
pub const NHRP_EXTENSION_FORWARD_TRANSIT_NHS: usize = 4;
pub const NHRP_EXTENSION_REVERSE_TRANSIT_NHS: usize = 5;
pub const NHRP_EXTENSION_AUTHENTICATION: usize = 7;
pub const NHRP_EXTENSION_VENDOR: usize = 8;
pub const NHRP_EXTENSION_NAT_ADDRESS: usize = 9;
pub const NHRP_NUM_EXTENSIONS: usize = 10;

pub const NHRP_EXTENSION_FLAG_COMPULSORY: u16 = 0x8000;

// ---------------------------------------------------------------------------
// Packet model
// ---------------------------------------------------------------------------

/// Caller-populated header fields. Lengths, offsets and the checksum are
/// derived during encoding and are not part of this struct.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketHeader {
    pub afnum: u16,
    pub protocol_type: u16,
    pub snap: [u8; 5],
    pub hop_count: u8,
    pub version: u8,
    pub packet_type: u8,
    pub flags: u16,
    pub request_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Payload {
    #[default]
    None,
    Raw(Vec<u8>),
}

impl Payload {
    pub fn is_none(&self) -> bool {
        matches!(self, Payload::None)
    }

    fn bytes(&self) -> &[u8] {
        match self {
            Payload::None => &[],
            Payload::Raw(data) => data,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extension {
    pub compulsory: bool,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub src_nbma_address: Address,
    pub src_protocol_address: Address,
    pub dst_protocol_address: Address,
    pub extensions: [Extension; NHRP_NUM_EXTENSIONS],
}

impl Default for Packet {
    fn default() -> Self {
        Self {
            header: PacketHeader {
                version: NHRP_VERSION_RFC2332,
                ..Default::default()
            },
            src_nbma_address: Address::none(AddressFamily::Nbma),
            src_protocol_address: Address::none(AddressFamily::Protocol),
            dst_protocol_address: Address::none(AddressFamily::Protocol),
            extensions: Default::default(),
        }
    }
}

impl Packet {
    pub fn set_payload(&mut self, data: Vec<u8>) {
        self.extensions[NHRP_EXTENSION_PAYLOAD] = Extension {
            compulsory: false,
            payload: Payload::Raw(data),
        };
    }

    /// Populate extension slot `index` (1..NHRP_NUM_EXTENSIONS).
    pub fn set_extension(
        &mut self,
        index: usize,
        compulsory: bool,
        payload: Payload,
    ) -> Result<(), NhrpError> {
        if index == NHRP_EXTENSION_PAYLOAD || index >= NHRP_NUM_EXTENSIONS {
            return Err(NhrpError::InvalidExtension(index));
        }
        self.extensions[index] = Extension {
            compulsory,
            payload,
        };
        Ok(())
    }

    /// Serialize into `buf`, returning the number of bytes written.
    ///
    /// On error the contents of `buf` are unspecified.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, NhrpError> {
        let mut w = PduWriter::new(buf);

        w.put(&self.header_bytes())?;
        w.put(self.src_nbma_address.addr())?;
        w.put(self.src_nbma_address.subaddr())?;
        w.put(self.src_protocol_address.addr())?;
        w.put(self.dst_protocol_address.addr())?;
        w.put(self.extensions[NHRP_EXTENSION_PAYLOAD].payload.bytes())?;

        let extension_offset = wire_u16(w.position())?;

        for (index, ext) in self.extensions.iter().enumerate().skip(1) {
            if ext.payload.is_none() {
                continue;
            }
            let mut ext_type = index as u16;
            if ext.compulsory {
                ext_type |= NHRP_EXTENSION_FLAG_COMPULSORY;
            }
            let ext_header = w.position();
            w.put_u16(ext_type)?;
            w.put_u16(0)?;
            w.put(ext.payload.bytes())?;
            let content_len = w.position() - ext_header - EXTENSION_HEADER_LEN;
            w.patch_u16(ext_header + 2, wire_u16(content_len)?);
        }

        w.put_u16(NHRP_EXTENSION_END | NHRP_EXTENSION_FLAG_COMPULSORY)?;
        w.put_u16(0)?;

        let size = w.position();
        let mut hdr = HeaderBuffer::new(w.into_inner());
        hdr.set_packet_size(wire_u16(size)?);
        hdr.set_extension_offset(extension_offset);
        hdr.set_checksum(0);
        hdr.set_src_nbma_address_len(self.src_nbma_address.addr_len());
        hdr.set_src_nbma_subaddress_len(self.src_nbma_address.subaddr_len());
        hdr.set_src_protocol_address_len(self.src_protocol_address.addr_len());
        hdr.set_dst_protocol_address_len(self.dst_protocol_address.addr_len());

        Ok(size)
    }

    /// Encode into a `MAX_PDU_SIZE` scratch buffer and return the PDU bytes.
    pub fn to_pdu(&self) -> Result<Vec<u8>, NhrpError> {
        let mut pdu = vec![0u8; MAX_PDU_SIZE];
        let size = self.encode(&mut pdu)?;
        pdu.truncate(size);
        if log::log_enabled!(log::Level::Trace) {
            log::trace!("{}", hex_dump("packet", &pdu));
        }
        Ok(pdu)
    }

    /// Fixed header with length, offset and checksum fields zeroed.
    fn header_bytes(&self) -> [u8; HEADER_LEN] {
        let mut raw = [0u8; HEADER_LEN];
        let mut hdr = HeaderBuffer::new(&mut raw[..]);
        hdr.set_afnum(self.header.afnum);
        hdr.set_protocol_type(self.header.protocol_type);
        hdr.set_snap(&self.header.snap);
        hdr.set_hop_count(self.header.hop_count);
        hdr.set_version(self.header.version);
        hdr.set_packet_type(self.header.packet_type);
        hdr.set_flags(self.header.flags);
        hdr.set_request_id(self.header.request_id);
        raw
    }
}

/// Receive-side decoding.
///
/// Parsing of received PDUs is not implemented: this always reports that no
/// packet is available.
pub fn decode(_pdu: &[u8]) -> Option<Packet> {
    None
}

fn wire_u16(value: usize) -> Result<u16, NhrpError> {
    u16::try_from(value).map_err(|_| NhrpError::PacketTooLarge(value))
}

// ---------------------------------------------------------------------------
// Cursor writer
// ---------------------------------------------------------------------------

/// Bounded write cursor over a caller-provided buffer.
pub struct PduWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> PduWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn put(&mut self, data: &[u8]) -> Result<(), NhrpError> {
        if data.len() > self.remaining() {
            return Err(NhrpError::BufferTooSmall {
                needed: self.pos + data.len(),
                available: self.buf.len(),
            });
        }
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
        Ok(())
    }

    pub fn put_u16(&mut self, value: u16) -> Result<(), NhrpError> {
        self.put(&value.to_be_bytes())
    }

    /// Overwrite a big-endian u16 at an offset that was already written.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 2` lies beyond the current position.
    pub fn patch_u16(&mut self, offset: usize, value: u16) {
        assert!(offset + 2 <= self.pos, "patch beyond written data");
        self.buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    /// The written prefix of the buffer.
    pub fn into_inner(self) -> &'a mut [u8] {
        let pos = self.pos;
        let buf = self.buf;
        &mut buf[..pos]
    }
}

// ---------------------------------------------------------------------------
// Header view
// ---------------------------------------------------------------------------

/// Typed access to the NHRP header at the start of a PDU buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderBuffer<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> HeaderBuffer<T> {
    pub fn new(buffer: T) -> Self {
        Self { buffer }
    }

    pub fn new_checked(buffer: T) -> Result<Self, NhrpError> {
        let len = buffer.as_ref().len();
        if len < HEADER_LEN {
            return Err(NhrpError::BufferTooSmall {
                needed: HEADER_LEN,
                available: len,
            });
        }
        Ok(Self::new(buffer))
    }

    fn u16_at(&self, field: Field) -> u16 {
        let data = self.buffer.as_ref();
        u16::from_be_bytes([data[field.start], data[field.start + 1]])
    }

    pub fn afnum(&self) -> u16 {
        self.u16_at(AFNUM)
    }

    pub fn protocol_type(&self) -> u16 {
        self.u16_at(PROTOCOL_TYPE)
    }

    pub fn snap(&self) -> &[u8] {
        &self.buffer.as_ref()[SNAP]
    }

    pub fn hop_count(&self) -> u8 {
        self.buffer.as_ref()[HOP_COUNT]
    }

    pub fn packet_size(&self) -> u16 {
        self.u16_at(PACKET_SIZE)
    }

    pub fn checksum(&self) -> u16 {
        self.u16_at(CHECKSUM)
    }

    pub fn extension_offset(&self) -> u16 {
        self.u16_at(EXTENSION_OFFSET)
    }

    pub fn version(&self) -> u8 {
        self.buffer.as_ref()[VERSION]
    }

    pub fn packet_type(&self) -> u8 {
        self.buffer.as_ref()[PACKET_TYPE]
    }

    pub fn src_nbma_address_len(&self) -> u8 {
        self.buffer.as_ref()[SRC_NBMA_ADDRESS_LEN]
    }

    pub fn src_nbma_subaddress_len(&self) -> u8 {
        self.buffer.as_ref()[SRC_NBMA_SUBADDRESS_LEN]
    }

    pub fn src_protocol_address_len(&self) -> u8 {
        self.buffer.as_ref()[SRC_PROTOCOL_ADDRESS_LEN]
    }

    pub fn dst_protocol_address_len(&self) -> u8 {
        self.buffer.as_ref()[DST_PROTOCOL_ADDRESS_LEN]
    }

    pub fn flags(&self) -> u16 {
        self.u16_at(FLAGS)
    }

    pub fn request_id(&self) -> u32 {
        let data = &self.buffer.as_ref()[REQUEST_ID];
        u32::from_be_bytes([data[0], data[1], data[2], data[3]])
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> HeaderBuffer<T> {
    fn set_u16_at(&mut self, field: Field, value: u16) {
        self.buffer.as_mut()[field].copy_from_slice(&value.to_be_bytes());
    }

    pub fn set_afnum(&mut self, value: u16) {
        self.set_u16_at(AFNUM, value)
    }

    pub fn set_protocol_type(&mut self, value: u16) {
        self.set_u16_at(PROTOCOL_TYPE, value)
    }

    pub fn set_snap(&mut self, value: &[u8; 5]) {
        self.buffer.as_mut()[SNAP].copy_from_slice(value)
    }

    pub fn set_hop_count(&mut self, value: u8) {
        self.buffer.as_mut()[HOP_COUNT] = value
    }

    pub fn set_packet_size(&mut self, value: u16) {
        self.set_u16_at(PACKET_SIZE, value)
    }

    pub fn set_checksum(&mut self, value: u16) {
        self.set_u16_at(CHECKSUM, value)
    }

    pub fn set_extension_offset(&mut self, value: u16) {
        self.set_u16_at(EXTENSION_OFFSET, value)
    }

    pub fn set_version(&mut self, value: u8) {
        self.buffer.as_mut()[VERSION] = value
    }

    pub fn set_packet_type(&mut self, value: u8) {
        self.buffer.as_mut()[PACKET_TYPE] = value
    }

    pub fn set_src_nbma_address_len(&mut self, value: u8) {
        self.buffer.as_mut()[SRC_NBMA_ADDRESS_LEN] = value
    }

    pub fn set_src_nbma_subaddress_len(&mut self, value: u8) {
        self.buffer.as_mut()[SRC_NBMA_SUBADDRESS_LEN] = value
    }

    pub fn set_src_protocol_address_len(&mut self, value: u8) {
        self.buffer.as_mut()[SRC_PROTOCOL_ADDRESS_LEN] = value
    }

    pub fn set_dst_protocol_address_len(&mut self, value: u8) {
        self.buffer.as_mut()[DST_PROTOCOL_ADDRESS_LEN] = value
    }

    pub fn set_flags(&mut self, value: u16) {
        self.set_u16_at(FLAGS, value)
    }

    pub fn set_request_id(&mut self, value: u32) {
        self.buffer.as_mut()[REQUEST_ID].copy_from_slice(&value.to_be_bytes())
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Classic 16-bytes-per-row hex dump with a printable-ASCII column.
pub fn hex_dump(name: &str, buf: &[u8]) -> String {
    let mut out = format!("{name}:\n");
    for row in buf.chunks(16) {
        for b in row {
            let _ = write!(out, "{b:02X} ");
        }
        let pad = 3 * (16 - row.len());
        let _ = write!(out, "{:pad$}    ", "", pad = pad);
        for &b in row {
            out.push(if b.is_ascii_graphic() { b as char } else { '.' });
        }
        out.push('\n');
    }
    out
}
