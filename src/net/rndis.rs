//! RNDIS control messages and data packets
//!
//! [`Rndis`] answers the host's control messages. It holds one response at a
//! time; the host fetches it with GET_ENCAPSULATED_RESPONSE after the device
//! signals RESPONSE_AVAILABLE. Data packets travel on the bulk endpoints,
//! each frame behind a [`PACKET_HEADER_LEN`]-byte header. See
//! [`write_packet_header()`] and [`parse_packet()`].
//!
//! All fields are little endian.

use super::{get_u32, put_u32, FrameError};
use crate::config::NetConfig;

/// Message types
pub mod msg {
    pub const PACKET: u32 = 0x0000_0001;
    pub const INITIALIZE: u32 = 0x0000_0002;
    pub const HALT: u32 = 0x0000_0003;
    pub const QUERY: u32 = 0x0000_0004;
    pub const SET: u32 = 0x0000_0005;
    pub const RESET: u32 = 0x0000_0006;
    pub const INDICATE_STATUS: u32 = 0x0000_0007;
    pub const KEEPALIVE: u32 = 0x0000_0008;

    /// Completions set the high bit of the request's type.
    pub const COMPLETION: u32 = 0x8000_0000;
    pub const INITIALIZE_CMPLT: u32 = INITIALIZE | COMPLETION;
    pub const QUERY_CMPLT: u32 = QUERY | COMPLETION;
    pub const SET_CMPLT: u32 = SET | COMPLETION;
    pub const RESET_CMPLT: u32 = RESET | COMPLETION;
    pub const KEEPALIVE_CMPLT: u32 = KEEPALIVE | COMPLETION;
}

/// Status codes
pub mod status {
    pub const SUCCESS: u32 = 0x0000_0000;
    pub const FAILURE: u32 = 0xC000_0001;
    pub const INVALID_DATA: u32 = 0xC001_0015;
    pub const NOT_SUPPORTED: u32 = 0xC000_00BB;
    pub const MEDIA_CONNECT: u32 = 0x4001_000B;
    pub const MEDIA_DISCONNECT: u32 = 0x4001_000C;
}

/// Object identifiers
pub mod oid {
    pub const GEN_SUPPORTED_LIST: u32 = 0x0001_0101;
    pub const GEN_HARDWARE_STATUS: u32 = 0x0001_0102;
    pub const GEN_MEDIA_SUPPORTED: u32 = 0x0001_0103;
    pub const GEN_MEDIA_IN_USE: u32 = 0x0001_0104;
    pub const GEN_MAXIMUM_FRAME_SIZE: u32 = 0x0001_0106;
    pub const GEN_LINK_SPEED: u32 = 0x0001_0107;
    pub const GEN_TRANSMIT_BLOCK_SIZE: u32 = 0x0001_010A;
    pub const GEN_RECEIVE_BLOCK_SIZE: u32 = 0x0001_010B;
    pub const GEN_VENDOR_ID: u32 = 0x0001_010C;
    pub const GEN_VENDOR_DESCRIPTION: u32 = 0x0001_010D;
    pub const GEN_CURRENT_PACKET_FILTER: u32 = 0x0001_010E;
    pub const GEN_CURRENT_LOOKAHEAD: u32 = 0x0001_010F;
    pub const GEN_MAXIMUM_TOTAL_SIZE: u32 = 0x0001_0111;
    pub const GEN_PROTOCOL_OPTIONS: u32 = 0x0001_0112;
    pub const GEN_MAC_OPTIONS: u32 = 0x0001_0113;
    pub const GEN_MEDIA_CONNECT_STATUS: u32 = 0x0001_0114;
    pub const GEN_VENDOR_DRIVER_VERSION: u32 = 0x0001_0116;
    pub const GEN_PHYSICAL_MEDIUM: u32 = 0x0001_0202;
    pub const GEN_RNDIS_CONFIG_PARAMETER: u32 = 0x0001_021B;

    pub const GEN_XMIT_OK: u32 = 0x0002_0101;
    pub const GEN_RCV_OK: u32 = 0x0002_0102;
    pub const GEN_XMIT_ERROR: u32 = 0x0002_0103;
    pub const GEN_RCV_ERROR: u32 = 0x0002_0104;
    pub const GEN_RCV_NO_BUFFER: u32 = 0x0002_0105;

    pub const IEEE_802_3_PERMANENT_ADDRESS: u32 = 0x0101_0101;
    pub const IEEE_802_3_CURRENT_ADDRESS: u32 = 0x0101_0102;
    pub const IEEE_802_3_MULTICAST_LIST: u32 = 0x0101_0103;
    pub const IEEE_802_3_MAXIMUM_LIST_SIZE: u32 = 0x0101_0104;
    pub const IEEE_802_3_MAC_OPTIONS: u32 = 0x0101_0105;
    pub const IEEE_802_3_RCV_ERROR_ALIGNMENT: u32 = 0x0102_0101;
    pub const IEEE_802_3_XMIT_ONE_COLLISION: u32 = 0x0102_0102;
    pub const IEEE_802_3_XMIT_MORE_COLLISIONS: u32 = 0x0102_0103;

    pub const PNP_ADD_WAKE_UP_PATTERN: u32 = 0xFD01_0103;
    pub const PNP_REMOVE_WAKE_UP_PATTERN: u32 = 0xFD01_0104;
    pub const PNP_ENABLE_WAKE_UP: u32 = 0xFD01_0106;
}

/// Answered by OID_GEN_SUPPORTED_LIST
const SUPPORTED_OIDS: [u32; 21] = [
    oid::GEN_SUPPORTED_LIST,
    oid::GEN_HARDWARE_STATUS,
    oid::GEN_MEDIA_SUPPORTED,
    oid::GEN_MEDIA_IN_USE,
    oid::GEN_MAXIMUM_FRAME_SIZE,
    oid::GEN_LINK_SPEED,
    oid::GEN_TRANSMIT_BLOCK_SIZE,
    oid::GEN_RECEIVE_BLOCK_SIZE,
    oid::GEN_VENDOR_ID,
    oid::GEN_VENDOR_DESCRIPTION,
    oid::GEN_VENDOR_DRIVER_VERSION,
    oid::GEN_CURRENT_PACKET_FILTER,
    oid::GEN_MAXIMUM_TOTAL_SIZE,
    oid::GEN_PROTOCOL_OPTIONS,
    oid::GEN_MAC_OPTIONS,
    oid::GEN_MEDIA_CONNECT_STATUS,
    oid::IEEE_802_3_PERMANENT_ADDRESS,
    oid::IEEE_802_3_CURRENT_ADDRESS,
    oid::IEEE_802_3_MULTICAST_LIST,
    oid::IEEE_802_3_MAXIMUM_LIST_SIZE,
    oid::IEEE_802_3_MAC_OPTIONS,
];

const MAJOR_VERSION: u32 = 1;
const MINOR_VERSION: u32 = 0;
/// RNDIS_DF_CONNECTIONLESS
const DEVICE_FLAGS: u32 = 0x0000_0001;
/// NdisMedium802_3
const MEDIUM_802_3: u32 = 0;
const MEDIA_STATE_CONNECTED: u32 = 0;
const MEDIA_STATE_DISCONNECTED: u32 = 1;
const VENDOR_ID: u32 = 0x00FF_FFFF;
const VENDOR_DRIVER_VERSION: u32 = 0x0000_1000;
const ETHERNET_HEADER_LEN: u32 = 14;

/// The common type, length, and request ID words
const HEADER_LEN: usize = 12;
const INITIALIZE_LEN: usize = 24;
const INITIALIZE_CMPLT_LEN: usize = 52;
/// QUERY and SET share a layout
const OID_REQUEST_LEN: usize = 28;
const QUERY_CMPLT_LEN: usize = 24;
const SET_CMPLT_LEN: usize = 16;
const RESET_CMPLT_LEN: usize = 16;
const KEEPALIVE_CMPLT_LEN: usize = 16;
const INDICATE_STATUS_LEN: usize = 20;
/// Information buffer offsets count from the request ID.
const INFORMATION_BASE: usize = 8;

/// Size of the response slot
///
/// Large enough for the supported-OID list. Longer vendor descriptions are
/// truncated.
pub const RESPONSE_LEN: usize = QUERY_CMPLT_LEN + SUPPORTED_OIDS.len() * 4 + 20;

/// Size of the header in front of every data packet
pub const PACKET_HEADER_LEN: usize = 44;
/// Data offsets count from this byte.
const PACKET_DATA_BASE: usize = 8;

bitflags::bitflags! {
    /// NDIS packet filter
    ///
    /// Any non-empty filter enables data traffic.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PacketFilter: u32 {
        const DIRECTED = 0x0000_0001;
        const MULTICAST = 0x0000_0002;
        const ALL_MULTICAST = 0x0000_0004;
        const BROADCAST = 0x0000_0008;
        const SOURCE_ROUTING = 0x0000_0010;
        const PROMISCUOUS = 0x0000_0020;
        const SMT = 0x0000_0040;
        const ALL_LOCAL = 0x0000_0080;
        const GROUP = 0x0000_1000;
        const ALL_FUNCTIONAL = 0x0000_2000;
        const FUNCTIONAL = 0x0000_4000;
        const MAC_FRAME = 0x0000_8000;
    }
}

/// Where the host is in the RNDIS session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum SessionState {
    /// Before INITIALIZE, or after HALT or RESET.
    Uninitialized,
    /// Initialized, with an empty packet filter.
    Initialized,
    /// Data traffic is permitted.
    DataInitialized,
}

/// A validated control message from the host
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Message<'a> {
    Initialize {
        request_id: u32,
        major_version: u32,
        minor_version: u32,
        max_transfer_size: u32,
    },
    Halt,
    Query {
        request_id: u32,
        oid: u32,
        information: &'a [u8],
    },
    Set {
        request_id: u32,
        oid: u32,
        information: &'a [u8],
    },
    Reset,
    KeepAlive {
        request_id: u32,
    },
}

impl<'a> Message<'a> {
    /// Validate and decode a control message
    ///
    /// The message length field must cover the fixed fields of the message
    /// type, and can't exceed `raw`. Unknown message types are
    /// [`FrameError::Signature`].
    pub fn parse(raw: &'a [u8]) -> Result<Self, FrameError> {
        let kind = get_u32(raw, 0).ok_or(FrameError::Truncated)?;
        let len = get_u32(raw, 4).ok_or(FrameError::Truncated)? as usize;
        if len > raw.len() {
            return Err(FrameError::Truncated);
        }
        let raw = &raw[..len];
        let min_len = match kind {
            msg::INITIALIZE => INITIALIZE_LEN,
            msg::QUERY | msg::SET => OID_REQUEST_LEN,
            msg::HALT | msg::RESET | msg::KEEPALIVE => HEADER_LEN,
            _ => return Err(FrameError::Signature),
        };
        if len < min_len {
            return Err(FrameError::Truncated);
        }
        // Checked above
        let word = |at| get_u32(raw, at).unwrap_or(0);
        let request_id = word(8);

        Ok(match kind {
            msg::INITIALIZE => Message::Initialize {
                request_id,
                major_version: word(12),
                minor_version: word(16),
                max_transfer_size: word(20),
            },
            msg::QUERY | msg::SET => {
                let oid = word(12);
                let info_len = word(16) as usize;
                let information = if info_len == 0 {
                    &[][..]
                } else {
                    let start = INFORMATION_BASE
                        .checked_add(word(20) as usize)
                        .ok_or(FrameError::Bounds)?;
                    let end = start.checked_add(info_len).ok_or(FrameError::Bounds)?;
                    raw.get(start..end).ok_or(FrameError::Bounds)?
                };
                if kind == msg::QUERY {
                    Message::Query {
                        request_id,
                        oid,
                        information,
                    }
                } else {
                    Message::Set {
                        request_id,
                        oid,
                        information,
                    }
                }
            }
            msg::HALT => Message::Halt,
            msg::RESET => Message::Reset,
            _ => Message::KeepAlive { request_id },
        })
    }
}

/// Traffic counters, reported through the statistics OIDs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    pub tx_ok: u32,
    pub tx_error: u32,
    pub rx_ok: u32,
    pub rx_error: u32,
}

/// The RNDIS control message handler
pub struct Rndis {
    net: NetConfig,
    state: SessionState,
    packet_filter: PacketFilter,
    link_up: bool,
    response: [u8; RESPONSE_LEN],
    response_len: usize,
}

impl Rndis {
    /// Create a handler for a device described by `net`
    ///
    /// The link starts up.
    pub const fn new(net: NetConfig) -> Self {
        Rndis {
            net,
            state: SessionState::Uninitialized,
            packet_filter: PacketFilter::empty(),
            link_up: true,
            response: [0; RESPONSE_LEN],
            response_len: 0,
        }
    }

    /// The session state that the host drove us to
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The packet filter that the host set
    pub fn packet_filter(&self) -> PacketFilter {
        self.packet_filter
    }

    /// Indicates if the host permits data packets
    pub fn is_data_initialized(&self) -> bool {
        self.state == SessionState::DataInitialized
    }

    /// Indicates if the last reported media state is connected
    pub fn is_link_up(&self) -> bool {
        self.link_up
    }

    /// Return to the uninitialized state, and drop any response
    pub fn reset(&mut self) {
        self.state = SessionState::Uninitialized;
        self.packet_filter = PacketFilter::empty();
        self.response_len = 0;
    }

    /// The pending response, if any
    pub fn response(&self) -> Option<&[u8]> {
        (self.response_len > 0).then(|| &self.response[..self.response_len])
    }

    /// Drop the pending response, after the host read it
    pub fn clear_response(&mut self) {
        self.response_len = 0;
    }

    /// Handle a control message from SEND_ENCAPSULATED_COMMAND
    ///
    /// Returns `true` if the message queued a response. A new response
    /// replaces one that the host hasn't read. Malformed and unknown messages
    /// are ignored.
    pub fn handle(&mut self, raw: &[u8], statistics: &Statistics) -> bool {
        let message = match Message::parse(raw) {
            Ok(message) => message,
            Err(_) => {
                debug!("RNDIS ignored message 0x{:x}", get_u32(raw, 0).unwrap_or(0));
                return false;
            }
        };
        match message {
            Message::Initialize {
                request_id,
                major_version,
                minor_version,
                ..
            } => {
                debug!("RNDIS INITIALIZE {}.{}", major_version, minor_version);
                self.state = SessionState::Initialized;
                self.initialize_complete(request_id);
            }
            Message::Halt => {
                debug!("RNDIS HALT");
                self.reset();
                return false;
            }
            Message::Query {
                request_id, oid, ..
            } => self.query(request_id, oid, statistics),
            Message::Set {
                request_id,
                oid,
                information,
            } => {
                let status = self.set(oid, information);
                self.begin(msg::SET_CMPLT, SET_CMPLT_LEN);
                put_u32(&mut self.response, 8, request_id);
                put_u32(&mut self.response, 12, status);
            }
            Message::Reset => {
                debug!("RNDIS RESET");
                self.state = SessionState::Uninitialized;
                self.packet_filter = PacketFilter::empty();
                self.begin(msg::RESET_CMPLT, RESET_CMPLT_LEN);
                put_u32(&mut self.response, 8, status::SUCCESS);
                // AddressingReset
                put_u32(&mut self.response, 12, 1);
            }
            Message::KeepAlive { request_id } => {
                self.begin(msg::KEEPALIVE_CMPLT, KEEPALIVE_CMPLT_LEN);
                put_u32(&mut self.response, 8, request_id);
                put_u32(&mut self.response, 12, status::SUCCESS);
            }
        }
        true
    }

    /// Change the link state
    ///
    /// Returns `true` if this queued an INDICATE_STATUS message. Nothing is
    /// queued while the session is uninitialized.
    pub fn set_link(&mut self, up: bool) -> bool {
        if self.link_up == up {
            return false;
        }
        self.link_up = up;
        if self.state == SessionState::Uninitialized {
            return false;
        }
        self.begin(msg::INDICATE_STATUS, INDICATE_STATUS_LEN);
        let code = if up {
            status::MEDIA_CONNECT
        } else {
            status::MEDIA_DISCONNECT
        };
        put_u32(&mut self.response, 8, code);
        put_u32(&mut self.response, 12, 0);
        put_u32(&mut self.response, 16, 0);
        true
    }

    /// Largest data packet message, header included
    fn max_transfer_size(&self) -> u32 {
        self.net.mtu as u32 + PACKET_HEADER_LEN as u32
    }

    /// Start a response of `kind`, `len` bytes long
    fn begin(&mut self, kind: u32, len: usize) {
        put_u32(&mut self.response, 0, kind);
        put_u32(&mut self.response, 4, len as u32);
        self.response_len = len;
    }

    fn initialize_complete(&mut self, request_id: u32) {
        let max_transfer_size = self.max_transfer_size();
        self.begin(msg::INITIALIZE_CMPLT, INITIALIZE_CMPLT_LEN);
        let fields = [
            request_id,
            status::SUCCESS,
            MAJOR_VERSION,
            MINOR_VERSION,
            DEVICE_FLAGS,
            MEDIUM_802_3,
            // Max packets per transfer
            1,
            max_transfer_size,
            // Packet alignment factor
            0,
            // AF list offset and size
            0,
            0,
        ];
        for (index, field) in fields.iter().enumerate() {
            put_u32(&mut self.response, 8 + 4 * index, *field);
        }
    }

    /// Queue a QUERY_CMPLT with `parts` as the information buffer
    fn query_complete(&mut self, request_id: u32, status: u32, parts: &[&[u8]]) {
        let mut len = QUERY_CMPLT_LEN;
        for part in parts {
            let count = part.len().min(RESPONSE_LEN - len);
            self.response[len..len + count].copy_from_slice(&part[..count]);
            len += count;
        }
        let info_len = len - QUERY_CMPLT_LEN;
        self.begin(msg::QUERY_CMPLT, len);
        put_u32(&mut self.response, 8, request_id);
        put_u32(&mut self.response, 12, status);
        put_u32(&mut self.response, 16, info_len as u32);
        let offset = if info_len == 0 {
            0
        } else {
            QUERY_CMPLT_LEN - INFORMATION_BASE
        };
        put_u32(&mut self.response, 20, offset as u32);
    }

    fn query(&mut self, request_id: u32, oid: u32, statistics: &Statistics) {
        trace!("RNDIS QUERY 0x{:x}", oid);
        let mtu = self.net.mtu as u32;
        let value = match oid {
            oid::GEN_SUPPORTED_LIST => {
                let mut list = [0u8; SUPPORTED_OIDS.len() * 4];
                for (chunk, oid) in list.chunks_exact_mut(4).zip(SUPPORTED_OIDS) {
                    chunk.copy_from_slice(&oid.to_le_bytes());
                }
                return self.query_complete(request_id, status::SUCCESS, &[&list[..]]);
            }
            oid::GEN_VENDOR_DESCRIPTION => {
                let vendor = self.net.vendor_description.as_bytes();
                return self.query_complete(request_id, status::SUCCESS, &[vendor, &[0][..]]);
            }
            oid::IEEE_802_3_PERMANENT_ADDRESS | oid::IEEE_802_3_CURRENT_ADDRESS => {
                let mac = self.net.mac_address;
                return self.query_complete(request_id, status::SUCCESS, &[&mac[..]]);
            }
            oid::IEEE_802_3_MULTICAST_LIST | oid::IEEE_802_3_MAC_OPTIONS => {
                return self.query_complete(request_id, status::NOT_SUPPORTED, &[&[0; 4][..]]);
            }
            oid::GEN_HARDWARE_STATUS => 0,
            oid::GEN_MEDIA_SUPPORTED | oid::GEN_MEDIA_IN_USE | oid::GEN_PHYSICAL_MEDIUM => {
                MEDIUM_802_3
            }
            oid::GEN_MAXIMUM_FRAME_SIZE => mtu.saturating_sub(ETHERNET_HEADER_LEN),
            // Units of 100 bit/s
            oid::GEN_LINK_SPEED => self.net.link_speed_bps / 100,
            oid::GEN_TRANSMIT_BLOCK_SIZE
            | oid::GEN_RECEIVE_BLOCK_SIZE
            | oid::GEN_MAXIMUM_TOTAL_SIZE => mtu,
            oid::GEN_VENDOR_ID => VENDOR_ID,
            oid::GEN_VENDOR_DRIVER_VERSION => VENDOR_DRIVER_VERSION,
            oid::GEN_CURRENT_PACKET_FILTER => self.packet_filter.bits(),
            oid::GEN_MEDIA_CONNECT_STATUS => {
                if self.link_up {
                    MEDIA_STATE_CONNECTED
                } else {
                    MEDIA_STATE_DISCONNECTED
                }
            }
            oid::GEN_RNDIS_CONFIG_PARAMETER | oid::GEN_MAC_OPTIONS => 0,
            oid::IEEE_802_3_MAXIMUM_LIST_SIZE => 1,
            oid::IEEE_802_3_RCV_ERROR_ALIGNMENT
            | oid::IEEE_802_3_XMIT_ONE_COLLISION
            | oid::IEEE_802_3_XMIT_MORE_COLLISIONS
            | oid::GEN_RCV_NO_BUFFER => 0,
            oid::GEN_XMIT_OK => statistics.tx_ok,
            oid::GEN_RCV_OK => statistics.rx_ok,
            oid::GEN_XMIT_ERROR => statistics.tx_error,
            oid::GEN_RCV_ERROR => statistics.rx_error,
            _ => {
                debug!("RNDIS unsupported query 0x{:x}", oid);
                return self.query_complete(request_id, status::FAILURE, &[]);
            }
        };
        self.query_complete(request_id, status::SUCCESS, &[&value.to_le_bytes()[..]]);
    }

    /// Apply a SET, returning its status
    fn set(&mut self, oid: u32, information: &[u8]) -> u32 {
        trace!("RNDIS SET 0x{:x}", oid);
        match oid {
            oid::GEN_CURRENT_PACKET_FILTER => {
                let Some(filter) = get_u32(information, 0) else {
                    return status::INVALID_DATA;
                };
                self.packet_filter = PacketFilter::from_bits_retain(filter);
                self.state = if self.packet_filter.is_empty() {
                    SessionState::Initialized
                } else {
                    SessionState::DataInitialized
                };
                debug!("RNDIS packet filter 0x{:x}", filter);
                status::SUCCESS
            }
            oid::GEN_CURRENT_LOOKAHEAD
            | oid::GEN_PROTOCOL_OPTIONS
            | oid::IEEE_802_3_MULTICAST_LIST
            | oid::GEN_RNDIS_CONFIG_PARAMETER => status::SUCCESS,
            oid::PNP_ADD_WAKE_UP_PATTERN
            | oid::PNP_REMOVE_WAKE_UP_PATTERN
            | oid::PNP_ENABLE_WAKE_UP => status::FAILURE,
            _ => {
                debug!("RNDIS unsupported set 0x{:x}", oid);
                status::FAILURE
            }
        }
    }
}

/// Write a data packet header for a `data_len`-byte frame into the front of
/// `buffer`
///
/// The frame follows the header directly. Returns the total message length,
/// or `None` if `buffer` can't hold the header.
pub fn write_packet_header(buffer: &mut [u8], data_len: usize) -> Option<usize> {
    let header = buffer.get_mut(..PACKET_HEADER_LEN)?;
    header.fill(0);
    let len = PACKET_HEADER_LEN + data_len;
    put_u32(header, 0, msg::PACKET);
    put_u32(header, 4, len as u32);
    put_u32(header, 8, (PACKET_HEADER_LEN - PACKET_DATA_BASE) as u32);
    put_u32(header, 12, data_len as u32);
    Some(len)
}

/// Validate a received data packet, and return its frame
///
/// The message type must be PACKET, the message length must fit in `raw`,
/// and the frame must lie within the message.
pub fn parse_packet(raw: &[u8]) -> Result<&[u8], FrameError> {
    let (start, end) = packet_bounds(raw)?;
    Ok(&raw[start..end])
}

/// Start and end of the frame in a data packet
pub(crate) fn packet_bounds(raw: &[u8]) -> Result<(usize, usize), FrameError> {
    if raw.len() < PACKET_HEADER_LEN {
        return Err(FrameError::Truncated);
    }
    if get_u32(raw, 0) != Some(msg::PACKET) {
        return Err(FrameError::Signature);
    }
    let len = get_u32(raw, 4).unwrap_or(0) as usize;
    if len < PACKET_HEADER_LEN || len > raw.len() {
        return Err(FrameError::Truncated);
    }
    let offset = get_u32(raw, 8).unwrap_or(0) as usize;
    let data_len = get_u32(raw, 12).unwrap_or(0) as usize;
    let start = PACKET_DATA_BASE
        .checked_add(offset)
        .ok_or(FrameError::Bounds)?;
    let end = start.checked_add(data_len).ok_or(FrameError::Bounds)?;
    if start < PACKET_HEADER_LEN || end > len {
        return Err(FrameError::Bounds);
    }
    Ok((start, end))
}

#[cfg(test)]
mod test {
    use super::{
        msg, oid, parse_packet, status, write_packet_header, Message, PacketFilter, Rndis,
        SessionState, Statistics, PACKET_HEADER_LEN,
    };
    use crate::{
        config::NetConfig,
        net::{get_u32, FrameError},
    };
    use std::vec::Vec;

    fn words(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn initialize(id: u32) -> Vec<u8> {
        words(&[msg::INITIALIZE, 24, id, 1, 0, 0x4000])
    }

    fn query(id: u32, oid: u32) -> Vec<u8> {
        words(&[msg::QUERY, 28, id, oid, 0, 0, 0])
    }

    fn set(id: u32, oid: u32, value: u32) -> Vec<u8> {
        words(&[msg::SET, 32, id, oid, 4, 20, 0, value])
    }

    fn response_word(rndis: &Rndis, at: usize) -> u32 {
        get_u32(rndis.response().unwrap(), at).unwrap()
    }

    #[test]
    fn initialize_session() {
        let mut rndis = Rndis::new(NetConfig::default());
        assert_eq!(rndis.state(), SessionState::Uninitialized);
        assert!(rndis.handle(&initialize(7), &Statistics::default()));
        assert_eq!(rndis.state(), SessionState::Initialized);

        let response = rndis.response().unwrap();
        assert_eq!(response.len(), 52);
        assert_eq!(get_u32(response, 0), Some(msg::INITIALIZE_CMPLT));
        assert_eq!(get_u32(response, 4), Some(52));
        assert_eq!(get_u32(response, 8), Some(7));
        assert_eq!(get_u32(response, 12), Some(status::SUCCESS));
        assert_eq!(get_u32(response, 16), Some(1), "major");
        assert_eq!(get_u32(response, 24), Some(1), "connectionless");
        assert_eq!(get_u32(response, 32), Some(1), "packets per transfer");
        assert_eq!(get_u32(response, 36), Some(1514 + 44));

        rndis.clear_response();
        assert_eq!(rndis.response(), None);
    }

    #[test]
    fn packet_filter_drives_data_state() {
        let mut rndis = Rndis::new(NetConfig::default());
        let stats = Statistics::default();
        rndis.handle(&initialize(1), &stats);

        assert!(rndis.handle(&set(2, oid::GEN_CURRENT_PACKET_FILTER, 0x0B), &stats));
        assert_eq!(rndis.state(), SessionState::DataInitialized);
        assert!(rndis.packet_filter().contains(PacketFilter::DIRECTED | PacketFilter::BROADCAST));
        assert_eq!(response_word(&rndis, 0), msg::SET_CMPLT);
        assert_eq!(response_word(&rndis, 8), 2);
        assert_eq!(response_word(&rndis, 12), status::SUCCESS);

        rndis.handle(&query(3, oid::GEN_CURRENT_PACKET_FILTER), &stats);
        assert_eq!(response_word(&rndis, 24), 0x0B);

        rndis.handle(&set(4, oid::GEN_CURRENT_PACKET_FILTER, 0), &stats);
        assert_eq!(rndis.state(), SessionState::Initialized);
        assert!(!rndis.is_data_initialized());
    }

    #[test]
    fn scalar_queries() {
        let mut rndis = Rndis::new(NetConfig::default());
        let stats = Statistics {
            tx_ok: 10,
            tx_error: 1,
            rx_ok: 20,
            rx_error: 2,
        };
        let cases = [
            (oid::GEN_LINK_SPEED, 120_000),
            (oid::GEN_MAXIMUM_FRAME_SIZE, 1500),
            (oid::GEN_MAXIMUM_TOTAL_SIZE, 1514),
            (oid::GEN_MEDIA_SUPPORTED, 0),
            (oid::GEN_VENDOR_ID, 0x00FF_FFFF),
            (oid::GEN_MEDIA_CONNECT_STATUS, 0),
            (oid::IEEE_802_3_MAXIMUM_LIST_SIZE, 1),
            (oid::GEN_XMIT_OK, 10),
            (oid::GEN_XMIT_ERROR, 1),
            (oid::GEN_RCV_OK, 20),
            (oid::GEN_RCV_ERROR, 2),
        ];
        for (id, (oid, expected)) in cases.into_iter().enumerate() {
            assert!(rndis.handle(&query(id as u32, oid), &stats));
            let response = rndis.response().unwrap();
            assert_eq!(response.len(), 28);
            assert_eq!(get_u32(response, 0), Some(msg::QUERY_CMPLT));
            assert_eq!(get_u32(response, 8), Some(id as u32));
            assert_eq!(get_u32(response, 12), Some(status::SUCCESS));
            assert_eq!(get_u32(response, 16), Some(4));
            assert_eq!(get_u32(response, 20), Some(16));
            assert_eq!(get_u32(response, 24), Some(expected), "OID 0x{oid:x}");
        }
    }

    #[test]
    fn buffer_queries() {
        let net = NetConfig::default();
        let mut rndis = Rndis::new(net);
        let stats = Statistics::default();

        rndis.handle(&query(1, oid::IEEE_802_3_CURRENT_ADDRESS), &stats);
        let response = rndis.response().unwrap();
        assert_eq!(get_u32(response, 16), Some(6));
        assert_eq!(response[24..], net.mac_address);

        rndis.handle(&query(2, oid::GEN_VENDOR_DESCRIPTION), &stats);
        let response = rndis.response().unwrap();
        let vendor = net.vendor_description.as_bytes();
        assert_eq!(response[24..24 + vendor.len()], *vendor);
        assert_eq!(*response.last().unwrap(), 0, "NUL terminated");

        rndis.handle(&query(3, oid::GEN_SUPPORTED_LIST), &stats);
        let response = rndis.response().unwrap();
        let count = get_u32(response, 16).unwrap() as usize / 4;
        let oids: Vec<u32> = (0..count).map(|i| get_u32(response, 24 + 4 * i).unwrap()).collect();
        assert_eq!(oids[0], oid::GEN_SUPPORTED_LIST);
        assert!(oids.contains(&oid::GEN_MEDIA_CONNECT_STATUS));
        assert_eq!(response.len(), 24 + 4 * count);
    }

    #[test]
    fn unsupported_oids_fail_in_band() {
        let mut rndis = Rndis::new(NetConfig::default());
        let stats = Statistics::default();

        assert!(rndis.handle(&query(1, 0x0BAD_0BAD), &stats));
        assert_eq!(response_word(&rndis, 12), status::FAILURE);
        assert_eq!(response_word(&rndis, 16), 0);
        assert_eq!(rndis.response().unwrap().len(), 24);

        rndis.handle(&query(2, oid::IEEE_802_3_MULTICAST_LIST), &stats);
        assert_eq!(response_word(&rndis, 12), status::NOT_SUPPORTED);

        rndis.handle(&set(3, oid::PNP_ENABLE_WAKE_UP, 1), &stats);
        assert_eq!(response_word(&rndis, 12), status::FAILURE);
        rndis.handle(&set(4, oid::GEN_CURRENT_LOOKAHEAD, 128), &stats);
        assert_eq!(response_word(&rndis, 12), status::SUCCESS);
    }

    #[test]
    fn reset_halt_keepalive() {
        let mut rndis = Rndis::new(NetConfig::default());
        let stats = Statistics::default();
        rndis.handle(&initialize(1), &stats);
        rndis.handle(&set(2, oid::GEN_CURRENT_PACKET_FILTER, 1), &stats);

        assert!(rndis.handle(&words(&[msg::KEEPALIVE, 12, 9]), &stats));
        assert_eq!(response_word(&rndis, 0), msg::KEEPALIVE_CMPLT);
        assert_eq!(response_word(&rndis, 8), 9);
        assert_eq!(rndis.state(), SessionState::DataInitialized);

        assert!(rndis.handle(&words(&[msg::RESET, 12, 0]), &stats));
        assert_eq!(rndis.state(), SessionState::Uninitialized);
        assert_eq!(rndis.response().unwrap(), &words(&[msg::RESET_CMPLT, 16, 0, 1])[..]);

        rndis.handle(&initialize(3), &stats);
        assert!(!rndis.handle(&words(&[msg::HALT, 12, 4]), &stats));
        assert_eq!(rndis.state(), SessionState::Uninitialized);
        assert_eq!(rndis.response(), None);
    }

    #[test]
    fn malformed_messages_are_ignored() {
        let mut rndis = Rndis::new(NetConfig::default());
        let stats = Statistics::default();
        assert!(!rndis.handle(&[0x02, 0, 0], &stats));
        assert!(!rndis.handle(&words(&[0x99, 12, 0]), &stats));
        assert!(!rndis.handle(&words(&[msg::INITIALIZE, 64, 1, 1, 0, 0]), &stats));
        assert!(!rndis.handle(&words(&[msg::QUERY, 20, 1, oid::GEN_LINK_SPEED, 0]), &stats));
        assert_eq!(rndis.response(), None);

        let oversized_info = words(&[msg::SET, 32, 1, oid::GEN_CURRENT_PACKET_FILTER, 4, 24, 0, 1]);
        assert_eq!(Message::parse(&oversized_info), Err(FrameError::Bounds));
        assert_eq!(rndis.state(), SessionState::Uninitialized);
    }

    #[test]
    fn link_changes_indicate_status() {
        let mut rndis = Rndis::new(NetConfig::default());
        let stats = Statistics::default();
        assert!(rndis.is_link_up());
        assert!(!rndis.set_link(false), "uninitialized");

        rndis.handle(&initialize(1), &stats);
        rndis.clear_response();
        assert!(!rndis.set_link(false), "unchanged");
        assert!(rndis.set_link(true));
        assert_eq!(
            rndis.response().unwrap(),
            &words(&[msg::INDICATE_STATUS, 20, status::MEDIA_CONNECT, 0, 0])[..]
        );
        assert!(rndis.set_link(false));
        assert_eq!(response_word(&rndis, 8), status::MEDIA_DISCONNECT);

        rndis.handle(&query(2, oid::GEN_MEDIA_CONNECT_STATUS), &stats);
        assert_eq!(response_word(&rndis, 24), 1);
    }

    #[test]
    fn data_packets() {
        let mut buffer = [0u8; 64];
        let frame = [0xEE; 14];
        let len = write_packet_header(&mut buffer, frame.len()).unwrap();
        assert_eq!(len, PACKET_HEADER_LEN + 14);
        buffer[PACKET_HEADER_LEN..len].copy_from_slice(&frame);

        assert_eq!(get_u32(&buffer, 0), Some(msg::PACKET));
        assert_eq!(get_u32(&buffer, 4), Some(58));
        assert_eq!(get_u32(&buffer, 8), Some(36));
        assert_eq!(get_u32(&buffer, 12), Some(14));
        assert_eq!(parse_packet(&buffer[..len]), Ok(&frame[..]));
        assert!(write_packet_header(&mut [0; 16], 4).is_none());

        assert_eq!(parse_packet(&buffer[..40]), Err(FrameError::Truncated));
        assert_eq!(parse_packet(&buffer[..len - 1]), Err(FrameError::Truncated));

        let mut bad_type = buffer;
        bad_type[0] = 2;
        assert_eq!(parse_packet(&bad_type[..len]), Err(FrameError::Signature));

        let mut bad_length = buffer;
        bad_length[12] = 15;
        assert_eq!(parse_packet(&bad_length[..len]), Err(FrameError::Bounds));

        let mut bad_offset = buffer;
        bad_offset[8] = 0;
        assert_eq!(parse_packet(&bad_offset[..len]), Err(FrameError::Bounds));
    }
}
