//! Init-time configuration

/// Size of an NTH16 block header
pub(crate) const NTH16_LEN: usize = 12;
/// Size of an NDP16 table header, without entries
pub(crate) const NDP16_HEADER_LEN: usize = 8;
/// Size of one NDP16 (offset, length) entry
pub(crate) const NDP16_ENTRY_LEN: usize = 4;

/// Engine and framing limits
///
/// All values are fixed when the components are constructed. Check them once
/// with [`validate()`](Config::validate).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Wire packet size of the control endpoint.
    ///
    /// At most 64 bytes, at any bus speed. Bulk endpoints take their packet
    /// size from their own descriptors.
    pub max_packet_size: u16,
    /// Largest NTB, in bytes, in either direction.
    pub ntb_max_size: u16,
    /// Datagram entries per transmitted NTB, not counting the terminator.
    pub max_datagrams_per_block: u8,
    /// Datagram start offsets are rounded up to this many bytes.
    pub alignment: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_packet_size: 64,
            ntb_max_size: 3200,
            max_datagrams_per_block: 8,
            alignment: 4,
        }
    }
}

/// A configuration value is out of range
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum ConfigError {
    /// A packet size is zero, or the control packet size is above 64 bytes.
    MaxPacketSize,
    /// Alignment is below four bytes, or isn't a power of two.
    Alignment,
    /// An NTB can't hold its own headers and pointer table.
    NtbSize,
    /// No room for any datagram.
    DatagramCount,
    /// A memory region is too small, or isn't word-aligned.
    Memory,
}

impl Config {
    /// Check that the limits are consistent
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_packet_size == 0 || self.max_packet_size > 64 {
            return Err(ConfigError::MaxPacketSize);
        }
        if self.alignment < 4 || !self.alignment.is_power_of_two() {
            return Err(ConfigError::Alignment);
        }
        if self.max_datagrams_per_block == 0 {
            return Err(ConfigError::DatagramCount);
        }
        if (self.ntb_max_size as usize) < self.first_datagram_offset() {
            return Err(ConfigError::NtbSize);
        }
        Ok(())
    }

    /// Offset of the first datagram in a transmitted NTB
    ///
    /// The NDP directly follows the NTH, sized for every entry plus the
    /// terminator. Datagrams start at the next aligned offset.
    pub fn first_datagram_offset(&self) -> usize {
        let tables = NTH16_LEN
            + NDP16_HEADER_LEN
            + (self.max_datagrams_per_block as usize + 1) * NDP16_ENTRY_LEN;
        align_up(tables, self.alignment as usize)
    }
}

/// Round `value` up to a multiple of `alignment`, a power of two
pub(crate) const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Identity and link properties of a network device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetConfig {
    /// Hardware address that the device reports to the host.
    pub mac_address: [u8; 6],
    /// Vendor description string, returned for RNDIS queries.
    pub vendor_description: &'static str,
    /// Link speed, in bits per second.
    pub link_speed_bps: u32,
    /// Largest Ethernet frame, including the 14-byte header.
    pub mtu: u16,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            // Locally administered, unicast.
            mac_address: [0x02, 0x02, 0x84, 0x6A, 0x96, 0x00],
            vendor_description: "usbd-engine network device",
            link_speed_bps: 12_000_000,
            mtu: 1514,
        }
    }
}
