//! Descriptors served by the control engine

use super::request::descriptor_type;
use crate::hw::EndpointDescriptor;

/// US English
const LANGUAGE_ID_EN_US: u16 = 0x0409;

/// The device's raw descriptors
///
/// The engine answers GET_DESCRIPTOR from these bytes, and never builds
/// descriptors on its own. Strings are encoded as UTF-16 when requested;
/// string index `n` maps to `strings[n - 1]`, and index zero reports the
/// language ID.
#[derive(Clone, Copy, Debug)]
pub struct Descriptors<'a> {
    device: &'a [u8],
    configuration: &'a [u8],
    strings: &'a [&'a str],
    language_id: u16,
}

impl<'a> Descriptors<'a> {
    /// Serve a device descriptor and one configuration
    ///
    /// `configuration` holds the configuration descriptor followed by all of
    /// its interface, class and endpoint descriptors.
    pub const fn new(device: &'a [u8], configuration: &'a [u8]) -> Self {
        Descriptors {
            device,
            configuration,
            strings: &[],
            language_id: LANGUAGE_ID_EN_US,
        }
    }

    /// Serve string descriptors
    pub const fn with_strings(self, strings: &'a [&'a str]) -> Self {
        Descriptors { strings, ..self }
    }

    /// Report a language other than US English
    pub const fn with_language_id(self, language_id: u16) -> Self {
        Descriptors {
            language_id,
            ..self
        }
    }

    /// The device descriptor, limited to its `bLength`
    pub fn device(&self) -> &'a [u8] {
        let len = self.device.first().map_or(0, |&len| len as usize);
        &self.device[..len.min(self.device.len())]
    }

    /// The full configuration, limited to its `wTotalLength`
    pub fn configuration(&self) -> &'a [u8] {
        let len = match self.configuration {
            [_, _, lo, hi, ..] => u16::from_le_bytes([*lo, *hi]) as usize,
            _ => 0,
        };
        &self.configuration[..len.min(self.configuration.len())]
    }

    /// `bConfigurationValue`
    pub fn configuration_value(&self) -> u8 {
        self.configuration.get(5).copied().unwrap_or(1)
    }

    /// Indicates if `bmAttributes` declares a self-powered device
    pub fn self_powered(&self) -> bool {
        self.configuration.get(7).map_or(false, |attr| attr & 0x40 != 0)
    }

    /// Encode string descriptor `index` into `out`
    ///
    /// Returns the descriptor length, or `None` if there's no such string.
    /// Long strings are truncated to fit `out`.
    pub fn write_string(&self, index: u8, out: &mut [u8]) -> Option<usize> {
        let capacity = out.len().min(u8::MAX as usize) & !1;
        if capacity < 2 {
            return None;
        }
        let mut len = 2;
        if index == 0 {
            for byte in self.language_id.to_le_bytes() {
                if len < capacity {
                    out[len] = byte;
                    len += 1;
                }
            }
        } else {
            let string = self.strings.get(index as usize - 1)?;
            for unit in string.encode_utf16() {
                if len + 2 > capacity {
                    break;
                }
                out[len..len + 2].copy_from_slice(&unit.to_le_bytes());
                len += 2;
            }
        }
        out[0] = len as u8;
        out[1] = descriptor_type::STRING;
        Some(len)
    }

    /// Iterate over every descriptor in the configuration
    pub fn iter(&self) -> DescriptorIter<'a> {
        DescriptorIter {
            remaining: self.configuration(),
        }
    }

    /// Endpoints declared by any alternate setting of `interface`
    pub fn endpoints(&self, interface: u8) -> impl Iterator<Item = EndpointDescriptor> + 'a {
        let mut current = None;
        self.iter().filter_map(move |desc| {
            match desc[1] {
                descriptor_type::INTERFACE if desc.len() > 2 => current = Some(desc[2]),
                descriptor_type::ENDPOINT if current == Some(interface) => {
                    return EndpointDescriptor::parse(desc).ok()
                }
                _ => {}
            }
            None
        })
    }
}

/// Walks the descriptors of a configuration
pub struct DescriptorIter<'a> {
    remaining: &'a [u8],
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = &'a [u8];
    fn next(&mut self) -> Option<Self::Item> {
        let len = *self.remaining.first()? as usize;
        if len < 2 || len > self.remaining.len() {
            self.remaining = &[];
            return None;
        }
        let (desc, rest) = self.remaining.split_at(len);
        self.remaining = rest;
        Some(desc)
    }
}
