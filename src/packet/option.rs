use crate::packet::{BlockValue, MessageError, Packet};

/// Option numbers recognized by this crate (RFC 7252 section 5.10, RFC 7641,
/// RFC 7959).  Numbers outside the registry are carried as [`Unknown`] so
/// that foreign options survive an encode round-trip untouched.
///
/// [`Unknown`]: CoapOption::Unknown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoapOption {
    IfMatch,
    UriHost,
    ETag,
    IfNoneMatch,
    Observe,
    UriPort,
    LocationPath,
    UriPath,
    ContentFormat,
    MaxAge,
    UriQuery,
    Accept,
    LocationQuery,
    Block2,
    Block1,
    Size2,
    ProxyUri,
    ProxyScheme,
    Size1,
    Unknown(u16),
}

impl From<u16> for CoapOption {
    fn from(number: u16) -> CoapOption {
        match number {
            1 => CoapOption::IfMatch,
            3 => CoapOption::UriHost,
            4 => CoapOption::ETag,
            5 => CoapOption::IfNoneMatch,
            6 => CoapOption::Observe,
            7 => CoapOption::UriPort,
            8 => CoapOption::LocationPath,
            11 => CoapOption::UriPath,
            12 => CoapOption::ContentFormat,
            14 => CoapOption::MaxAge,
            15 => CoapOption::UriQuery,
            17 => CoapOption::Accept,
            20 => CoapOption::LocationQuery,
            23 => CoapOption::Block2,
            27 => CoapOption::Block1,
            28 => CoapOption::Size2,
            35 => CoapOption::ProxyUri,
            39 => CoapOption::ProxyScheme,
            60 => CoapOption::Size1,
            other => CoapOption::Unknown(other),
        }
    }
}

impl From<CoapOption> for u16 {
    fn from(option: CoapOption) -> u16 {
        match option {
            CoapOption::IfMatch => 1,
            CoapOption::UriHost => 3,
            CoapOption::ETag => 4,
            CoapOption::IfNoneMatch => 5,
            CoapOption::Observe => 6,
            CoapOption::UriPort => 7,
            CoapOption::LocationPath => 8,
            CoapOption::UriPath => 11,
            CoapOption::ContentFormat => 12,
            CoapOption::MaxAge => 14,
            CoapOption::UriQuery => 15,
            CoapOption::Accept => 17,
            CoapOption::LocationQuery => 20,
            CoapOption::Block2 => 23,
            CoapOption::Block1 => 27,
            CoapOption::Size2 => 28,
            CoapOption::ProxyUri => 35,
            CoapOption::ProxyScheme => 39,
            CoapOption::Size1 => 60,
            CoapOption::Unknown(number) => number,
        }
    }
}

/// One option instance as carried in a packet: the raw number and value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketOption {
    pub number: u16,
    pub value: Vec<u8>,
}

/// Observe option values from RFC 7641 section 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveOption {
    Register,
    Deregister,
}

impl ObserveOption {
    fn from_uint(value: u64) -> Option<ObserveOption> {
        match value {
            0 => Some(ObserveOption::Register),
            1 => Some(ObserveOption::Deregister),
            _ => None,
        }
    }

    fn to_uint(self) -> u64 {
        match self {
            ObserveOption::Register => 0,
            ObserveOption::Deregister => 1,
        }
    }
}

/// Minimal-length big-endian unsigned integer encoding (RFC 7252 section
/// 3.2): leading zero bytes are dropped, zero encodes as the empty string.
pub(crate) fn encode_uint(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    bytes[skip..].to_vec()
}

pub(crate) fn decode_uint(value: &[u8]) -> Option<u64> {
    if value.len() > 8 {
        return None;
    }
    Some(value.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
}

fn check_segment(segment: &str) -> Result<(), MessageError> {
    if segment.len() > 255 || segment == "." || segment == ".." {
        return Err(MessageError::InvalidUriSegment(segment.to_owned()));
    }
    Ok(())
}

fn utf8_value(value: &[u8]) -> Option<String> {
    String::from_utf8(value.to_vec()).ok()
}

/// Typed option accessors and constructors.  Accessors are total: an absent
/// or undecodable option reads as `None` (or an empty list), never a panic.
impl Packet {
    pub fn get_uri_host(&self) -> Option<String> {
        self.get_option(CoapOption::UriHost).and_then(utf8_value)
    }

    pub fn get_uri_port(&self) -> Option<u16> {
        self.get_option(CoapOption::UriPort)
            .and_then(decode_uint)
            .and_then(|v| u16::try_from(v).ok())
    }

    pub fn get_uri_path(&self) -> Vec<String> {
        self.get_options(CoapOption::UriPath)
            .filter_map(utf8_value)
            .collect()
    }

    pub fn get_uri_query(&self) -> Vec<String> {
        self.get_options(CoapOption::UriQuery)
            .filter_map(utf8_value)
            .collect()
    }

    pub fn get_location_path(&self) -> Vec<String> {
        self.get_options(CoapOption::LocationPath)
            .filter_map(utf8_value)
            .collect()
    }

    pub fn get_location_query(&self) -> Vec<String> {
        self.get_options(CoapOption::LocationQuery)
            .filter_map(utf8_value)
            .collect()
    }

    pub fn get_observe(&self) -> Option<ObserveOption> {
        self.get_option(CoapOption::Observe)
            .and_then(decode_uint)
            .and_then(ObserveOption::from_uint)
    }

    pub fn get_block1(&self) -> Option<BlockValue> {
        self.get_block(CoapOption::Block1)
    }

    pub fn get_block2(&self) -> Option<BlockValue> {
        self.get_block(CoapOption::Block2)
    }

    fn get_block(&self, which: CoapOption) -> Option<BlockValue> {
        let raw = self.get_option(which).and_then(decode_uint)?;
        let raw = u32::try_from(raw).ok()?;
        BlockValue::from_raw(raw).ok()
    }

    pub fn get_if_match(&self) -> Vec<Vec<u8>> {
        self.get_options(CoapOption::IfMatch)
            .map(<[u8]>::to_vec)
            .collect()
    }

    pub fn get_if_none_match(&self) -> bool {
        self.get_option(CoapOption::IfNoneMatch).is_some()
    }

    pub fn get_etag(&self) -> Option<Vec<u8>> {
        self.get_option(CoapOption::ETag).map(<[u8]>::to_vec)
    }

    pub fn get_content_format(&self) -> Option<u16> {
        self.get_option(CoapOption::ContentFormat)
            .and_then(decode_uint)
            .and_then(|v| u16::try_from(v).ok())
    }

    pub fn get_accept(&self) -> Option<u16> {
        self.get_option(CoapOption::Accept)
            .and_then(decode_uint)
            .and_then(|v| u16::try_from(v).ok())
    }

    pub fn get_size1(&self) -> Option<u32> {
        self.get_option(CoapOption::Size1)
            .and_then(decode_uint)
            .and_then(|v| u32::try_from(v).ok())
    }

    pub fn get_size2(&self) -> Option<u32> {
        self.get_option(CoapOption::Size2)
            .and_then(decode_uint)
            .and_then(|v| u32::try_from(v).ok())
    }

    pub fn get_max_age(&self) -> Option<u32> {
        self.get_option(CoapOption::MaxAge)
            .and_then(decode_uint)
            .and_then(|v| u32::try_from(v).ok())
    }

    /// Uri-Host must be 1..=255 bytes.
    pub fn set_uri_host(&mut self, host: &str) -> Result<(), MessageError> {
        if host.is_empty() || host.len() > 255 {
            return Err(MessageError::InvalidUriHost);
        }
        self.set_option(CoapOption::UriHost, host.as_bytes().to_vec());
        Ok(())
    }

    pub fn set_uri_port(&mut self, port: u16) {
        self.set_option(CoapOption::UriPort, encode_uint(u64::from(port)));
    }

    /// Segments must be at most 255 bytes and neither "." nor "..".
    pub fn add_uri_path(&mut self, segment: &str) -> Result<(), MessageError> {
        check_segment(segment)?;
        self.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
        Ok(())
    }

    pub fn add_uri_query(&mut self, segment: &str) -> Result<(), MessageError> {
        check_segment(segment)?;
        self.add_option(CoapOption::UriQuery, segment.as_bytes().to_vec());
        Ok(())
    }

    pub fn set_observe(&mut self, observe: ObserveOption) {
        self.set_option(CoapOption::Observe, encode_uint(observe.to_uint()));
    }

    pub fn set_block1(&mut self, block: BlockValue) {
        self.set_option(CoapOption::Block1, encode_uint(u64::from(block.to_raw())));
    }

    pub fn set_block2(&mut self, block: BlockValue) {
        self.set_option(CoapOption::Block2, encode_uint(u64::from(block.to_raw())));
    }

    pub fn add_if_match(&mut self, etag: Vec<u8>) {
        self.add_option(CoapOption::IfMatch, etag);
    }

    pub fn set_if_none_match(&mut self) {
        self.set_option(CoapOption::IfNoneMatch, Vec::new());
    }

    pub fn set_content_format(&mut self, format: u16) {
        self.set_option(CoapOption::ContentFormat, encode_uint(u64::from(format)));
    }

    pub fn set_accept(&mut self, format: u16) {
        self.set_option(CoapOption::Accept, encode_uint(u64::from(format)));
    }

    pub fn set_max_age(&mut self, seconds: u32) {
        self.set_option(CoapOption::MaxAge, encode_uint(u64::from(seconds)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_number_round_trip() {
        for number in 0..=100u16 {
            assert_eq!(u16::from(CoapOption::from(number)), number);
        }
    }

    #[test]
    fn uint_encoding_is_minimal_length() {
        assert_eq!(encode_uint(0), Vec::<u8>::new());
        assert_eq!(encode_uint(5), vec![5]);
        assert_eq!(encode_uint(0x2330), vec![0x23, 0x30]);
        assert_eq!(encode_uint(0x0001_0000), vec![1, 0, 0]);
        assert_eq!(decode_uint(&[]), Some(0));
        assert_eq!(decode_uint(&[0x23, 0x30]), Some(0x2330));
        assert_eq!(decode_uint(&[0; 9]), None);
    }

    #[test]
    fn typed_accessors() {
        let mut packet = Packet::new();
        packet.set_uri_host("example.com").unwrap();
        packet.set_uri_port(5683);
        packet.add_uri_path("sensors").unwrap();
        packet.add_uri_path("temp").unwrap();
        packet.add_uri_query("page=1").unwrap();
        packet.set_observe(ObserveOption::Register);
        packet.set_content_format(50);
        packet.set_if_none_match();

        assert_eq!(packet.get_uri_host().as_deref(), Some("example.com"));
        assert_eq!(packet.get_uri_port(), Some(5683));
        assert_eq!(packet.get_uri_path(), vec!["sensors", "temp"]);
        assert_eq!(packet.get_uri_query(), vec!["page=1"]);
        assert_eq!(packet.get_observe(), Some(ObserveOption::Register));
        assert_eq!(packet.get_content_format(), Some(50));
        assert!(packet.get_if_none_match());
        assert_eq!(packet.get_accept(), None);
        assert_eq!(packet.get_max_age(), None);
    }

    #[test]
    fn block_accessors() {
        let mut packet = Packet::new();
        packet.set_block2(BlockValue::new(2, true, 4).unwrap());
        let block = packet.get_block2().unwrap();
        assert_eq!(block.num, 2);
        assert!(block.more);
        assert_eq!(block.size(), 256);
        assert_eq!(packet.get_block1(), None);
    }

    #[test]
    fn repeatable_if_match() {
        let mut packet = Packet::new();
        packet.add_if_match(vec![1, 2]);
        packet.add_if_match(vec![3]);
        assert_eq!(packet.get_if_match(), vec![vec![1, 2], vec![3]]);
    }

    #[test]
    fn constructors_enforce_limits() {
        let mut packet = Packet::new();
        assert!(packet.set_uri_host("").is_err());
        assert!(packet.set_uri_host(&"h".repeat(256)).is_err());
        assert!(packet.add_uri_path(".").is_err());
        assert!(packet.add_uri_path("..").is_err());
        assert!(packet.add_uri_query(&"q".repeat(256)).is_err());
        assert!(packet.add_uri_path(&"p".repeat(255)).is_ok());
    }

    #[test]
    fn undecodable_reads_as_none() {
        let mut packet = Packet::new();
        // Uri-Port wider than 16 bits
        packet.set_option(CoapOption::UriPort, vec![1, 0, 0]);
        assert_eq!(packet.get_uri_port(), None);
        // Observe value outside the registry
        packet.set_option(CoapOption::Observe, vec![9]);
        assert_eq!(packet.get_observe(), None);
        // Block with reserved SZX
        packet.set_option(CoapOption::Block2, vec![0x17]);
        assert_eq!(packet.get_block2(), None);
    }
}
