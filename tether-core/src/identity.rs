//! Device identity: hardware address, node ID and the control-link endpoint.

use std::fmt;
use std::str::FromStr;

/// Default prefix for the node ID (followed by the last three MAC bytes).
pub const DEFAULT_NODE_PREFIX: &str = "esp32-s3-";

/// 48-bit hardware address of the station interface.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn new(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

/// Uppercase, colon separated: `AA:BB:CC:DD:EE:FF`.
impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = IdentityError;

    /// Accepts `:` or `-` separated hex octets, any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut out = [0u8; 6];
        let mut n = 0usize;
        for part in s.split(|c| c == ':' || c == '-') {
            if n == out.len() || part.len() != 2 {
                return Err(IdentityError::InvalidMac(s.to_string()));
            }
            out[n] = u8::from_str_radix(part, 16)
                .map_err(|_| IdentityError::InvalidMac(s.to_string()))?;
            n += 1;
        }
        if n != out.len() {
            return Err(IdentityError::InvalidMac(s.to_string()));
        }
        Ok(MacAddress(out))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid hardware address: {0:?}")]
    InvalidMac(String),
}

/// Immutable per-boot identity. Derived once at startup; never changes while the process runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    mac: MacAddress,
    node_id: String,
    endpoint: String,
}

impl SessionIdentity {
    /// Derive node ID from the MAC (prefix + last three bytes, lowercase hex) and
    /// form the endpoint by appending it to `base_url`.
    pub fn derive(mac: MacAddress, node_prefix: &str, base_url: &str) -> Self {
        let b = mac.as_bytes();
        let node_id = format!("{}{:02x}{:02x}{:02x}", node_prefix, b[3], b[4], b[5]);
        let endpoint = format!("{}{}", base_url, node_id);
        Self {
            mac,
            node_id,
            endpoint,
        }
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Connection endpoint: configured base path + node ID.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parse_and_display() {
        let mac: MacAddress = "a4:cf:12:0b:9e:7f".parse().unwrap();
        assert_eq!(mac.as_bytes(), &[0xa4, 0xcf, 0x12, 0x0b, 0x9e, 0x7f]);
        assert_eq!(mac.to_string(), "A4:CF:12:0B:9E:7F");
        let dashed: MacAddress = "A4-CF-12-0B-9E-7F".parse().unwrap();
        assert_eq!(mac, dashed);
    }

    #[test]
    fn mac_rejects_garbage() {
        assert!("a4:cf:12:0b:9e".parse::<MacAddress>().is_err());
        assert!("a4:cf:12:0b:9e:7f:00".parse::<MacAddress>().is_err());
        assert!("zz:cf:12:0b:9e:7f".parse::<MacAddress>().is_err());
        assert!("".parse::<MacAddress>().is_err());
    }

    #[test]
    fn identity_derivation() {
        let mac = MacAddress::new([0xa4, 0xcf, 0x12, 0x0b, 0x9e, 0x7f]);
        let id = SessionIdentity::derive(mac, DEFAULT_NODE_PREFIX, "ws://10.0.0.2:8000/ws/");
        assert_eq!(id.node_id(), "esp32-s3-0b9e7f");
        assert_eq!(id.endpoint(), "ws://10.0.0.2:8000/ws/esp32-s3-0b9e7f");
        assert_eq!(id.mac(), mac);
    }
}
