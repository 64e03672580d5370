//! Controller identity: model and network settings

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use super::register_map::{MAC_REGS, NETWORK_REGS, TITLE_REGS};
use crate::codec::{encode_utf16_text, RegisterCursor};
use crate::error::{Result, StationError};

/// Hardware address, displayed as lower-case colon-hex
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// One octet per register, low byte
    pub fn from_registers(regs: &[u16]) -> Result<Self> {
        if regs.len() < MAC_REGS as usize {
            return Err(StationError::data(format!(
                "Hardware address needs {MAC_REGS} registers, got {}",
                regs.len()
            )));
        }
        let mut octets = [0u8; 6];
        for (octet, reg) in octets.iter_mut().zip(regs) {
            *octet = (reg & 0xFF) as u8;
        }
        Ok(Self(octets))
    }

    pub fn to_registers(&self) -> [u16; 6] {
        self.0.map(u16::from)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = StationError;

    /// Accepts `aa:bb:cc:dd:ee:ff` or `AA-BB-CC-DD-EE-FF`
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || StationError::validation(format!("Invalid hardware address '{s}'"));
        let parts: Vec<&str> = s.trim().split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(invalid());
        }
        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        Ok(Self(octets))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: u32,
    pub version: u16,
    pub title: String,
}

impl ModelInfo {
    pub fn from_registers(regs: &[u16]) -> Result<Self> {
        let mut cur = RegisterCursor::new(regs);
        Ok(Self {
            id: cur.u32()?,
            version: cur.u16()?,
            title: cur.text(TITLE_REGS)?,
        })
    }

    pub fn to_registers(&self) -> Vec<u16> {
        let mut regs = vec![(self.id >> 16) as u16, (self.id & 0xFFFF) as u16, self.version];
        regs.extend(encode_utf16_text(&self.title, TITLE_REGS));
        regs
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkAddress {
    pub ip: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub mac: MacAddress,
}

impl NetworkAddress {
    pub fn from_registers(regs: &[u16]) -> Result<Self> {
        let mut cur = RegisterCursor::new(regs);
        let ip = ipv4(cur.take(2)?);
        let mask = ipv4(cur.take(2)?);
        let gateway = ipv4(cur.take(2)?);
        let mac = MacAddress::from_registers(cur.take(MAC_REGS as usize)?)?;
        Ok(Self {
            ip,
            mask,
            gateway,
            mac,
        })
    }

    pub fn to_registers(&self) -> Vec<u16> {
        let mut regs = Vec::with_capacity(NETWORK_REGS as usize);
        for addr in [self.ip, self.mask, self.gateway] {
            let [a, b, c, d] = addr.octets();
            regs.push(u16::from_be_bytes([a, b]));
            regs.push(u16::from_be_bytes([c, d]));
        }
        regs.extend(self.mac.to_registers());
        regs
    }
}

/// High byte of the first register is the first octet
fn ipv4(regs: &[u16]) -> Ipv4Addr {
    let [a, b] = regs[0].to_be_bytes();
    let [c, d] = regs[1].to_be_bytes();
    Ipv4Addr::new(a, b, c, d)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_mac_parse_and_display() {
        let mac: MacAddress = "00:1A:2b:3c:4D:5e".parse().unwrap();
        assert_eq!(mac.to_string(), "00:1a:2b:3c:4d:5e");
        assert_eq!("00-1A-2B-3C-4D-5E".parse::<MacAddress>().unwrap(), mac);

        for bad in ["00:1a:2b:3c:4d", "00:1a:2b:3c:4d:5e:6f", "0:1a:2b:3c:4d:5e", "zz:1a:2b:3c:4d:5e"] {
            assert!(bad.parse::<MacAddress>().is_err(), "{bad}");
        }
    }

    #[test]
    fn test_mac_from_registers_uses_low_byte() {
        let mac = MacAddress::from_registers(&[0xAB00, 0x0011, 0xFF22, 0x33, 0x44, 0x55]).unwrap();
        assert_eq!(mac.to_string(), "00:11:22:33:44:55");
        assert!(MacAddress::from_registers(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_model_decode() {
        let model = ModelInfo {
            id: 0x0001_0203,
            version: 7,
            title: "PS-200 泵站".to_string(),
        };
        let regs = model.to_registers();
        assert_eq!(regs.len(), 19);
        assert_eq!(&regs[..3], &[0x0001, 0x0203, 7]);
        assert_eq!(ModelInfo::from_registers(&regs).unwrap(), model);
    }

    #[test]
    fn test_network_decode() {
        let regs = [
            0xC0A8, 0x010A, // 192.168.1.10
            0xFFFF, 0xFF00, // 255.255.255.0
            0xC0A8, 0x0101, // 192.168.1.1
            0x00, 0x1A, 0x2B, 0x3C, 0x4D, 0x5E,
        ];
        let net = NetworkAddress::from_registers(&regs).unwrap();
        assert_eq!(net.ip, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(net.mask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(net.gateway, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(net.mac.to_string(), "00:1a:2b:3c:4d:5e");
        assert_eq!(net.to_registers(), regs.to_vec());
    }
}
