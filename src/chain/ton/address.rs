//! TON account addresses in raw (`0:<hex>`) and user-friendly base64 forms

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use std::fmt;

const BOUNCEABLE: u8 = 0x11;
const NON_BOUNCEABLE: u8 = 0x51;
const TESTNET_FLAG: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TonAddress {
    pub workchain: i8,
    pub hash: [u8; 32],
}

impl TonAddress {
    pub fn parse(address: &str) -> Option<Self> {
        if address.contains(':') {
            Self::parse_raw(address)
        } else {
            Self::parse_friendly(address)
        }
    }

    fn parse_raw(address: &str) -> Option<Self> {
        let (workchain, hash) = address.split_once(':')?;
        let workchain: i8 = workchain.parse().ok()?;
        let hash: [u8; 32] = hex::decode(hash).ok()?.try_into().ok()?;
        Some(Self { workchain, hash })
    }

    fn parse_friendly(address: &str) -> Option<Self> {
        if address.len() != 48 {
            return None;
        }
        let bytes = URL_SAFE
            .decode(address)
            .or_else(|_| STANDARD.decode(address))
            .ok()?;
        if bytes.len() != 36 {
            return None;
        }

        let tag = bytes[0] & !TESTNET_FLAG;
        if tag != BOUNCEABLE && tag != NON_BOUNCEABLE {
            return None;
        }
        let crc = crc16(&bytes[..34]);
        if bytes[34..] != crc.to_be_bytes() {
            return None;
        }

        let hash: [u8; 32] = bytes[2..34].try_into().ok()?;
        Some(Self {
            workchain: bytes[1] as i8,
            hash,
        })
    }

    pub fn to_raw(&self) -> String {
        format!("{}:{}", self.workchain, hex::encode(self.hash))
    }

    pub fn to_friendly(&self, bounceable: bool, testnet: bool) -> String {
        let mut bytes = Vec::with_capacity(36);
        let mut tag = if bounceable { BOUNCEABLE } else { NON_BOUNCEABLE };
        if testnet {
            tag |= TESTNET_FLAG;
        }
        bytes.push(tag);
        bytes.push(self.workchain as u8);
        bytes.extend_from_slice(&self.hash);
        let crc = crc16(&bytes);
        bytes.extend_from_slice(&crc.to_be_bytes());
        URL_SAFE.encode(bytes)
    }
}

impl fmt::Display for TonAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_raw())
    }
}

/// CRC-16/XMODEM
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_friendly_round_trip() {
        let address = TonAddress {
            workchain: 0,
            hash: [0x5a; 32],
        };
        for (bounceable, testnet) in [(true, false), (false, true)] {
            let friendly = address.to_friendly(bounceable, testnet);
            assert_eq!(friendly.len(), 48);
            assert_eq!(TonAddress::parse(&friendly), Some(address));
        }
    }

    #[test]
    fn test_raw_form() {
        let raw = format!("-1:{}", "ff".repeat(32));
        let address = TonAddress::parse(&raw).unwrap();
        assert_eq!(address.workchain, -1);
        assert_eq!(address.to_raw(), raw);
    }

    #[test]
    fn test_corrupted_checksum_rejected() {
        let friendly = TonAddress {
            workchain: 0,
            hash: [1; 32],
        }
        .to_friendly(true, false);
        let mut bytes = URL_SAFE.decode(&friendly).unwrap();
        bytes[35] ^= 0xff;
        assert!(TonAddress::parse(&URL_SAFE.encode(bytes)).is_none());
        assert!(TonAddress::parse("0:1234").is_none());
    }
}
