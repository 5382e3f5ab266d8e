// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Validated remote addresses.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::shared::error::JailError;

/// A validated, normalized remote IP address.
///
/// Every ledger and ban store lookup is keyed by an `Address`, so malformed
/// peer strings never reach the shared maps. IPv4-mapped IPv6 addresses
/// (`::ffff:a.b.c.d`) are folded into their IPv4 form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(IpAddr);

impl Address {
    /// Parse and normalize an address string.
    ///
    /// # Errors
    ///
    /// Returns [`JailError::InvalidAddress`] if `input` is not an IPv4 or
    /// IPv6 literal.
    pub fn parse(input: &str) -> Result<Self, JailError> {
        input
            .parse::<IpAddr>()
            .map(Self::from_ip)
            .map_err(|_| JailError::invalid_address(input))
    }

    /// Wrap an already parsed IP address.
    pub fn from_ip(ip: IpAddr) -> Self {
        Self(ip.to_canonical())
    }

    /// The address of a connected peer, ignoring its port.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::from_ip(addr.ip())
    }

    /// The underlying IP address.
    pub fn ip(&self) -> IpAddr {
        self.0
    }
}

impl FromStr for Address {
    type Err = JailError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = JailError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        Self::from_ip(ip)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_parse_ipv4() {
        let addr = Address::parse("203.0.113.7").unwrap();
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)));
        assert_eq!(addr.to_string(), "203.0.113.7");
    }

    #[test]
    fn test_parse_ipv6() {
        let addr = Address::parse("2001:db8::1").unwrap();
        assert_eq!(addr.to_string(), "2001:db8::1");
    }

    #[test]
    fn test_ipv4_mapped_is_folded() {
        let mapped = Address::parse("::ffff:198.51.100.20").unwrap();
        let plain = Address::parse("198.51.100.20").unwrap();
        assert_eq!(mapped, plain);
        assert_eq!(mapped.to_string(), "198.51.100.20");
    }

    #[test]
    fn test_rejects_malformed() {
        for input in ["", "localhost", "256.1.1.1", "1.2.3", "203.0.113.7:22", " 10.0.0.1"] {
            let err = Address::parse(input).unwrap_err();
            assert!(
                matches!(err, JailError::InvalidAddress { .. }),
                "{input:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_from_socket_addr_drops_port() {
        let sock: SocketAddr = "192.0.2.10:50022".parse().unwrap();
        assert_eq!(Address::from_socket_addr(sock).to_string(), "192.0.2.10");
    }

    #[test]
    fn test_serde_as_string() {
        let addr = Address::parse("192.0.2.10").unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"192.0.2.10\"");

        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);

        assert!(serde_json::from_str::<Address>("\"nope\"").is_err());
    }
}
