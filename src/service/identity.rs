// Copyright 2025 jonefeewang@gmail.com
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

use std::net::{IpAddr, UdpSocket};

use chrono::Utc;
use rand::RngCore;
use tracing::debug;

/// Creates a unique id that identifies this particular proxy in both Kafka
/// and the coordination service.
///
/// The format is `pixy_<host>_<timestamp>_<pid>`. Kafka client id validation
/// does not allow ':' characters, so they are replaced in the timestamp.
pub fn new_client_id() -> String {
    let host = hostname()
        .or_else(|| local_ip().map(|ip| ip.to_string()))
        .unwrap_or_else(random_host);
    let timestamp = Utc::now()
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string()
        .replace(':', ".");
    let client_id = format!("pixy_{}_{}_{}", host, timestamp, std::process::id());
    debug!("generated client id {}", client_id);
    client_id
}

/// `HOSTNAME` from the environment, then `/etc/hostname` on Linux. Other
/// platforms without `HOSTNAME` fall back to the local address.
fn hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(etc_hostname)
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

#[cfg(target_os = "linux")]
fn etc_hostname() -> Option<String> {
    std::fs::read_to_string("/etc/hostname").ok()
}

#[cfg(not(target_os = "linux"))]
fn etc_hostname() -> Option<String> {
    None
}

// No packets are sent: connecting a UDP socket only selects the outbound
// interface, which is enough to learn the local address.
fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_loopback() && !ip.is_unspecified()).then_some(ip)
}

fn random_host() -> String {
    let mut buffer = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut buffer);
    buffer.iter().map(|b| format!("{:02X}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_format() {
        let client_id = new_client_id();
        assert!(client_id.starts_with("pixy_"));
        assert!(!client_id.contains(':'));
        assert!(client_id.ends_with(&format!("_{}", std::process::id())));
    }

    #[test]
    fn test_random_host_is_hex() {
        let host = random_host();
        assert_eq!(host.len(), 16);
        assert!(host.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
