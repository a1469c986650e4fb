//! WireGuard client-config text: parse and serialize (§4.2, round-trip law in §8).

use std::collections::HashMap;
use tpn_common::{Error, Result};

/// A parsed `peerK.conf` client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub private_key: String,
    pub address: String,
    pub dns: Option<String>,
    pub server_public_key: String,
    pub preshared_key: String,
    pub endpoint: String,
    pub allowed_ips: String,
}

impl ClientConfig {
    /// Serialize to WireGuard INI text. Key order is fixed so two configs
    /// that are field-equal serialize to byte-identical text (needed by the
    /// rollback invariant in §4.2, which restores "byte-identical" conf files).
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        out.push_str("[Interface]\n");
        out.push_str(&format!("PrivateKey = {}\n", self.private_key));
        out.push_str(&format!("Address = {}\n", self.address));
        if let Some(dns) = &self.dns {
            out.push_str(&format!("DNS = {}\n", dns));
        }
        out.push('\n');
        out.push_str("[Peer]\n");
        out.push_str(&format!("PublicKey = {}\n", self.server_public_key));
        out.push_str(&format!("PresharedKey = {}\n", self.preshared_key));
        out.push_str(&format!("Endpoint = {}\n", self.endpoint));
        out.push_str(&format!("AllowedIPs = {}\n", self.allowed_ips));
        out
    }

    /// Parse WireGuard INI text back into a [`ClientConfig`].
    ///
    /// Tolerant of whitespace variance around `=` and blank/comment lines,
    /// satisfying `parse(serialize(cfg)) == cfg` for all valid `cfg` (§8).
    pub fn parse(text: &str) -> Result<Self> {
        let mut fields: HashMap<String, String> = HashMap::new();
        let mut section = "";

        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') {
                section = if line.starts_with("[Interface]") {
                    "interface"
                } else if line.starts_with("[Peer]") {
                    "peer"
                } else {
                    section
                };
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = format!("{}.{}", section, key.trim().to_ascii_lowercase());
            fields.insert(key, value.trim().to_string());
        }

        let get = |k: &str| -> Result<String> {
            fields
                .get(k)
                .cloned()
                .ok_or_else(|| Error::ConfigParse(format!("missing field {k}")))
        };

        Ok(ClientConfig {
            private_key: get("interface.privatekey")?,
            address: get("interface.address")?,
            dns: fields.get("interface.dns").cloned(),
            server_public_key: get("peer.publickey")?,
            preshared_key: get("peer.presharedkey")?,
            endpoint: get("peer.endpoint")?,
            allowed_ips: get("peer.allowedips")?,
        })
    }
}

/// Best-effort shape check used by `validate_and_annotate_workers` (§4.8) to
/// split workers into valid/invalid before the parallel probe stage, without
/// fully parsing (a worker-submitted string only needs to look like a config).
pub fn looks_like_wireguard_config(text: &str) -> bool {
    text.contains("[Interface]") && text.contains("[Peer]") && text.contains("PrivateKey")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ClientConfig {
        ClientConfig {
            private_key: "cHJpdmF0ZWtleQ==".to_string(),
            address: "10.8.0.5/24".to_string(),
            dns: Some("1.1.1.1".to_string()),
            server_public_key: "c2VydmVycHVibGlja2V5".to_string(),
            preshared_key: "cHJlc2hhcmVka2V5".to_string(),
            endpoint: "vpn.example.com:51820".to_string(),
            allowed_ips: "10.8.0.5/32".to_string(),
        }
    }

    #[test]
    fn round_trips() {
        let cfg = sample();
        let text = cfg.serialize();
        let parsed = ClientConfig::parse(&text).unwrap();
        assert_eq!(cfg, parsed);
    }

    #[test]
    fn round_trips_ignoring_whitespace_variance() {
        let cfg = sample();
        let text = cfg.serialize().replace("PrivateKey = ", "PrivateKey =    ");
        let parsed = ClientConfig::parse(&text).unwrap();
        assert_eq!(cfg, parsed);
    }

    #[test]
    fn missing_field_is_a_parse_error() {
        let text = "[Interface]\nPrivateKey = x\n\n[Peer]\nPublicKey = y\n";
        assert!(ClientConfig::parse(text).is_err());
    }

    #[test]
    fn shape_check_rejects_garbage() {
        assert!(!looks_like_wireguard_config("not a config"));
        assert!(looks_like_wireguard_config(&sample().serialize()));
    }
}
