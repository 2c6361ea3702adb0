//! Plaintext `key=value` node profiles, one per line, stored under the
//! virtual `/.dht` directory and exchanged during topology transfer.

use crate::ring::Volcano;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, PartialEq)]
pub struct NodeProfile {
    pub nickname: String,
    pub fqdn: String,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub bandwidth: u64,
    pub storage: u64,
    pub load: f64,
    pub start_key: String,
    pub stop_key: String,
    /// Only meaningful on a `JoinNetwork`/`FinishJoinNetwork` profile:
    /// the joiner's `--secretkey`, compared by equality against the
    /// bootserver's own. Topology-broadcast profiles carry it empty.
    pub secretkey: String,
}

impl NodeProfile {
    pub fn from_volcano(v: &Volcano) -> NodeProfile {
        NodeProfile {
            nickname: v.nickname.clone(),
            fqdn: v.fqdn.clone(),
            ip: v.ip,
            port: v.port,
            bandwidth: v.bandwidth,
            storage: v.storage,
            load: v.load,
            start_key: v.start_key.as_str().to_string(),
            stop_key: v.stop_key.as_str().to_string(),
            secretkey: String::new(),
        }
    }

    /// Serialize as `key=value` lines, matching the layout used for the
    /// on-disk profile file under `/.dht`.
    pub fn to_lines(&self) -> String {
        format!(
            "nickname={}\nfqdn={}\nip={}\nport={}\nbandwidth={}\nstorage={}\nload={}\nstart_key={}\nstop_key={}\nsecretkey={}\n",
            self.nickname, self.fqdn, self.ip, self.port, self.bandwidth, self.storage, self.load,
            self.start_key, self.stop_key, self.secretkey
        )
    }

    pub fn parse(text: &str) -> Option<NodeProfile> {
        let mut fields = std::collections::HashMap::new();
        for line in text.lines() {
            if let Some((k, v)) = line.split_once('=') {
                fields.insert(k.trim(), v.trim());
            }
        }
        Some(NodeProfile {
            nickname: (*fields.get("nickname")?).to_string(),
            fqdn: (*fields.get("fqdn")?).to_string(),
            ip: fields.get("ip")?.parse().ok()?,
            port: fields.get("port")?.parse().ok()?,
            bandwidth: fields.get("bandwidth")?.parse().ok()?,
            storage: fields.get("storage")?.parse().ok()?,
            load: fields.get("load")?.parse().ok()?,
            start_key: (*fields.get("start_key")?).to_string(),
            stop_key: (*fields.get("stop_key")?).to_string(),
            secretkey: fields.get("secretkey").map(|s| s.to_string()).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_roundtrips_through_key_value_lines() {
        let v = Volcano::bootstrap("a".to_string(), "a.example".to_string(), Ipv4Addr::LOCALHOST, 12001);
        let profile = NodeProfile::from_volcano(&v);
        let text = profile.to_lines();
        let parsed = NodeProfile::parse(&text).unwrap();
        assert_eq!(parsed, profile);
    }

    #[test]
    fn parse_rejects_incomplete_profiles() {
        assert!(NodeProfile::parse("nickname=a\n").is_none());
    }
}
