//! Gossip wire protocol: UDP packets carry a JSON array of tagged
//! messages, TCP carries one push-pull state exchange per connection.
//! When a cluster key is configured every frame is AES-GCM encrypted
//! (`nonce || ciphertext`) before it leaves the process.

use crate::crypto::{frame_decrypt, frame_encrypt};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use super::GossipError;

/// Liveness of a member as seen by this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Alive,
    Suspect,
    Dead,
}

/// One gossip message.  `user` wraps an application broadcast for the
/// delegate; everything else is membership traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WireMessage {
    Ping {
        seq: u32,
        from: String,
    },
    Ack {
        seq: u32,
        from: String,
    },
    PingReq {
        seq: u32,
        target: String,
        from: String,
    },
    Alive {
        name: String,
        addr: String,
        port: u16,
        #[serde(with = "crate::b64")]
        meta: Vec<u8>,
        incarnation: u64,
    },
    Suspect {
        name: String,
        incarnation: u64,
        from: String,
    },
    Dead {
        name: String,
        incarnation: u64,
        from: String,
    },
    User {
        #[serde(with = "crate::b64")]
        data: Vec<u8>,
    },
}

/// Full state exchanged over TCP on join and periodically afterwards.
#[derive(Debug, Serialize, Deserialize)]
pub struct PushPull {
    pub join: bool,
    pub from: String,
    pub nodes: Vec<PushNodeState>,
    #[serde(with = "crate::b64")]
    pub user_state: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushNodeState {
    pub name: String,
    pub addr: String,
    pub port: u16,
    #[serde(with = "crate::b64")]
    pub meta: Vec<u8>,
    pub incarnation: u64,
    pub state: NodeStatus,
}

pub fn encode_packet(
    msgs: &[WireMessage],
    key: Option<&[u8]>,
) -> Result<Vec<u8>, GossipError> {
    let plain = serde_json::to_vec(msgs)?;
    match key {
        Some(key) => Ok(frame_encrypt(key, &plain)?),
        None => Ok(plain),
    }
}

pub fn decode_packet(buf: &[u8], key: Option<&[u8]>) -> Result<Vec<WireMessage>, GossipError> {
    let plain = match key {
        Some(key) => frame_decrypt(key, buf)?,
        None => buf.to_vec(),
    };
    Ok(serde_json::from_slice(&plain)?)
}

pub fn encode_push_pull(state: &PushPull, key: Option<&[u8]>) -> Result<Vec<u8>, GossipError> {
    let plain = serde_json::to_vec(state)?;
    match key {
        Some(key) => Ok(frame_encrypt(key, &plain)?),
        None => Ok(plain),
    }
}

pub fn decode_push_pull(buf: &[u8], key: Option<&[u8]>) -> Result<PushPull, GossipError> {
    let plain = match key {
        Some(key) => frame_decrypt(key, buf)?,
        None => buf.to_vec(),
    };
    Ok(serde_json::from_slice(&plain)?)
}

/// A parsed `addr/prefix` network used to restrict which peers may talk
/// gossip to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn parse(s: &str) -> Result<Cidr, GossipError> {
        let (addr_str, prefix_str) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| GossipError::Config(format!("invalid cidr: {s}")))?;
        let addr: IpAddr = addr_str
            .parse()
            .map_err(|_| GossipError::Config(format!("invalid cidr address: {s}")))?;
        let prefix: u8 = prefix_str
            .parse()
            .map_err(|_| GossipError::Config(format!("invalid cidr prefix: {s}")))?;
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(GossipError::Config(format!("invalid cidr prefix: {s}")));
        }
        Ok(Cidr { addr, prefix })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix as u32)
                };
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix as u32)
                };
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

/// Check an address against a CIDR allow-list.  An empty list allows
/// everything.
pub fn cidr_allowed(cidrs: &[Cidr], ip: IpAddr) -> bool {
    cidrs.is_empty() || cidrs.iter().any(|c| c.contains(ip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_aes_key;

    #[test]
    fn packet_round_trip_plain() {
        let msgs = vec![
            WireMessage::Ping {
                seq: 7,
                from: "n1".to_string(),
            },
            WireMessage::User {
                data: b"payload".to_vec(),
            },
        ];
        let buf = encode_packet(&msgs, None).unwrap();
        let back = decode_packet(&buf, None).unwrap();
        assert_eq!(back.len(), 2);
        assert!(matches!(&back[0], WireMessage::Ping { seq: 7, .. }));
        assert!(matches!(&back[1], WireMessage::User { data } if data == b"payload"));
    }

    #[test]
    fn packet_round_trip_encrypted() {
        let key = generate_aes_key();
        let msgs = vec![WireMessage::Ack {
            seq: 1,
            from: "n1".to_string(),
        }];
        let buf = encode_packet(&msgs, Some(&key)).unwrap();
        assert!(decode_packet(&buf, None).is_err());
        let back = decode_packet(&buf, Some(&key)).unwrap();
        assert!(matches!(&back[0], WireMessage::Ack { seq: 1, .. }));
    }

    #[test]
    fn encrypted_packet_rejects_wrong_key() {
        let key = generate_aes_key();
        let other = generate_aes_key();
        let buf = encode_packet(
            &[WireMessage::Ping {
                seq: 1,
                from: "n1".to_string(),
            }],
            Some(&key),
        )
        .unwrap();
        assert!(decode_packet(&buf, Some(&other)).is_err());
    }

    #[test]
    fn wire_tags_are_stable() {
        let json = serde_json::to_string(&WireMessage::PingReq {
            seq: 3,
            target: "t".to_string(),
            from: "f".to_string(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"pingReq""#));
    }

    #[test]
    fn cidr_membership() {
        let cidr = Cidr::parse("10.1.0.0/16").unwrap();
        assert!(cidr.contains("10.1.2.3".parse().unwrap()));
        assert!(!cidr.contains("10.2.0.1".parse().unwrap()));
        assert!(!cidr.contains("::1".parse().unwrap()));
    }

    #[test]
    fn cidr_rejects_garbage() {
        assert!(Cidr::parse("10.1.0.0").is_err());
        assert!(Cidr::parse("10.1.0.0/33").is_err());
        assert!(Cidr::parse("banana/8").is_err());
    }

    #[test]
    fn empty_allow_list_allows_all() {
        assert!(cidr_allowed(&[], "192.168.1.1".parse().unwrap()));
        let cidrs = vec![Cidr::parse("127.0.0.0/8").unwrap()];
        assert!(cidr_allowed(&cidrs, "127.0.0.1".parse().unwrap()));
        assert!(!cidr_allowed(&cidrs, "192.168.1.1".parse().unwrap()));
    }
}
