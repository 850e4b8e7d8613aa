// rust/kmeans-core/src/protocol.rs

//! Command strings carried on the join and control channels.
//!
//! Join channel lines:
//! - `"<prevId> JOIN"` answered by `"<assignedId> GOOD"`
//! - `"<id> START"` and `"<id> DONE <count>"` (no reply)
//!
//! Control frames are a header line, `\n`, then an optional encoded payload:
//! - coordinator to workers: `"<topic> REQCENTROIDS <i>"`, `"<topic> CENTROIDS <i>"`,
//!   `"<topic> ABORT <i>"`, `"<topic> DONE <i>"`, and `"<id> EVICTED <i>"` to a
//!   worker that was removed
//! - workers to coordinator: `"<id> CONTRIB <i>"`, `"<id> HEARTBEAT"`

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ClusterError, Result};
use crate::model::WorkerId;

/// Topic every worker subscribes to.
pub const BROADCAST: &str = "BROADCAST";

/// Reply sent for a join-channel request that could not be parsed.
pub const BAD_REPLY: &str = "-1 BAD";

/// Control channel topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Broadcast,
    Worker(WorkerId),
}

impl Topic {
    /// Whether a subscriber to `self` receives messages published on `published`.
    pub fn matches(&self, published: &Topic) -> bool {
        self == published
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Broadcast => f.write_str(BROADCAST),
            Topic::Worker(id) => write!(f, "{}", id),
        }
    }
}

impl FromStr for Topic {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        if s == BROADCAST {
            return Ok(Topic::Broadcast);
        }
        s.parse::<WorkerId>()
            .map(Topic::Worker)
            .map_err(|_| ClusterError::protocol(s, "unknown topic"))
    }
}

/// A request on the join/report channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMessage {
    /// `previous` is `None` for a first join (`-1`).
    Join { previous: Option<WorkerId> },
    Start { id: WorkerId },
    Done { id: WorkerId, count: u64 },
}

impl JoinMessage {
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [prev, "JOIN"] => {
                let prev: i64 = prev
                    .parse()
                    .map_err(|_| ClusterError::protocol(line, "invalid previous id"))?;
                let previous = u64::try_from(prev).ok();
                Ok(JoinMessage::Join { previous })
            }
            [id, "START"] => Ok(JoinMessage::Start {
                id: parse_id(line, id)?,
            }),
            [id, "DONE", count] => Ok(JoinMessage::Done {
                id: parse_id(line, id)?,
                count: count
                    .parse()
                    .map_err(|_| ClusterError::protocol(line, "invalid count"))?,
            }),
            _ => Err(ClusterError::protocol(line, "unrecognised join request")),
        }
    }
}

impl fmt::Display for JoinMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinMessage::Join { previous: Some(id) } => write!(f, "{} JOIN", id),
            JoinMessage::Join { previous: None } => f.write_str("-1 JOIN"),
            JoinMessage::Start { id } => write!(f, "{} START", id),
            JoinMessage::Done { id, count } => write!(f, "{} DONE {}", id, count),
        }
    }
}

pub fn join_reply(id: WorkerId) -> String {
    format!("{} GOOD", id)
}

/// Extract the assigned id from a `"<id> GOOD"` reply.
pub fn parse_join_reply(line: &str) -> Result<WorkerId> {
    match line.split_whitespace().collect::<Vec<_>>().as_slice() {
        [id, "GOOD"] => parse_id(line, id),
        _ => Err(ClusterError::protocol(line, "join rejected")),
    }
}

fn parse_id(line: &str, raw: &str) -> Result<WorkerId> {
    raw.parse()
        .map_err(|_| ClusterError::protocol(line, "invalid worker id"))
}

fn parse_iteration(line: &str, raw: &str) -> Result<u64> {
    raw.parse()
        .map_err(|_| ClusterError::protocol(line, "invalid iteration"))
}

/// Coordinator to worker command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    RequestCentroids { iteration: u64 },
    /// Followed by an encoded CentroidSet.
    Centroids { iteration: u64 },
    Abort { iteration: u64 },
    /// Unicast to a worker the coordinator has removed. It must join again.
    Evicted { iteration: u64 },
    Done { iteration: u64 },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::RequestCentroids { iteration } => write!(f, "REQCENTROIDS {}", iteration),
            Command::Centroids { iteration } => write!(f, "CENTROIDS {}", iteration),
            Command::Abort { iteration } => write!(f, "ABORT {}", iteration),
            Command::Evicted { iteration } => write!(f, "EVICTED {}", iteration),
            Command::Done { iteration } => write!(f, "DONE {}", iteration),
        }
    }
}

/// A frame published on the control channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub topic: Topic,
    pub command: Command,
    pub payload: Bytes,
}

impl ControlMessage {
    pub fn new(topic: Topic, command: Command) -> Self {
        Self {
            topic,
            command,
            payload: Bytes::new(),
        }
    }

    pub fn with_payload(topic: Topic, command: Command, payload: Bytes) -> Self {
        Self {
            topic,
            command,
            payload,
        }
    }

    pub fn encode(&self) -> Bytes {
        frame(&format!("{} {}", self.topic, self.command), &self.payload)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (header, payload) = split_frame(frame)?;
        let parts: Vec<&str> = header.split_whitespace().collect();
        let (topic, command) = match parts.as_slice() {
            [topic, cmd, iteration] => {
                let topic: Topic = topic.parse()?;
                let iteration = parse_iteration(header, iteration)?;
                let command = match *cmd {
                    "REQCENTROIDS" => Command::RequestCentroids { iteration },
                    "CENTROIDS" => Command::Centroids { iteration },
                    "ABORT" => Command::Abort { iteration },
                    "EVICTED" => Command::Evicted { iteration },
                    "DONE" => Command::Done { iteration },
                    _ => return Err(ClusterError::protocol(header, "unknown command")),
                };
                (topic, command)
            }
            _ => return Err(ClusterError::protocol(header, "malformed control header")),
        };
        Ok(Self {
            topic,
            command,
            payload,
        })
    }
}

/// A frame sent by a worker on the control return path.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamMessage {
    /// Followed by an encoded `Vec<PartialContribution>`.
    Contribution {
        worker_id: WorkerId,
        iteration: u64,
        payload: Bytes,
    },
    Heartbeat {
        worker_id: WorkerId,
    },
}

impl UpstreamMessage {
    pub fn worker_id(&self) -> WorkerId {
        match self {
            UpstreamMessage::Contribution { worker_id, .. } => *worker_id,
            UpstreamMessage::Heartbeat { worker_id } => *worker_id,
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            UpstreamMessage::Contribution {
                worker_id,
                iteration,
                payload,
            } => frame(&format!("{} CONTRIB {}", worker_id, iteration), payload),
            UpstreamMessage::Heartbeat { worker_id } => {
                frame(&format!("{} HEARTBEAT", worker_id), &[])
            }
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (header, payload) = split_frame(frame)?;
        match header.split_whitespace().collect::<Vec<_>>().as_slice() {
            [id, "CONTRIB", iteration] => Ok(UpstreamMessage::Contribution {
                worker_id: parse_id(header, id)?,
                iteration: parse_iteration(header, iteration)?,
                payload,
            }),
            [id, "HEARTBEAT"] => Ok(UpstreamMessage::Heartbeat {
                worker_id: parse_id(header, id)?,
            }),
            _ => Err(ClusterError::protocol(header, "unrecognised upstream message")),
        }
    }
}

fn frame(header: &str, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(header.len() + 1 + payload.len());
    buf.put_slice(header.as_bytes());
    buf.put_u8(b'\n');
    buf.put_slice(payload);
    buf.freeze()
}

fn split_frame(frame: &[u8]) -> Result<(&str, Bytes)> {
    let (header, payload) = match frame.iter().position(|&b| b == b'\n') {
        Some(pos) => (&frame[..pos], &frame[pos + 1..]),
        None => (frame, &frame[frame.len()..]),
    };
    let header = std::str::from_utf8(header)
        .map_err(|_| ClusterError::protocol(String::from_utf8_lossy(header), "header is not UTF-8"))?;
    Ok((header, Bytes::copy_from_slice(payload)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_join_messages() {
        assert_eq!(
            JoinMessage::parse("-1 JOIN").unwrap(),
            JoinMessage::Join { previous: None }
        );
        assert_eq!(
            JoinMessage::parse("4 JOIN").unwrap(),
            JoinMessage::Join { previous: Some(4) }
        );
        assert_eq!(JoinMessage::parse("2 START").unwrap(), JoinMessage::Start { id: 2 });
        assert_eq!(
            JoinMessage::parse("2 DONE 40").unwrap(),
            JoinMessage::Done { id: 2, count: 40 }
        );
        assert!(JoinMessage::parse("2 DONE").is_err());
        assert!(JoinMessage::parse("x JOIN").is_err());
        assert!(JoinMessage::parse("").is_err());
    }

    #[test]
    fn test_join_message_display() {
        assert_eq!(JoinMessage::Join { previous: None }.to_string(), "-1 JOIN");
        assert_eq!(JoinMessage::Done { id: 3, count: 12 }.to_string(), "3 DONE 12");
    }

    #[test]
    fn test_join_reply() {
        assert_eq!(join_reply(7), "7 GOOD");
        assert_eq!(parse_join_reply("7 GOOD").unwrap(), 7);
        assert!(parse_join_reply(BAD_REPLY).is_err());
    }

    #[test]
    fn test_topic_parse_and_display() {
        assert_eq!("BROADCAST".parse::<Topic>().unwrap(), Topic::Broadcast);
        assert_eq!("12".parse::<Topic>().unwrap(), Topic::Worker(12));
        assert_eq!(Topic::Worker(12).to_string(), "12");
        assert!("everyone".parse::<Topic>().is_err());
        assert!(Topic::Worker(1).matches(&Topic::Worker(1)));
        assert!(!Topic::Worker(1).matches(&Topic::Broadcast));
    }

    #[test]
    fn test_control_message_header_and_payload() {
        let msg = ControlMessage::with_payload(
            Topic::Broadcast,
            Command::Centroids { iteration: 3 },
            Bytes::from_static(b"\x00\x01\nbinary"),
        );
        let encoded = msg.encode();
        assert!(encoded.starts_with(b"BROADCAST CENTROIDS 3\n"));

        let decoded = ControlMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_control_message_without_payload() {
        let msg = ControlMessage::new(Topic::Worker(5), Command::RequestCentroids { iteration: 0 });
        assert_eq!(&msg.encode()[..], b"5 REQCENTROIDS 0\n");
        // A bare header without the trailing newline is accepted too
        let decoded = ControlMessage::decode(b"5 REQCENTROIDS 0").unwrap();
        assert_eq!(decoded, msg);

        let evicted = ControlMessage::decode(b"3 EVICTED 4\n").unwrap();
        assert_eq!(evicted.topic, Topic::Worker(3));
        assert_eq!(evicted.command, Command::Evicted { iteration: 4 });
    }

    #[test]
    fn test_malformed_control_messages() {
        assert!(ControlMessage::decode(b"BROADCAST JUMP 1\n").is_err());
        assert!(ControlMessage::decode(b"BROADCAST REQCENTROIDS\n").is_err());
        assert!(ControlMessage::decode(b"nobody ABORT 1\n").is_err());
        assert!(ControlMessage::decode(&[0xff, 0xfe, b'\n']).is_err());
    }

    #[test]
    fn test_upstream_messages() {
        let msg = UpstreamMessage::Contribution {
            worker_id: 9,
            iteration: 2,
            payload: Bytes::from_static(b"abc"),
        };
        let decoded = UpstreamMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.worker_id(), 9);

        let hb = UpstreamMessage::decode(b"4 HEARTBEAT\n").unwrap();
        assert_eq!(hb, UpstreamMessage::Heartbeat { worker_id: 4 });

        assert!(UpstreamMessage::decode(b"4 CONTRIB\n").is_err());
    }
}
