//! Frames exchanged over a document socket.
//!
//! Every frame is one binary WebSocket message. The first byte is a tag:
//!
//! - `0` snapshot: the rest is the full replica state as a yrs v1 update
//! - `1` update: the rest is a yrs v1 update
//! - `2` control: the rest is a JSON object tagged by `type`

use serde::{Deserialize, Serialize};
use thiserror::Error;

const TAG_SNAPSHOT: u8 = 0;
const TAG_UPDATE: u8 = 1;
const TAG_CONTROL: u8 = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Update(Vec<u8>),
    Ping,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// Full replica state, sent on join and after a rejected update.
    Snapshot(Vec<u8>),
    /// An update merged from another participant or made by the server.
    Update(Vec<u8>),
    Rejected { reason: String },
    Peers { participants: Vec<Participant> },
    Pong,
}

/// A connected user as shown to the other participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub name: String,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame tag: {0}")]
    UnknownTag(u8),
    #[error("bad control frame: {0}")]
    Control(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientControl {
    Ping,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerControl {
    Rejected { reason: String },
    Peers { participants: Vec<Participant> },
    Pong,
}

fn tagged(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(body.len() + 1);
    frame.push(tag);
    frame.extend_from_slice(body);
    frame
}

fn split(bytes: &[u8]) -> Result<(u8, &[u8]), FrameError> {
    bytes.split_first().map(|(t, rest)| (*t, rest)).ok_or(FrameError::Empty)
}

impl ClientFrame {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        Ok(match self {
            Self::Update(update) => tagged(TAG_UPDATE, update),
            Self::Ping => tagged(TAG_CONTROL, &serde_json::to_vec(&ClientControl::Ping)?),
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        match split(bytes)? {
            (TAG_UPDATE, update) => Ok(Self::Update(update.to_vec())),
            (TAG_CONTROL, json) => match serde_json::from_slice(json)? {
                ClientControl::Ping => Ok(Self::Ping),
            },
            (tag, _) => Err(FrameError::UnknownTag(tag)),
        }
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let control = match self {
            Self::Snapshot(state) => return Ok(tagged(TAG_SNAPSHOT, state)),
            Self::Update(update) => return Ok(tagged(TAG_UPDATE, update)),
            Self::Rejected { reason } => ServerControl::Rejected {
                reason: reason.clone(),
            },
            Self::Peers { participants } => ServerControl::Peers {
                participants: participants.clone(),
            },
            Self::Pong => ServerControl::Pong,
        };
        Ok(tagged(TAG_CONTROL, &serde_json::to_vec(&control)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        match split(bytes)? {
            (TAG_SNAPSHOT, state) => Ok(Self::Snapshot(state.to_vec())),
            (TAG_UPDATE, update) => Ok(Self::Update(update.to_vec())),
            (TAG_CONTROL, json) => Ok(match serde_json::from_slice(json)? {
                ServerControl::Rejected { reason } => Self::Rejected { reason },
                ServerControl::Peers { participants } => Self::Peers { participants },
                ServerControl::Pong => Self::Pong,
            }),
            (tag, _) => Err(FrameError::UnknownTag(tag)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_frame_carries_raw_bytes() {
        let frame = ClientFrame::decode(&[1, 7, 8, 9]).unwrap();
        assert_eq!(frame, ClientFrame::Update(vec![7, 8, 9]));
        assert_eq!(
            ServerFrame::Snapshot(vec![4]).encode().unwrap(),
            vec![0, 4]
        );
    }

    #[test]
    fn ping_and_pong_are_control_frames() {
        let mut ping = vec![2];
        ping.extend_from_slice(br#"{"type":"ping"}"#);
        assert_eq!(ClientFrame::decode(&ping).unwrap(), ClientFrame::Ping);

        let pong = ServerFrame::Pong.encode().unwrap();
        assert_eq!(&pong[1..], br#"{"type":"pong"}"#);
        assert_eq!(ServerFrame::decode(&pong).unwrap(), ServerFrame::Pong);
    }

    #[test]
    fn peers_frame_uses_camel_case() {
        let frame = ServerFrame::Peers {
            participants: vec![Participant {
                user_id: "ada".to_string(),
                name: "Ada".to_string(),
            }],
        };
        let bytes = frame.encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes[1..]).unwrap();
        assert_eq!(json["participants"][0]["userId"], "ada");
        assert_eq!(ServerFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn bad_frames_fail_to_decode() {
        assert!(matches!(ClientFrame::decode(&[]), Err(FrameError::Empty)));
        assert!(matches!(ClientFrame::decode(&[9, 1]), Err(FrameError::UnknownTag(9))));
        assert!(matches!(
            ClientFrame::decode(b"\x02{not json"),
            Err(FrameError::Control(_))
        ));
        assert!(matches!(ClientFrame::decode(&[0, 1]), Err(FrameError::UnknownTag(0))));
    }
}
