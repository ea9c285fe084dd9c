//! Networking primitives.
//!
//! Datagram layout:
//! - 4-byte big-endian header. `0xFFFF_FFFF` marks a connectionless
//!   packet; otherwise the low 31 bits are the netchan sequence and the high
//!   bit flags a fragment.
//! - Client → server sequenced packets carry a 2-byte qport next, so a
//!   client behind a NAT that changes its port is still recognised.
//! - Fragments carry 4-byte start offset and 4-byte length.
//! - The payload is a serde_json message (`Oob`, `ClientMessage` or
//!   `ServerMessage`).

use anyhow::{bail, Context};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::{net::UdpSocket, time};
use tracing::debug;

use crate::entity_state::{EntityDelta, EntityState, PlayerStateDelta, UserCmd};

const CONNECTIONLESS: u32 = u32::MAX;
const FRAGMENT_BIT: u32 = 1 << 31;

/// Messages at least this long are split into fragments.
pub const FRAGMENT_SIZE: usize = 1300;
/// Largest reassembled message accepted.
pub const MAX_MSGLEN: usize = 1 << 20;
pub const MAX_PACKETLEN: usize = 64 * 1024;

/// Out-of-band messages exchanged before (or outside) a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "oob", rename_all = "camelCase")]
pub enum Oob {
    GetChallenge { client_challenge: i32 },
    ChallengeResponse { challenge: i32, client_challenge: i32 },
    /// Userinfo carries `protocol`, `qport` and `challenge`.
    Connect { userinfo: String },
    ConnectResponse { challenge: i32 },
    Print { text: String },
    Disconnect,
    GetStatus { challenge: String },
    StatusResponse { info: String, players: Vec<PlayerStatus> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerStatus {
    pub score: i32,
    pub ping: i32,
    pub name: String,
}

/// A reliable string command with its sequence number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReliableCommand {
    pub sequence: i32,
    pub text: String,
}

/// Server → client sequenced message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerMessage {
    /// Last client command sequence the server has received.
    pub reliable_acknowledge: i32,
    /// Every server command the client has not acknowledged, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<ReliableCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gamestate: Option<Gamestate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotMsg>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download: Option<DownloadBlock>,
}

/// Everything a client needs before its first snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Gamestate {
    /// Server command sequence at the time the gamestate was built.
    pub command_sequence: i32,
    pub configstrings: Vec<(usize, String)>,
    pub baselines: Vec<EntityState>,
    pub client_num: usize,
    pub checksum_feed: i32,
    pub server_id: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum EntityChange {
    Remove,
    Delta { delta: EntityDelta },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityUpdate {
    pub number: usize,
    #[serde(flatten)]
    pub change: EntityChange,
}

/// One snapshot, possibly delta-compressed against an earlier one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotMsg {
    pub server_time: i32,
    /// Sequence of the message carrying this snapshot.
    pub message_num: i32,
    /// Message number of the reference snapshot; `None` for a full snapshot.
    pub delta_num: Option<i32>,
    pub snap_flags: i32,
    pub player_state: PlayerStateDelta,
    /// Updates in strictly increasing entity number.
    pub entities: Vec<EntityUpdate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadBlock {
    pub block: i32,
    /// Set on block 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
    /// Empty data marks end of file.
    #[serde(default)]
    pub data: Vec<u8>,
    /// Refusal message; ends the transfer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Client → server sequenced message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientMessage {
    pub server_id: i32,
    /// Last server message number received.
    pub message_acknowledge: i32,
    /// Last server command sequence executed.
    pub reliable_acknowledge: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<ReliableCommand>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usercmds: Vec<UserCmd>,
    /// Ask for a full snapshot.
    #[serde(default)]
    pub no_delta: bool,
}

/// A parsed datagram header with its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Datagram {
    Connectionless(Bytes),
    Sequenced {
        sequence: i32,
        qport: Option<u16>,
        fragment: Option<(u32, u32)>,
        body: Bytes,
    },
}

/// Parses a raw datagram. `with_qport` is set on the server side.
pub fn decode_datagram(buf: &[u8], with_qport: bool) -> anyhow::Result<Datagram> {
    let mut b = buf;
    if b.remaining() < 4 {
        bail!("runt packet ({} bytes)", buf.len());
    }
    let header = b.get_u32();
    if header == CONNECTIONLESS {
        return Ok(Datagram::Connectionless(Bytes::copy_from_slice(b)));
    }

    let qport = if with_qport {
        if b.remaining() < 2 {
            bail!("missing qport");
        }
        Some(b.get_u16())
    } else {
        None
    };

    let fragment = if header & FRAGMENT_BIT != 0 {
        if b.remaining() < 8 {
            bail!("truncated fragment header");
        }
        Some((b.get_u32(), b.get_u32()))
    } else {
        None
    };

    Ok(Datagram::Sequenced {
        sequence: (header & !FRAGMENT_BIT) as i32,
        qport,
        fragment,
        body: Bytes::copy_from_slice(b),
    })
}

/// Frames a connectionless message.
pub fn encode_oob(msg: &Oob) -> anyhow::Result<Bytes> {
    let payload = serde_json::to_vec(msg).context("serialize oob")?;
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(CONNECTIONLESS);
    buf.extend_from_slice(&payload);
    Ok(buf.freeze())
}

pub fn decode_oob(body: &[u8]) -> anyhow::Result<Oob> {
    serde_json::from_slice(body).context("deserialize oob")
}

/// Serializes a sequenced message payload.
pub fn encode_payload<T: Serialize>(msg: &T) -> anyhow::Result<Bytes> {
    let payload = serde_json::to_vec(msg).context("serialize")?;
    if payload.len() > MAX_MSGLEN {
        bail!("message of {} bytes exceeds MAX_MSGLEN", payload.len());
    }
    Ok(Bytes::from(payload))
}

pub fn decode_payload<T: DeserializeOwned>(b: &[u8]) -> anyhow::Result<T> {
    serde_json::from_slice(b).context("deserialize")
}

/// Sequenced channel state for one peer.
///
/// Packets older than or equal to the last accepted sequence are dropped;
/// gaps are counted but not recovered (reliability is layered above).
#[derive(Debug, Clone)]
pub struct Netchan {
    pub remote: SocketAddr,
    pub qport: u16,
    pub outgoing_sequence: i32,
    pub incoming_sequence: i32,
    /// Packets lost before the last accepted one.
    pub dropped: i32,
    fragment_sequence: i32,
    fragment_buffer: BytesMut,
}

impl Netchan {
    pub fn new(remote: SocketAddr, qport: u16) -> Self {
        Self {
            remote,
            qport,
            outgoing_sequence: 1,
            incoming_sequence: 0,
            dropped: 0,
            fragment_sequence: 0,
            fragment_buffer: BytesMut::new(),
        }
    }

    /// Frames `payload` under the next outgoing sequence, splitting it into
    /// fragments when it is too long for one datagram.
    pub fn transmit(&mut self, payload: &[u8], include_qport: bool) -> Vec<Bytes> {
        let sequence = self.outgoing_sequence as u32;
        self.outgoing_sequence += 1;

        let frame = |flags: u32, fragment: Option<(usize, &[u8])>, data: &[u8]| {
            let mut buf = BytesMut::with_capacity(14 + data.len());
            buf.put_u32(sequence | flags);
            if include_qport {
                buf.put_u16(self.qport);
            }
            if let Some((start, chunk)) = fragment {
                buf.put_u32(start as u32);
                buf.put_u32(chunk.len() as u32);
            }
            buf.extend_from_slice(data);
            buf.freeze()
        };

        if payload.len() < FRAGMENT_SIZE {
            return vec![frame(0, None, payload)];
        }

        // A final fragment shorter than FRAGMENT_SIZE (possibly empty) ends
        // the message.
        let mut out = Vec::with_capacity(payload.len() / FRAGMENT_SIZE + 1);
        let mut start = 0;
        loop {
            let end = (start + FRAGMENT_SIZE).min(payload.len());
            let chunk = &payload[start..end];
            out.push(frame(FRAGMENT_BIT, Some((start, chunk)), chunk));
            if chunk.len() < FRAGMENT_SIZE {
                break;
            }
            start = end;
        }
        out
    }

    /// Accepts an incoming sequenced packet. Returns the complete message
    /// when one is available.
    pub fn process(&mut self, sequence: i32, fragment: Option<(u32, u32)>, body: Bytes) -> Option<Bytes> {
        if sequence <= self.incoming_sequence {
            debug!(remote = %self.remote, sequence, last = self.incoming_sequence, "out of order packet");
            return None;
        }

        let body = match fragment {
            None => body,
            Some((start, len)) => {
                if sequence != self.fragment_sequence {
                    self.fragment_sequence = sequence;
                    self.fragment_buffer.clear();
                }
                if start as usize != self.fragment_buffer.len() || len as usize != body.len() {
                    debug!(remote = %self.remote, sequence, "dropped a message fragment");
                    return None;
                }
                if self.fragment_buffer.len() + body.len() > MAX_MSGLEN {
                    debug!(remote = %self.remote, "fragment length exceeds MAX_MSGLEN");
                    return None;
                }
                self.fragment_buffer.extend_from_slice(&body);
                if body.len() == FRAGMENT_SIZE {
                    return None;
                }
                self.fragment_buffer.split().freeze()
            }
        };

        self.dropped = sequence - (self.incoming_sequence + 1);
        if self.dropped > 0 {
            debug!(remote = %self.remote, dropped = self.dropped, sequence, "dropped packets");
        }
        self.incoming_sequence = sequence;
        Some(body)
    }
}

/// Client-side datagram socket bound to one server.
#[derive(Debug)]
pub struct UnreliableConn {
    socket: UdpSocket,
}

impl UnreliableConn {
    pub async fn connect(bind_addr: SocketAddr, peer: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.context("udp bind")?;
        socket.connect(peer).await.context("udp connect")?;
        Ok(Self { socket })
    }

    pub async fn send(&self, datagram: &[u8]) -> anyhow::Result<()> {
        self.socket.send(datagram).await.context("udp send")?;
        Ok(())
    }

    pub async fn send_oob(&self, msg: &Oob) -> anyhow::Result<()> {
        self.send(&encode_oob(msg)?).await
    }

    /// Receives a datagram within the given timeout.
    pub async fn recv_timeout(&self, timeout: std::time::Duration) -> anyhow::Result<Option<Datagram>> {
        let mut buf = vec![0u8; MAX_PACKETLEN];
        match time::timeout(timeout, self.socket.recv(&mut buf)).await {
            Ok(Ok(n)) => Ok(Some(decode_datagram(&buf[..n], false)?)),
            Ok(Err(e)) => Err(e).context("udp recv")?,
            Err(_) => Ok(None),
        }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:29070".parse().unwrap()
    }

    #[test]
    fn oob_frames_are_connectionless() {
        let bytes = encode_oob(&Oob::GetChallenge { client_challenge: 7 }).unwrap();
        match decode_datagram(&bytes, true).unwrap() {
            Datagram::Connectionless(body) => {
                assert_eq!(decode_oob(&body).unwrap(), Oob::GetChallenge { client_challenge: 7 });
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn netchan_drops_stale_sequences() {
        let mut tx = Netchan::new(addr(), 5);
        let mut rx = Netchan::new(addr(), 5);
        let first = tx.transmit(b"one", true).remove(0);
        let second = tx.transmit(b"two", true).remove(0);

        for (raw, expect) in [(&second, Some("two")), (&first, None)] {
            let Datagram::Sequenced { sequence, qport, fragment, body } = decode_datagram(raw, true).unwrap() else {
                panic!("expected sequenced");
            };
            assert_eq!(qport, Some(5));
            let got = rx.process(sequence, fragment, body);
            assert_eq!(got.as_deref(), expect.map(str::as_bytes));
        }
        assert_eq!(rx.dropped, 1);
    }

    #[test]
    fn large_messages_are_fragmented_and_reassembled() {
        let payload: Vec<u8> = (0..FRAGMENT_SIZE * 2).map(|i| (i % 251) as u8).collect();
        let mut tx = Netchan::new(addr(), 0);
        let mut rx = Netchan::new(addr(), 0);
        let frames = tx.transmit(&payload, false);
        assert_eq!(frames.len(), 3);

        let mut done = None;
        for raw in frames {
            let Datagram::Sequenced { sequence, fragment, body, .. } = decode_datagram(&raw, false).unwrap() else {
                panic!("expected sequenced");
            };
            assert!(fragment.is_some());
            done = rx.process(sequence, fragment, body);
        }
        assert_eq!(done.as_deref(), Some(&payload[..]));
    }

    #[test]
    fn client_message_omits_empty_fields() {
        let json = String::from_utf8(encode_payload(&ClientMessage::default()).unwrap().to_vec()).unwrap();
        assert!(!json.contains("commands"));
        assert!(!json.contains("usercmds"));
    }
}
