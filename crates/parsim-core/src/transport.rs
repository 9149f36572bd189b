//! Cross-machine transport: wire codec, message substrate, I/O thread.
//!
//! Event frames are hand-packed little-endian in the fixed layout
//!
//! ```text
//!   u32  type_id
//!   i64  delivery_time_ticks
//!   u64  tiebreak            (sender-side per-pair sequence)
//!   u32  destination_name_length
//!   u8[] destination_name
//!   u32  payload_length
//!   u8[] payload             (event's pack() output)
//! ```
//!
//! Frames are concatenated, length-prefixed, into per-destination sections
//! inside one epoch message per peer machine per barrier; the same message
//! carries the sender's reduction inputs so the whole exchange is one send
//! and one receive per peer.
//!
//! The transport is agnostic to the substrate underneath: anything that can
//! move byte buffers between ranks qualifies. [`mesh`] builds the in-process
//! case over std mpsc channels. The worker pool never touches the substrate
//! directly; a dedicated I/O thread owns it, reached through bounded
//! request/reply queues.

use std::sync::mpsc::{Receiver, Sender, SyncSender, channel, sync_channel};
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

// ---------------------------------------------------------------------------
// Substrate
// ---------------------------------------------------------------------------

/// A rank-addressed message-passing layer.
pub trait Substrate: Send {
    fn machine_index(&self) -> usize;
    fn num_machines(&self) -> usize;
    /// Send a buffer to a peer rank.
    fn send(&self, to: usize, payload: Vec<u8>) -> Result<(), TransportError>;
    /// Blocking receive of the next buffer from a specific peer rank.
    fn recv(&self, from: usize) -> Result<Vec<u8>, TransportError>;
}

/// In-process substrate: one mpsc channel per directed rank pair. Returns
/// one endpoint per rank; move each into its machine's kernel.
pub fn mesh(n: usize) -> Vec<MeshSubstrate> {
    let mut txs: Vec<Vec<Option<Sender<Vec<u8>>>>> = (0..n)
        .map(|_| (0..n).map(|_| None).collect())
        .collect();
    let mut rxs: Vec<Vec<Option<Receiver<Vec<u8>>>>> = (0..n)
        .map(|_| (0..n).map(|_| None).collect())
        .collect();
    for from in 0..n {
        for to in 0..n {
            if from == to {
                continue;
            }
            let (tx, rx) = channel();
            txs[from][to] = Some(tx);
            rxs[to][from] = Some(rx);
        }
    }
    txs.into_iter()
        .zip(rxs)
        .enumerate()
        .map(|(index, (tx_row, rx_row))| MeshSubstrate {
            index,
            n,
            txs: tx_row,
            rxs: rx_row,
        })
        .collect()
}

/// One rank's endpoint of an in-process mesh.
pub struct MeshSubstrate {
    index: usize,
    n: usize,
    txs: Vec<Option<Sender<Vec<u8>>>>,
    rxs: Vec<Option<Receiver<Vec<u8>>>>,
}

impl Substrate for MeshSubstrate {
    fn machine_index(&self) -> usize {
        self.index
    }

    fn num_machines(&self) -> usize {
        self.n
    }

    fn send(&self, to: usize, payload: Vec<u8>) -> Result<(), TransportError> {
        self.txs
            .get(to)
            .and_then(|tx| tx.as_ref())
            .ok_or(TransportError::Closed { peer: to })?
            .send(payload)
            .map_err(|_| TransportError::Closed { peer: to })
    }

    fn recv(&self, from: usize) -> Result<Vec<u8>, TransportError> {
        self.rxs
            .get(from)
            .and_then(|rx| rx.as_ref())
            .ok_or(TransportError::Closed { peer: from })?
            .recv()
            .map_err(|_| TransportError::Closed { peer: from })
    }
}

// ---------------------------------------------------------------------------
// Wire codec
// ---------------------------------------------------------------------------

/// One event on the wire.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WireFrame {
    pub type_id: u32,
    pub deliver_ticks: i64,
    pub tiebreak: u64,
    pub name: String,
    pub payload: Vec<u8>,
}

/// All frames one source timeline sent to one machine during one epoch.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WireSection {
    pub src_gid: u32,
    pub frames: Vec<WireFrame>,
}

/// The per-peer barrier exchange message.
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct EpochMessage {
    pub epoch: u64,
    /// Lower-bound reports for the sender's timelines, in ticks.
    pub reports: Vec<(u32, i64)>,
    /// Minimum frame delivery time per destination timeline, over every
    /// frame the sender ships this epoch to any machine. Folded into the
    /// reduction by all receivers.
    pub frame_mins: Vec<(u32, i64)>,
    /// Event sections addressed to the receiving machine.
    pub sections: Vec<WireSection>,
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], TransportError> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len());
        match end {
            Some(end) => {
                let slice = &self.buf[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(TransportError::Codec {
                detail: format!("truncated buffer at offset {}", self.pos),
            }),
        }
    }

    fn u32(&mut self) -> Result<u32, TransportError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, TransportError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, TransportError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn done(&self) -> bool {
        self.pos == self.buf.len()
    }
}

pub(crate) fn encode_frame(frame: &WireFrame, buf: &mut Vec<u8>) {
    put_u32(buf, frame.type_id);
    put_i64(buf, frame.deliver_ticks);
    put_u64(buf, frame.tiebreak);
    put_u32(buf, frame.name.len() as u32);
    buf.extend_from_slice(frame.name.as_bytes());
    put_u32(buf, frame.payload.len() as u32);
    buf.extend_from_slice(&frame.payload);
}

fn decode_frame(cursor: &mut Cursor<'_>) -> Result<WireFrame, TransportError> {
    let type_id = cursor.u32()?;
    let deliver_ticks = cursor.i64()?;
    let tiebreak = cursor.u64()?;
    let name_len = cursor.u32()? as usize;
    let name = std::str::from_utf8(cursor.take(name_len)?)
        .map_err(|_| TransportError::Codec {
            detail: "destination name is not utf-8".into(),
        })?
        .to_string();
    let payload_len = cursor.u32()? as usize;
    let payload = cursor.take(payload_len)?.to_vec();
    Ok(WireFrame {
        type_id,
        deliver_ticks,
        tiebreak,
        name,
        payload,
    })
}

pub(crate) fn encode_epoch_message(msg: &EpochMessage) -> Vec<u8> {
    let mut buf = Vec::new();
    put_u64(&mut buf, msg.epoch);
    put_u32(&mut buf, msg.reports.len() as u32);
    for &(gid, ticks) in &msg.reports {
        put_u32(&mut buf, gid);
        put_i64(&mut buf, ticks);
    }
    put_u32(&mut buf, msg.frame_mins.len() as u32);
    for &(gid, ticks) in &msg.frame_mins {
        put_u32(&mut buf, gid);
        put_i64(&mut buf, ticks);
    }
    put_u32(&mut buf, msg.sections.len() as u32);
    for section in &msg.sections {
        put_u32(&mut buf, section.src_gid);
        put_u32(&mut buf, section.frames.len() as u32);
        for frame in &section.frames {
            // Length prefix lets a receiver skip frames it cannot parse.
            let mut body = Vec::new();
            encode_frame(frame, &mut body);
            put_u32(&mut buf, body.len() as u32);
            buf.extend_from_slice(&body);
        }
    }
    buf
}

pub(crate) fn decode_epoch_message(buf: &[u8]) -> Result<EpochMessage, TransportError> {
    let mut cursor = Cursor::new(buf);
    let epoch = cursor.u64()?;
    let nreports = cursor.u32()? as usize;
    let mut reports = Vec::with_capacity(nreports);
    for _ in 0..nreports {
        let gid = cursor.u32()?;
        let ticks = cursor.i64()?;
        reports.push((gid, ticks));
    }
    let nmins = cursor.u32()? as usize;
    let mut frame_mins = Vec::with_capacity(nmins);
    for _ in 0..nmins {
        let gid = cursor.u32()?;
        let ticks = cursor.i64()?;
        frame_mins.push((gid, ticks));
    }
    let nsections = cursor.u32()? as usize;
    let mut sections = Vec::with_capacity(nsections);
    for _ in 0..nsections {
        let src_gid = cursor.u32()?;
        let nframes = cursor.u32()? as usize;
        let mut frames = Vec::with_capacity(nframes);
        for _ in 0..nframes {
            let body_len = cursor.u32()? as usize;
            let body = cursor.take(body_len)?;
            let mut inner = Cursor::new(body);
            let frame = decode_frame(&mut inner)?;
            if !inner.done() {
                return Err(TransportError::Codec {
                    detail: "trailing bytes after frame".into(),
                });
            }
            frames.push(frame);
        }
        sections.push(WireSection { src_gid, frames });
    }
    if !cursor.done() {
        return Err(TransportError::Codec {
            detail: "trailing bytes after epoch message".into(),
        });
    }
    Ok(EpochMessage {
        epoch,
        reports,
        frame_mins,
        sections,
    })
}

// ---------------------------------------------------------------------------
// Setup gossip
// ---------------------------------------------------------------------------

/// Round-one gossip: each machine advertises its timeline count and named
/// input channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct HelloGossip {
    pub timelines: usize,
    pub channels: Vec<ChannelAd>,
}

/// A named input channel advertisement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ChannelAd {
    pub name: String,
    /// Machine-local timeline index.
    pub timeline: usize,
    /// Timeline-local input channel slot.
    pub ic_slot: usize,
}

/// Round-two gossip: lookahead edges contributed by this machine's resolved
/// mappings, in global timeline ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EdgeGossip {
    pub edges: Vec<(usize, usize, i64)>,
}

pub(crate) fn encode_gossip<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    serde_json::to_vec(value).map_err(|e| TransportError::Codec {
        detail: format!("gossip encode: {e}"),
    })
}

pub(crate) fn decode_gossip<T: for<'de> Deserialize<'de>>(
    buf: &[u8],
) -> Result<T, TransportError> {
    serde_json::from_slice(buf).map_err(|e| TransportError::Codec {
        detail: format!("gossip decode: {e}"),
    })
}

// ---------------------------------------------------------------------------
// I/O thread
// ---------------------------------------------------------------------------

enum IoRequest {
    /// All-to-all: one buffer out to every peer, one buffer back from each.
    Exchange {
        outbound: Vec<(usize, Vec<u8>)>,
        reply: Sender<Result<Vec<(usize, Vec<u8>)>, TransportError>>,
    },
    Shutdown,
}

/// Owns the substrate on a dedicated I/O thread. Workers reach it only
/// through bounded request/reply queues.
pub(crate) struct TransportHandle {
    machine: usize,
    machines: usize,
    tx: SyncSender<IoRequest>,
    join: Option<JoinHandle<()>>,
}

impl TransportHandle {
    pub fn spawn(substrate: Box<dyn Substrate>) -> Self {
        let machine = substrate.machine_index();
        let machines = substrate.num_machines();
        let (tx, rx) = sync_channel::<IoRequest>(2);
        let join = std::thread::Builder::new()
            .name(format!("parsim-io-{machine}"))
            .spawn(move || io_loop(substrate, rx))
            .expect("spawn transport thread");
        TransportHandle {
            machine,
            machines,
            tx,
            join: Some(join),
        }
    }

    pub fn machine_index(&self) -> usize {
        self.machine
    }

    pub fn num_machines(&self) -> usize {
        self.machines
    }

    /// Synchronous all-to-all: ship one buffer to every peer and collect one
    /// from each, in rank order.
    pub fn exchange(
        &self,
        outbound: Vec<(usize, Vec<u8>)>,
    ) -> Result<Vec<(usize, Vec<u8>)>, TransportError> {
        let (reply_tx, reply_rx) = channel();
        self.tx
            .send(IoRequest::Exchange {
                outbound,
                reply: reply_tx,
            })
            .map_err(|_| TransportError::Closed { peer: self.machine })?;
        reply_rx
            .recv()
            .map_err(|_| TransportError::Closed { peer: self.machine })?
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(IoRequest::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn io_loop(substrate: Box<dyn Substrate>, rx: Receiver<IoRequest>) {
    let me = substrate.machine_index();
    let n = substrate.num_machines();
    while let Ok(request) = rx.recv() {
        match request {
            IoRequest::Exchange { outbound, reply } => {
                let result = (|| {
                    for (peer, buf) in outbound {
                        substrate.send(peer, buf)?;
                    }
                    let mut inbound = Vec::with_capacity(n.saturating_sub(1));
                    for peer in 0..n {
                        if peer == me {
                            continue;
                        }
                        inbound.push((peer, substrate.recv(peer)?));
                    }
                    Ok(inbound)
                })();
                // Receiver gone means the run is tearing down; nothing to do.
                let _ = reply.send(result);
            }
            IoRequest::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u32, t: i64, seq: u64, name: &str, payload: &[u8]) -> WireFrame {
        WireFrame {
            type_id: tag,
            deliver_ticks: t,
            tiebreak: seq,
            name: name.to_string(),
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_frame_layout_is_fixed() {
        let mut buf = Vec::new();
        encode_frame(&frame(7, 1000, 3, "IN_2", &[0xaa, 0xbb]), &mut buf);
        // u32 type + i64 time + u64 tiebreak + u32 len + 4 name bytes
        // + u32 len + 2 payload bytes
        assert_eq!(buf.len(), 4 + 8 + 8 + 4 + 4 + 4 + 2);
        assert_eq!(&buf[0..4], &7u32.to_le_bytes());
        assert_eq!(&buf[4..12], &1000i64.to_le_bytes());
    }

    #[test]
    fn test_epoch_message_round_trip() {
        let msg = EpochMessage {
            epoch: 42,
            reports: vec![(0, 100), (1, i64::MAX)],
            frame_mins: vec![(2, 150)],
            sections: vec![
                WireSection {
                    src_gid: 0,
                    frames: vec![
                        frame(0, 150, 0, "IN_5", &[]),
                        frame(9, 175, 1, "IN_6", &[1, 2, 3]),
                    ],
                },
                WireSection {
                    src_gid: 1,
                    frames: vec![],
                },
            ],
        };
        let encoded = encode_epoch_message(&msg);
        let decoded = decode_epoch_message(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let msg = EpochMessage {
            epoch: 1,
            reports: vec![(0, 5)],
            frame_mins: vec![],
            sections: vec![WireSection {
                src_gid: 0,
                frames: vec![frame(0, 5, 0, "a", &[7])],
            }],
        };
        let encoded = encode_epoch_message(&msg);
        for cut in [1, encoded.len() / 2, encoded.len() - 1] {
            assert!(decode_epoch_message(&encoded[..cut]).is_err());
        }
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut encoded = encode_epoch_message(&EpochMessage::default());
        encoded.push(0);
        assert!(decode_epoch_message(&encoded).is_err());
    }

    #[test]
    fn test_mesh_delivers_in_order() {
        let mut nodes = mesh(2);
        let b = nodes.pop().unwrap();
        let a = nodes.pop().unwrap();
        a.send(1, vec![1]).unwrap();
        a.send(1, vec![2]).unwrap();
        assert_eq!(b.recv(0).unwrap(), vec![1]);
        assert_eq!(b.recv(0).unwrap(), vec![2]);
    }

    #[test]
    fn test_mesh_detects_dropped_peer() {
        let mut nodes = mesh(2);
        let b = nodes.pop().unwrap();
        let a = nodes.pop().unwrap();
        drop(a);
        assert!(matches!(
            b.recv(0),
            Err(TransportError::Closed { peer: 0 })
        ));
    }

    #[test]
    fn test_io_thread_exchange() {
        let mut nodes = mesh(2);
        let b = TransportHandle::spawn(Box::new(nodes.pop().unwrap()));
        let a = TransportHandle::spawn(Box::new(nodes.pop().unwrap()));

        let from_a = std::thread::spawn(move || a.exchange(vec![(1, vec![0xa])]));
        let inbound_b = b.exchange(vec![(0, vec![0xb])]).unwrap();
        let inbound_a = from_a.join().unwrap().unwrap();

        assert_eq!(inbound_a, vec![(1, vec![0xb])]);
        assert_eq!(inbound_b, vec![(0, vec![0xa])]);
    }

    #[test]
    fn test_gossip_round_trip() {
        let hello = HelloGossip {
            timelines: 2,
            channels: vec![ChannelAd {
                name: "IN_0".into(),
                timeline: 1,
                ic_slot: 0,
            }],
        };
        let bytes = encode_gossip(&hello).unwrap();
        let back: HelloGossip = decode_gossip(&bytes).unwrap();
        assert_eq!(back.timelines, 2);
        assert_eq!(back.channels[0].name, "IN_0");
        assert_eq!(back.channels[0].timeline, 1);
    }
}
