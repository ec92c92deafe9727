//! Destinations for encoded packets.
//!
//! The transcoder only needs [`OutputSink`]. Three variants ship with the crate:
//! a TCP socket sink serving every connected client, a framed sink that writes
//! a self-delimiting byte stream to any `io::Write`, and a channel sink
//! broadcasting to async subscribers.

use std::io::{ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{packet::Packet, stream::StreamDescriptor};

pub trait OutputSink: Send {
    /// Registers an encoder output stream before its first packet.
    fn add_stream(&mut self, stream: &StreamDescriptor) -> anyhow::Result<()>;

    /// Writes one encoded packet. May block on downstream I/O.
    fn write(&mut self, packet: Packet) -> anyhow::Result<()>;

    /// Polls for new consumers and returns how many are connected.
    fn check_connection(&mut self) -> usize {
        1
    }

    /// True once after a new consumer joined and needs a key frame.
    fn wants_key_frame(&mut self) -> bool {
        false
    }

    fn send_message(&mut self, _message: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }

    /// Delivers a JPEG screen capture.
    fn write_capture(&mut self, _jpeg: Bytes) -> anyhow::Result<()> {
        Ok(())
    }

    /// Whether the transcoder should idle while no consumer is connected.
    fn requires_clients(&self) -> bool {
        false
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub const FRAME_MAGIC: [u8; 4] = *b"IRRV";
pub const FRAME_HEADER_LEN: usize = 20;
pub const FLAG_KEY: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Stream = 0,
    Packet = 1,
    Capture = 2,
    Message = 3,
}

impl FrameKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FrameKind::Stream),
            1 => Some(FrameKind::Packet),
            2 => Some(FrameKind::Capture),
            3 => Some(FrameKind::Message),
            _ => None,
        }
    }
}

/// Fixed 20-byte header in front of every framed payload:
/// magic, kind, flags, stream index, pts, payload length (big-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub flags: u8,
    pub stream_index: u16,
    pub pts: i64,
    pub length: u32,
}

impl FrameHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&FRAME_MAGIC);
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.flags);
        buf.put_u16(self.stream_index);
        buf.put_i64(self.pts);
        buf.put_u32(self.length);
    }

    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_LEN || buf[..4] != FRAME_MAGIC {
            return None;
        }
        buf.advance(4);
        let kind = FrameKind::from_u8(buf.get_u8())?;
        Some(Self {
            kind,
            flags: buf.get_u8(),
            stream_index: buf.get_u16(),
            pts: buf.get_i64(),
            length: buf.get_u32(),
        })
    }
}

fn frame(kind: FrameKind, flags: u8, stream_index: usize, pts: i64, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    FrameHeader {
        kind,
        flags,
        stream_index: stream_index as u16,
        pts,
        length: payload.len() as u32,
    }
    .encode(&mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

fn stream_frame(stream: &StreamDescriptor) -> Bytes {
    let mut payload = BytesMut::new();
    payload.put_u32(stream.width);
    payload.put_u32(stream.height);
    payload.put_i32(stream.frame_rate.numerator());
    payload.put_i32(stream.frame_rate.denominator());
    payload.put_slice(stream.codec.name().as_bytes());
    frame(FrameKind::Stream, 0, stream.index, 0, &payload)
}

fn packet_frame(packet: &Packet) -> Bytes {
    let flags = if packet.is_key() { FLAG_KEY } else { 0 };
    frame(
        FrameKind::Packet,
        flags,
        packet.index(),
        packet.pts().unwrap_or(0),
        &packet.data(),
    )
}

/// Writes framed packets to any byte sink.
pub struct FramedSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> FramedSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> OutputSink for FramedSink<W> {
    fn add_stream(&mut self, stream: &StreamDescriptor) -> anyhow::Result<()> {
        self.writer.write_all(&stream_frame(stream))?;
        Ok(())
    }

    fn write(&mut self, packet: Packet) -> anyhow::Result<()> {
        self.writer.write_all(&packet_frame(&packet))?;
        Ok(())
    }

    fn send_message(&mut self, message: &[u8]) -> anyhow::Result<()> {
        self.writer
            .write_all(&frame(FrameKind::Message, 0, 0, 0, message))?;
        Ok(())
    }

    fn write_capture(&mut self, jpeg: Bytes) -> anyhow::Result<()> {
        self.writer
            .write_all(&frame(FrameKind::Capture, 0, 0, 0, &jpeg))?;
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

struct Client {
    stream: TcpStream,
    peer: SocketAddr,
    waiting_key: bool,
}

/// Serves framed packets to every TCP client connected to a listener.
///
/// Clients joining mid-stream receive the stream headers first and then
/// packets from the next key frame on.
pub struct SocketSink {
    listener: TcpListener,
    clients: Vec<Client>,
    stream_headers: Vec<Bytes>,
    key_request: bool,
}

impl SocketSink {
    pub fn bind(addr: impl ToSocketAddrs) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        log::info!("socket sink listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            clients: Vec::new(),
            stream_headers: Vec::new(),
            key_request: false,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let ready = stream
                        .set_nonblocking(false)
                        .and_then(|_| stream.set_nodelay(true))
                        .and_then(|_| {
                            self.stream_headers
                                .iter()
                                .try_for_each(|header| stream.write_all(header))
                        });
                    match ready {
                        Ok(()) => {
                            log::info!("client {} connected", peer);
                            self.clients.push(Client {
                                stream,
                                peer,
                                waiting_key: true,
                            });
                            self.key_request = true;
                        }
                        Err(e) => log::warn!("client {} setup failed: {}", peer, e),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn broadcast(&mut self, data: &[u8], key: bool) {
        self.clients.retain_mut(|client| {
            if client.waiting_key {
                if !key {
                    return true;
                }
                client.waiting_key = false;
            }
            match client.stream.write_all(data) {
                Ok(()) => true,
                Err(e) => {
                    log::info!("client {} dropped: {}", client.peer, e);
                    false
                }
            }
        });
    }
}

impl OutputSink for SocketSink {
    fn add_stream(&mut self, stream: &StreamDescriptor) -> anyhow::Result<()> {
        let header = stream_frame(stream);
        self.clients
            .retain_mut(|client| client.stream.write_all(&header).is_ok());
        self.stream_headers.retain(|h| {
            FrameHeader::decode(h).map(|fh| fh.stream_index) != Some(stream.index as u16)
        });
        self.stream_headers.push(header);
        Ok(())
    }

    fn write(&mut self, packet: Packet) -> anyhow::Result<()> {
        let data = packet_frame(&packet);
        self.broadcast(&data, packet.is_key());
        Ok(())
    }

    fn check_connection(&mut self) -> usize {
        self.accept_pending();
        self.clients.len()
    }

    fn wants_key_frame(&mut self) -> bool {
        std::mem::take(&mut self.key_request)
    }

    fn send_message(&mut self, message: &[u8]) -> anyhow::Result<()> {
        let data = frame(FrameKind::Message, 0, 0, 0, message);
        self.clients
            .retain_mut(|client| client.stream.write_all(&data).is_ok());
        Ok(())
    }

    fn write_capture(&mut self, jpeg: Bytes) -> anyhow::Result<()> {
        let data = frame(FrameKind::Capture, 0, 0, 0, &jpeg);
        self.clients
            .retain_mut(|client| client.waiting_key || client.stream.write_all(&data).is_ok());
        Ok(())
    }

    fn requires_clients(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub enum SinkEvent {
    Stream(StreamDescriptor),
    Packet(Packet),
    Capture(Bytes),
    Message(Bytes),
}

/// Broadcasts sink events to in-process subscribers.
pub struct ChannelSink {
    sender: broadcast::Sender<SinkEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SinkEvent> {
        self.sender.subscribe()
    }

    /// Subscribes as an async stream; events missed by a lagging subscriber
    /// are skipped.
    pub fn stream(&self) -> impl Stream<Item = SinkEvent> + Send + 'static {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|event| async move {
            match event {
                Ok(event) => Some(event),
                Err(e) => {
                    log::debug!("channel sink subscriber lagged: {}", e);
                    None
                }
            }
        })
    }

    fn publish(&self, event: SinkEvent) {
        // no subscribers is not an error
        let _ = self.sender.send(event);
    }
}

impl OutputSink for ChannelSink {
    fn add_stream(&mut self, stream: &StreamDescriptor) -> anyhow::Result<()> {
        self.publish(SinkEvent::Stream(stream.clone()));
        Ok(())
    }

    fn write(&mut self, packet: Packet) -> anyhow::Result<()> {
        self.publish(SinkEvent::Packet(packet));
        Ok(())
    }

    fn check_connection(&mut self) -> usize {
        self.sender.receiver_count()
    }

    fn send_message(&mut self, message: &[u8]) -> anyhow::Result<()> {
        self.publish(SinkEvent::Message(Bytes::copy_from_slice(message)));
        Ok(())
    }

    fn write_capture(&mut self, jpeg: Bytes) -> anyhow::Result<()> {
        self.publish(SinkEvent::Capture(jpeg));
        Ok(())
    }
}

#[cfg(test)]
#[path = "sink_test.rs"]
mod sink_test;
