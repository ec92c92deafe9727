use std::io::Read;
use std::time::Duration;

use super::*;
use crate::packet::Payload;
use crate::stream::{CodecId, PixelFormat, Rational};

fn stream() -> StreamDescriptor {
    StreamDescriptor::for_encoder_output(
        &StreamDescriptor::raw_video(640, 360, PixelFormat::Nv12, Rational::new(30, 1)),
        CodecId::H264,
    )
}

fn packet(data: &'static [u8], key: bool, pts: i64) -> Packet {
    let mut packet = Packet::new(Payload::Data(Bytes::from_static(data)), 0, Rational::MICROS);
    packet.set_key(key);
    packet.set_timestamps(Some(pts), Some(pts));
    packet
}

#[test]
fn framed_sink_writes_self_delimiting_records() {
    let mut sink = FramedSink::new(Vec::new());
    sink.add_stream(&stream()).unwrap();
    sink.write(packet(b"abc", true, 42)).unwrap();
    sink.send_message(b"hi").unwrap();
    let out = sink.into_inner();

    let first = FrameHeader::decode(&out).unwrap();
    assert_eq!(first.kind, FrameKind::Stream);
    let body = &out[FRAME_HEADER_LEN..FRAME_HEADER_LEN + first.length as usize];
    assert!(body.ends_with(b"h264"));

    let rest = &out[FRAME_HEADER_LEN + first.length as usize..];
    let second = FrameHeader::decode(rest).unwrap();
    assert_eq!(second.kind, FrameKind::Packet);
    assert_eq!(second.flags, FLAG_KEY);
    assert_eq!(second.pts, 42);
    assert_eq!(&rest[FRAME_HEADER_LEN..FRAME_HEADER_LEN + 3], b"abc");

    let rest = &rest[FRAME_HEADER_LEN + 3..];
    let third = FrameHeader::decode(rest).unwrap();
    assert_eq!(third.kind, FrameKind::Message);
    assert_eq!(third.length, 2);
}

#[test]
fn header_rejects_bad_magic() {
    assert!(FrameHeader::decode(&[0u8; FRAME_HEADER_LEN]).is_none());
    assert!(FrameHeader::decode(b"IRRV").is_none());
}

#[test]
fn socket_sink_starts_new_clients_at_a_key_frame() {
    let mut sink = SocketSink::bind("127.0.0.1:0").unwrap();
    sink.add_stream(&stream()).unwrap();
    assert_eq!(sink.check_connection(), 0);
    assert!(!sink.wants_key_frame());

    let mut client = TcpStream::connect(sink.local_addr().unwrap()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut connected = 0;
    for _ in 0..200 {
        connected = sink.check_connection();
        if connected == 1 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(connected, 1);
    assert!(sink.wants_key_frame());
    assert!(!sink.wants_key_frame());

    sink.write(packet(b"delta", false, 1)).unwrap();
    sink.write(packet(b"key", true, 2)).unwrap();

    let mut header = [0u8; FRAME_HEADER_LEN];
    client.read_exact(&mut header).unwrap();
    let stream_header = FrameHeader::decode(&header).unwrap();
    assert_eq!(stream_header.kind, FrameKind::Stream);
    let mut body = vec![0u8; stream_header.length as usize];
    client.read_exact(&mut body).unwrap();

    client.read_exact(&mut header).unwrap();
    let key_header = FrameHeader::decode(&header).unwrap();
    assert_eq!(key_header.kind, FrameKind::Packet);
    assert_eq!(key_header.pts, 2);
    let mut payload = vec![0u8; key_header.length as usize];
    client.read_exact(&mut payload).unwrap();
    assert_eq!(payload, b"key");
}

#[tokio::test]
async fn channel_sink_streams_events() {
    let mut sink = ChannelSink::new(16);
    assert_eq!(sink.check_connection(), 0);
    let mut events = Box::pin(sink.stream());
    assert_eq!(sink.check_connection(), 1);

    sink.add_stream(&stream()).unwrap();
    sink.write(packet(b"abc", true, 7)).unwrap();
    sink.write_capture(Bytes::from_static(b"jpeg")).unwrap();

    match events.next().await {
        Some(SinkEvent::Stream(desc)) => assert_eq!(desc.codec, CodecId::H264),
        other => panic!("Expected stream event, got {:?}", other),
    }
    match events.next().await {
        Some(SinkEvent::Packet(p)) => assert_eq!(p.pts(), Some(7)),
        other => panic!("Expected packet event, got {:?}", other),
    }
    match events.next().await {
        Some(SinkEvent::Capture(jpeg)) => assert_eq!(&jpeg[..], b"jpeg"),
        other => panic!("Expected capture event, got {:?}", other),
    }
}
