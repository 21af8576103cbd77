//! Unit tests for `<<EOF` frame splitting and response encoding.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use exec_daemon::protocol::codec::{FrameCodec, Response, DEFAULT_MAX_FRAME_BYTES};
use exec_daemon::AppError;

#[test]
fn complete_frame_is_returned_without_delimiter() {
    let mut codec = FrameCodec::default();
    let mut buf = BytesMut::from("CMD stop<<EOF");

    let frame = codec
        .decode(&mut buf)
        .expect("decode must succeed")
        .expect("a full frame is present");

    assert_eq!(&frame[..], b"CMD stop");
    assert!(buf.is_empty(), "delimiter must be consumed");
}

#[test]
fn back_to_back_frames_are_split() {
    let mut codec = FrameCodec::default();
    let mut buf = BytesMut::from("CMD undeploy a<<EOFCMD stop<<EOF");

    let first = codec.decode(&mut buf).expect("first decode").expect("first frame");
    let second = codec.decode(&mut buf).expect("second decode").expect("second frame");
    let third = codec.decode(&mut buf).expect("third decode");

    assert_eq!(&first[..], b"CMD undeploy a");
    assert_eq!(&second[..], b"CMD stop");
    assert!(third.is_none());
}

#[test]
fn partial_frame_waits_for_delimiter() {
    let mut codec = FrameCodec::default();
    let mut buf = BytesMut::from("DPL abc");

    assert!(codec.decode(&mut buf).expect("decode").is_none());
    assert_eq!(&buf[..], b"DPL abc", "partial bytes must stay buffered");

    buf.extend_from_slice(b"def<<EOF");
    let frame = codec.decode(&mut buf).expect("decode").expect("frame");
    assert_eq!(&frame[..], b"DPL abcdef");
}

#[test]
fn delimiter_split_across_reads_is_found() {
    let mut codec = FrameCodec::default();
    let mut buf = BytesMut::from("CMD stop<<E");
    assert!(codec.decode(&mut buf).expect("decode").is_none());

    buf.extend_from_slice(b"OF");
    let frame = codec.decode(&mut buf).expect("decode").expect("frame");
    assert_eq!(&frame[..], b"CMD stop");
}

#[test]
fn lookalike_bytes_inside_payload_are_kept() {
    let mut codec = FrameCodec::default();
    let mut buf = BytesMut::from(&b"DPL \x00<<EO\xff<<<EOF"[..]);

    let frame = codec.decode(&mut buf).expect("decode").expect("frame");
    assert_eq!(&frame[..], b"DPL \x00<<EO\xff<");
}

#[test]
fn oversized_frame_is_a_protocol_error() {
    let mut codec = FrameCodec::new(8);
    let mut buf = BytesMut::from("CMD undeploy far-too-long<<EOF");

    let err = codec.decode(&mut buf).expect_err("frame exceeds limit");
    assert!(matches!(err, AppError::Protocol(_)), "got {err:?}");
    assert!(err.to_string().contains("frame too long"));
}

#[test]
fn oversized_partial_frame_is_rejected_before_delimiter() {
    let mut codec = FrameCodec::new(4);
    let mut buf = BytesMut::from("DPL 0123456789");

    let err = codec.decode(&mut buf).expect_err("buffer exceeds limit");
    assert!(matches!(err, AppError::Protocol(_)));
}

#[test]
fn unterminated_bytes_are_discarded_at_eof() {
    let mut codec = FrameCodec::default();
    let mut buf = BytesMut::from("CMD sto");

    assert!(codec.decode_eof(&mut buf).expect("decode_eof").is_none());
    assert!(buf.is_empty());
}

#[test]
fn line_response_gets_crlf() {
    let mut codec = FrameCodec::default();
    let mut dst = BytesMut::new();

    codec
        .encode(Response::Line("OK CMD stop".into()), &mut dst)
        .expect("encode");

    assert_eq!(&dst[..], b"OK CMD stop\r\n");
}

#[test]
fn raw_response_is_written_verbatim() {
    let mut codec = FrameCodec::default();
    let mut dst = BytesMut::new();

    codec
        .encode(Response::Raw(Bytes::from_static(b"{\"status\":\"passed\"}")), &mut dst)
        .expect("encode");

    assert_eq!(&dst[..], b"{\"status\":\"passed\"}");
}

#[test]
fn default_limit_is_64_mib() {
    assert_eq!(FrameCodec::default().max_frame_bytes(), DEFAULT_MAX_FRAME_BYTES);
    assert_eq!(DEFAULT_MAX_FRAME_BYTES, 64 * 1024 * 1024);
}
