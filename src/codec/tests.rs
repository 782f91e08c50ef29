//! Tests for the bundled codecs.

use bytes::{BufMut, Bytes, BytesMut};
use rstest::{fixture, rstest};

use super::{
    CodecError,
    Frame,
    FramingError,
    LENGTH_HEADER_SIZE,
    LengthPrefixedCodec,
    LineCodec,
    PacketCodec,
};
use crate::{
    connection::{Connection, Role},
    correlation::CorrelatableFrame,
    engine::test_engine,
};

#[fixture]
fn conn() -> Connection<Frame> {
    Connection::detached(&test_engine(LengthPrefixedCodec::default(), Role::Server), None)
}

fn header(declared: u32) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32(declared);
    buf
}

#[rstest]
fn length_prefixed_carries_correlation_and_body(conn: Connection<Frame>) {
    let codec = LengthPrefixedCodec::default();
    let wire = codec
        .encode(&Frame::new("ping").with_correlation_id(7), &conn)
        .expect("encode");
    assert_eq!(wire.len(), LENGTH_HEADER_SIZE + 8 + 4);

    let mut src = BytesMut::from(&wire[..]);
    src.extend_from_slice(b"tail");
    let frame = codec.decode(&mut src, &conn).expect("decode").expect("frame");
    assert_eq!(frame.body(), &Bytes::from_static(b"ping"));
    assert_eq!(frame.correlation_id(), Some(7));
    assert_eq!(&src[..], b"tail");
}

#[rstest]
fn zero_correlation_means_none(conn: Connection<Frame>) {
    let codec = LengthPrefixedCodec::default();
    let wire = codec.encode(&Frame::new("x"), &conn).expect("encode");
    let mut src = BytesMut::from(&wire[..]);
    let frame = codec.decode(&mut src, &conn).expect("decode").expect("frame");
    assert_eq!(frame.correlation_id(), None);
}

#[rstest]
fn partial_packet_sets_hint_and_keeps_window(conn: Connection<Frame>) {
    let codec = LengthPrefixedCodec::default();
    let mut src = header(20);
    src.put_slice(b"abc");
    assert!(codec.decode(&mut src, &conn).expect("decode").is_none());
    assert_eq!(conn.packet_needed_length(), Some(24));
    assert_eq!(src.len(), 7);
}

#[rstest]
fn short_header_sets_no_hint(conn: Connection<Frame>) {
    let codec = LengthPrefixedCodec::default();
    let mut src = BytesMut::from(&[0u8, 0][..]);
    assert!(codec.decode(&mut src, &conn).expect("decode").is_none());
    assert_eq!(conn.packet_needed_length(), None);
}

#[rstest]
#[case(4, false)]
#[case(1_000_000, true)]
fn invalid_lengths_are_rejected(
    conn: Connection<Frame>,
    #[case] declared: u32,
    #[case] oversized: bool,
) {
    let codec = LengthPrefixedCodec::new(1024);
    let mut src = header(declared);
    let err = codec.decode(&mut src, &conn).expect_err("must fail");
    assert!(err.is_protocol());
    assert_eq!(err.is_oversized(), oversized);
}

#[rstest]
fn oversized_encode_is_rejected(conn: Connection<Frame>) {
    let codec = LengthPrefixedCodec::new(64);
    let err = codec
        .encode(&Frame::new(vec![0u8; 100]), &conn)
        .expect_err("too large");
    assert!(matches!(
        err,
        CodecError::Framing(FramingError::OversizedFrame { size: 108, max: 64 })
    ));
}

#[rstest]
#[case(&b"hello\nrest"[..], Some(&b"hello"[..]), &b"rest"[..])]
#[case(&b"hello\r\n"[..], Some(&b"hello"[..]), &b""[..])]
#[case(&b"\n"[..], Some(&b""[..]), &b""[..])]
#[case(&b"partial"[..], None, &b"partial"[..])]
fn line_codec_splits_on_newline(
    conn: Connection<Frame>,
    #[case] input: &[u8],
    #[case] expected: Option<&[u8]>,
    #[case] left: &[u8],
) {
    let mut src = BytesMut::from(input);
    let frame = LineCodec::default().decode(&mut src, &conn).expect("decode");
    assert_eq!(frame.as_ref().map(|f| &f.body()[..]), expected);
    assert_eq!(&src[..], left);
    assert_eq!(conn.packet_needed_length(), None);
}

#[rstest]
fn line_codec_rejects_long_lines(conn: Connection<Frame>) {
    let codec = LineCodec::new(64);
    let mut src = BytesMut::from(&[b'a'; 65][..]);
    assert!(codec.decode(&mut src, &conn).expect_err("too long").is_oversized());
}

#[rstest]
fn line_codec_refuses_embedded_newlines(conn: Connection<Frame>) {
    let err = LineCodec::default()
        .encode(&Frame::new("a\nb"), &conn)
        .expect_err("newline");
    assert!(matches!(err, CodecError::Framing(FramingError::Malformed(_))));
}
