//! Protocol-level property tests over the public codec API.

use braid::protocol::{encode_command, FrameDecoder, RawFrame, RespVersion};
use bytes::{Bytes, BytesMut};

fn drain(decoder: &mut FrameDecoder) -> Vec<RawFrame> {
    let mut frames = Vec::new();
    while let Some(frame) = decoder.next_frame().expect("clean decode") {
        frames.push(frame);
    }
    frames
}

#[test]
fn command_frames_decode_as_flat_bulk_arrays() {
    // What the client writes, a server-side RESP parser must read back as
    // an array of bulk strings.
    let mut buf = BytesMut::new();
    encode_command(
        &mut buf,
        [b"SET".as_slice(), b"key".as_slice(), b"\x00\xffvalue".as_slice()].into_iter(),
    );

    let mut decoder = FrameDecoder::new(RespVersion::Resp2);
    decoder.feed(&buf).unwrap();
    let frames = drain(&mut decoder);
    assert_eq!(frames.len(), 1);
    let RawFrame::Array(items) = &frames[0] else {
        panic!("expected array, got {:?}", frames[0]);
    };
    assert_eq!(items.len(), 3);
    assert_eq!(items[0], RawFrame::Bulk(Bytes::from_static(b"SET")));
    assert_eq!(items[2], RawFrame::Bulk(Bytes::from_static(b"\x00\xffvalue")));
}

#[test]
fn decoder_progress_is_split_invariant() {
    let stream: &[u8] = b"+OK\r\n:1\r\n$3\r\nfoo\r\n*2\r\n$1\r\na\r\n:2\r\n%1\r\n+k\r\n#t\r\n,-inf\r\n(18446744073709551616\r\n=9\r\ntxt:hello\r\n_\r\n>3\r\n+message\r\n+c\r\n+m\r\n";

    let mut one_shot = FrameDecoder::new(RespVersion::Resp3);
    one_shot.feed(stream).unwrap();
    let expected = drain(&mut one_shot);
    assert_eq!(expected.len(), 11);

    // Every split point must yield the identical frame stream.
    for split in 1..stream.len() {
        let (left, right) = stream.split_at(split);
        let mut decoder = FrameDecoder::new(RespVersion::Resp3);
        decoder.feed(left).unwrap();
        let mut frames = drain(&mut decoder);
        decoder.feed(right).unwrap();
        frames.extend(drain(&mut decoder));
        assert_eq!(frames, expected, "diverged at split {}", split);
    }
}

#[test]
fn zero_length_bulk_is_not_nil() {
    let mut decoder = FrameDecoder::new(RespVersion::Resp2);
    decoder.feed(b"$0\r\n\r\n$-1\r\n").unwrap();
    let frames = drain(&mut decoder);
    assert_eq!(frames[0], RawFrame::Bulk(Bytes::new()));
    assert_eq!(frames[1], RawFrame::Null);
    assert_ne!(frames[0], frames[1]);
}

#[test]
fn empty_array_is_not_nil_array() {
    let mut decoder = FrameDecoder::new(RespVersion::Resp2);
    decoder.feed(b"*0\r\n*-1\r\n").unwrap();
    let frames = drain(&mut decoder);
    assert_eq!(frames[0], RawFrame::Array(Vec::new()));
    assert_eq!(frames[1], RawFrame::Null);
}

#[test]
fn pushes_interleave_without_disturbing_reply_order() {
    // Pipelined replies with a push frame wedged between them: the reply
    // sequence (non-push frames) keeps its order, the push stays distinct.
    let mut decoder = FrameDecoder::new(RespVersion::Resp3);
    decoder
        .feed(b":1\r\n>3\r\n+message\r\n+c\r\n+x\r\n:2\r\n")
        .unwrap();
    let frames = drain(&mut decoder);
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0], RawFrame::Integer(1));
    assert!(matches!(frames[1], RawFrame::Push(_)));
    assert_eq!(frames[2], RawFrame::Integer(2));

    let replies: Vec<&RawFrame> = frames
        .iter()
        .filter(|f| !matches!(f, RawFrame::Push(_)))
        .collect();
    assert_eq!(replies, [&RawFrame::Integer(1), &RawFrame::Integer(2)]);
}

#[test]
fn integer_and_double_round_trip() {
    for value in [0i64, 1, -1, 42, i64::MAX, i64::MIN] {
        let encoded = format!(":{}\r\n", value);
        let mut decoder = FrameDecoder::new(RespVersion::Resp2);
        decoder.feed(encoded.as_bytes()).unwrap();
        assert_eq!(
            decoder.next_frame().unwrap(),
            Some(RawFrame::Integer(value))
        );
    }

    for (text, expected) in [
        ("1.5", 1.5f64),
        ("-0.25", -0.25),
        ("inf", f64::INFINITY),
        ("-inf", f64::NEG_INFINITY),
    ] {
        let encoded = format!(",{}\r\n", text);
        let mut decoder = FrameDecoder::new(RespVersion::Resp3);
        decoder.feed(encoded.as_bytes()).unwrap();
        assert_eq!(
            decoder.next_frame().unwrap(),
            Some(RawFrame::Double(expected))
        );
    }
}
