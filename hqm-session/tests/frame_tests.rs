//! Frame codec round-trips through a real header-compression context.

mod common;

use common::PlainCodec;
use hqm_session::frame::{
    create_data_frame, create_headers_frame, create_push_promise_frame, parse_frame_header,
    parse_headers_frame, parse_push_promise_frame, FrameType,
};
use hqm_session::headers::HeaderContext;
use hqm_x::Header;

fn ctx() -> HeaderContext {
    HeaderContext::new(Box::new(PlainCodec))
}

#[test]
fn test_headers_frame_roundtrip() {
    let mut ctx = ctx();
    let headers = vec![
        Header::new(":method", "GET"),
        Header::new(":scheme", "http"),
        Header::new(":path", "/index.html"),
    ];

    let frame = create_headers_frame(&mut ctx, None, &headers).unwrap();
    let (push_id, decoded) = parse_headers_frame(&mut ctx, &frame, false).unwrap();
    assert_eq!(push_id, None);
    assert_eq!(decoded, headers);
}

#[test]
fn test_push_continuation_headers_roundtrip() {
    let mut ctx = ctx();
    let headers = vec![Header::new(":status", "200")];

    let frame = create_headers_frame(&mut ctx, Some(42), &headers).unwrap();
    let (push_id, decoded) = parse_headers_frame(&mut ctx, &frame, true).unwrap();
    assert_eq!(push_id, Some(42));
    assert_eq!(decoded, headers);
}

#[test]
fn test_push_promise_frame_roundtrip() {
    let mut ctx = ctx();
    let headers = vec![
        Header::new(":method", "GET"),
        Header::new(":path", "/pushed/resource"),
    ];

    let frame = create_push_promise_frame(&mut ctx, 7, &headers).unwrap();
    let (push_id, decoded) = parse_push_promise_frame(&mut ctx, &frame).unwrap();
    assert_eq!(push_id, 7);
    assert_eq!(decoded, headers);
}

#[test]
fn test_multiple_frames_in_sequence() {
    let mut ctx = ctx();
    let mut wire = Vec::new();
    wire.extend_from_slice(&create_headers_frame(&mut ctx, None, &[Header::new(":path", "/")]).unwrap());
    wire.extend_from_slice(&create_data_frame(b"first"));
    wire.extend_from_slice(&create_data_frame(b"second"));

    let mut offset = 0;
    let mut types = Vec::new();
    while offset < wire.len() {
        let hdr = parse_frame_header(&wire[offset..]).unwrap();
        types.push(hdr.frame_type);
        offset += hdr.total_size() as usize;
    }

    assert_eq!(offset, wire.len());
    assert_eq!(
        types,
        vec![FrameType::Headers, FrameType::Data, FrameType::Data]
    );
}
