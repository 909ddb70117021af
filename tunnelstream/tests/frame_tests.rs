//! Frame reassembly and join request rewriting over realistic byte streams.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tunnelstream::error::TunnelError;
use tunnelstream::frame::{Reassembler, HEADER_LEN, W3GS_HEADER, W3GS_REQJOIN};
use tunnelstream::rewrite::{JoinRequest, Rewriter};
use tunnelstream::transport::EntryKeyResolver;

fn w3gs(kind: u8, body: &[u8]) -> Vec<u8> {
    let mut frame = vec![W3GS_HEADER, kind];
    frame.extend_from_slice(&((body.len() + HEADER_LEN) as u16).to_le_bytes());
    frame.extend_from_slice(body);
    frame
}

fn join(name: &'static [u8], entry_key: u32) -> JoinRequest {
    JoinRequest {
        host_counter: 3,
        entry_key,
        reserved: 0,
        listen_port: 6112,
        peer_key: 0x0102_0304,
        name: Bytes::from_static(name),
        remainder: Bytes::from_static(&[0x00, 0x00, 0x02, 0x00, 0x17, 0xE0, 0x7F, 0x00, 0x00, 0x01]),
    }
}

struct HostKeys(HashMap<u32, u32>);

impl EntryKeyResolver for HostKeys {
    fn resolve(&self, entry_key: u32) -> Option<u32> {
        self.0.get(&entry_key).copied()
    }
}

// ---------------------------------------------------------------------------
// Reassembly
// ---------------------------------------------------------------------------

#[test]
fn stream_split_at_every_offset_yields_same_frames() {
    let mut stream = w3gs(0x28, b"chat message");
    stream.extend(join(b"Alice", 1).encode());
    stream.extend(w3gs(0x42, b""));

    for split in 0..=stream.len() {
        let mut r = Reassembler::new();
        let mut frames = Vec::new();
        for chunk in [&stream[..split], &stream[split..]] {
            r.extend(chunk);
            while let Some(frame) = r.next_frame().unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames.len(), 3, "split at {split}");
        assert_eq!(frames.concat(), stream);
        assert_eq!(r.buffered(), 0);
    }
}

#[test]
fn bytes_after_valid_frames_are_checked_once_complete() {
    let mut r = Reassembler::new();
    r.extend(&w3gs(0x28, b"ok"));
    r.extend(&[0x12, 0x34]);

    assert!(r.next_frame().unwrap().is_some());
    // Two bytes cannot be judged yet.
    assert!(r.next_frame().unwrap().is_none());
    r.extend(&[0x04, 0x00]);
    assert!(matches!(r.next_frame(), Err(TunnelError::InvalidFrameHeader(0x12))));
}

// ---------------------------------------------------------------------------
// Join request rewriting
// ---------------------------------------------------------------------------

#[test]
fn rewritten_join_keeps_everything_but_the_name() {
    let original = join(b"Alice", 0xAAAA_0001);
    let out = Rewriter::new(1, "Bob", None)
        .rewrite(original.encode())
        .unwrap();

    let rewritten = JoinRequest::decode(&out).unwrap();
    assert_eq!(&rewritten.name[..], b"Bob");
    assert_eq!(rewritten.host_counter, original.host_counter);
    assert_eq!(rewritten.entry_key, original.entry_key);
    assert_eq!(rewritten.listen_port, original.listen_port);
    assert_eq!(rewritten.peer_key, original.peer_key);
    assert_eq!(rewritten.remainder, original.remainder);
    assert_eq!(out[1], W3GS_REQJOIN);
}

#[test]
fn longer_name_grows_frame() {
    let out = Rewriter::new(1, "Bartholomew", None)
        .rewrite(join(b"Al", 0).encode())
        .unwrap();
    let original_len = join(b"Al", 0).encoded_len();
    assert_eq!(out.len(), original_len + 9);
    assert_eq!(usize::from(u16::from_le_bytes([out[2], out[3]])), out.len());
}

#[test]
fn name_that_overflows_length_field_is_a_violation() {
    let mut full = join(b"A", 0);
    full.remainder = Bytes::from(vec![0u8; usize::from(u16::MAX) - full.encoded_len() + full.remainder.len()]);
    let frame = full.encode();
    assert_eq!(frame.len(), usize::from(u16::MAX));

    let err = Rewriter::new(1, "Bartholomew", None).rewrite(frame).unwrap_err();
    assert!(matches!(err, TunnelError::JoinRequestTooLong(65545)));
}

#[test]
fn entry_key_substitution() {
    let keys = HostKeys(HashMap::from([(0x5555_5555, 0x1234_5678)]));
    let rewriter = Rewriter::new(1, "Bob", Some(Arc::new(keys)));

    let out = rewriter.rewrite(join(b"Bob", 0x5555_5555).encode()).unwrap();
    assert_eq!(JoinRequest::decode(&out).unwrap().entry_key, 0x1234_5678);

    let out = rewriter.rewrite(join(b"Bob", 0x6666_6666).encode()).unwrap();
    assert_eq!(JoinRequest::decode(&out).unwrap().entry_key, 0x6666_6666);
}

#[test]
fn truncated_join_is_a_violation() {
    let frame = Bytes::from(w3gs(W3GS_REQJOIN, &[0u8; 10]));
    let err = Rewriter::new(1, "Bob", None).rewrite(frame).unwrap_err();
    assert!(matches!(err, TunnelError::JoinRequestTooShort(14)));
}
