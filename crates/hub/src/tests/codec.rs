use crate::{error::HubError, rpc::codec::FrameCodec};

#[test]
fn emits_lines_across_chunk_boundaries() {
    let mut codec = FrameCodec::new();
    let first = codec.push(b"{\"a\":1}\n{\"b\"").expect("push");
    assert_eq!(first, vec!["{\"a\":1}".to_string()]);
    let second = codec.push(b":2}\n").expect("push");
    assert_eq!(second, vec!["{\"b\":2}".to_string()]);
}

#[test]
fn reassembles_regardless_of_chunking() {
    let lines = ["{\"id\":1}", "{\"id\":2}", "{\"method\":\"x\"}", "{\"id\":3,\"result\":{}}"];
    let stream = lines.map(|line| format!("{line}\n")).concat();
    let bytes = stream.as_bytes();

    for chunk_size in 1..=7 {
        let mut codec = FrameCodec::new();
        let mut collected = Vec::new();
        for chunk in bytes.chunks(chunk_size) {
            collected.extend(codec.push(chunk).expect("push"));
        }
        assert_eq!(collected, lines, "chunk size {chunk_size}");
    }
}

#[test]
fn skips_blank_lines_and_strips_carriage_returns() {
    let mut codec = FrameCodec::new();
    let frames = codec
        .push(b"\n  \n{\"a\":1}\r\n\r\n{\"b\":2}\n")
        .expect("push");
    assert_eq!(frames, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
}

#[test]
fn oversized_fragment_poisons_the_codec() {
    let mut codec = FrameCodec::with_limit(8);
    let err = codec.push(b"0123456789abcdef").expect_err("over limit");
    assert!(matches!(err, HubError::FrameTooLarge { limit: 8 }));
    // Poisoned for good: even a tiny follow-up chunk fails.
    assert!(codec.push(b"\n").is_err());
}

#[test]
fn oversized_completed_line_is_rejected() {
    let mut codec = FrameCodec::with_limit(4);
    assert!(codec.push(b"123456\n").is_err());
}

#[test]
fn trailing_fragment_is_retained_not_emitted() {
    let mut codec = FrameCodec::new();
    let frames = codec.push(b"{\"a\":1}\n{\"partial\"").expect("push");
    assert_eq!(frames.len(), 1);
    // EOF would simply drop the codec here; the fragment never surfaces.
}
