//! Decoding of the container platform's multiplexed log stream.
//!
//! Each chunk is an 8-byte header followed by its payload:
//! `[stream, 0, 0, 0, len_be32...]`. Stream 1 is stdout, 2 is stderr.

pub const HEADER_LEN: usize = 8;

/// Strip per-chunk framing and concatenate payloads in receipt order.
///
/// The stdout/stderr distinction is discarded. A declared length larger than
/// the remaining bytes is clamped; trailing bytes shorter than a header are
/// dropped.
pub fn strip_log_framing(mut data: &[u8]) -> String {
    let mut payload = Vec::with_capacity(data.len());
    while data.len() >= HEADER_LEN {
        let declared = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        data = &data[HEADER_LEN..];
        let size = declared.min(data.len());
        payload.extend_from_slice(&data[..size]);
        data = &data[size..];
    }
    String::from_utf8_lossy(&payload).into_owned()
}

/// Encode one chunk. Used to fabricate log streams in tests and mocks.
pub fn encode_log_frame(stream: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(stream);
    frame.extend_from_slice(&[0, 0, 0]);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_chunk() {
        let mut data = vec![1, 0, 0, 0, 0, 0, 0, 5];
        data.extend_from_slice(b"hello");
        assert_eq!(strip_log_framing(&data), "hello");
    }

    #[test]
    fn test_interleaved_streams_keep_order() {
        let mut data = encode_log_frame(1, b"epoch 1\n");
        data.extend(encode_log_frame(2, b"warning: lr high\n"));
        data.extend(encode_log_frame(1, b"epoch 2\n"));
        assert_eq!(
            strip_log_framing(&data),
            "epoch 1\nwarning: lr high\nepoch 2\n"
        );
    }

    #[test]
    fn test_truncated_payload_is_clamped() {
        let mut data = vec![1, 0, 0, 0, 0, 0, 0, 50];
        data.extend_from_slice(b"partial");
        assert_eq!(strip_log_framing(&data), "partial");
    }

    #[test]
    fn test_short_tail_and_empty_chunks() {
        let mut data = encode_log_frame(1, b"");
        data.extend(encode_log_frame(1, b"ok"));
        data.extend_from_slice(&[1, 0, 0]);
        assert_eq!(strip_log_framing(&data), "ok");
        assert_eq!(strip_log_framing(&[]), "");
    }

    #[test]
    fn test_multibyte_split_across_chunks() {
        let snow = "❄".as_bytes();
        let mut data = encode_log_frame(1, &snow[..1]);
        data.extend(encode_log_frame(1, &snow[1..]));
        assert_eq!(strip_log_framing(&data), "❄");
    }
}
