//! MJPEG (`multipart/x-mixed-replace`) part framing.
//!
//! Browsers render this natively as a live stream: each part replaces the
//! previous image. The byte format is exactly
//!
//! ```text
//! --owlboundary\r\n
//! Content-Type: image/jpeg\r\n
//! Content-Length: N\r\n
//! \r\n
//! <N bytes>\r\n
//! ```

use bytes::{BufMut, Bytes, BytesMut};

pub const BOUNDARY: &str = "owlboundary";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=owlboundary";

/// Frame one JPEG as a multipart part.
pub fn encode_part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut buf = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    buf.put_slice(header.as_bytes());
    buf.put_slice(jpeg);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_bytes_are_exact() {
        let part = encode_part(b"JPEGDATA");
        let expected = b"--owlboundary\r\nContent-Type: image/jpeg\r\nContent-Length: 8\r\n\r\nJPEGDATA\r\n";
        assert_eq!(&part[..], &expected[..]);
    }

    #[test]
    fn repeated_parts_concatenate_cleanly() {
        let mut stream = Vec::new();
        for payload in [b"aa".as_slice(), b"bbb", b"c"] {
            stream.extend_from_slice(&encode_part(payload));
        }
        let text = String::from_utf8_lossy(&stream);
        assert_eq!(text.matches("--owlboundary\r\n").count(), 3);
        assert_eq!(text.matches("Content-Type: image/jpeg").count(), 3);
        assert!(text.contains("Content-Length: 2\r\n\r\naa\r\n"));
        assert!(text.contains("Content-Length: 3\r\n\r\nbbb\r\n"));
        assert!(text.contains("Content-Length: 1\r\n\r\nc\r\n"));
    }

    #[test]
    fn binary_payload_survives() {
        let jpeg = [0xffu8, 0xd8, 0x00, 0x0d, 0x0a, 0xff, 0xd9];
        let part = encode_part(&jpeg);
        assert!(part.windows(jpeg.len()).any(|w| w == jpeg));
        assert!(part.ends_with(b"\r\n"));
    }
}
