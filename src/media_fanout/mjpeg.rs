//! Multipart MJPEG framing and JPEG frame splitting

use bytes::{BufMut, Bytes, BytesMut};

pub const BOUNDARY: &str = "thisMjpegStream";

/// Splitter buffer bound; anything larger without a complete frame is noise
const MAX_PENDING: usize = 4 * 1024 * 1024;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

pub fn content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={}", BOUNDARY)
}

/// One multipart part carrying `jpeg`
pub fn frame_part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Cuts a byte stream (ffmpeg stdout, camera MJPEG) into whole JPEGs
#[derive(Debug, Default)]
pub struct JpegSplitter {
    pending: BytesMut,
}

impl JpegSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every frame it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find(&self.pending, &SOI, 0) else {
                // Keep a trailing 0xFF in case SOI straddles chunks
                let keep = usize::from(self.pending.last() == Some(&0xFF));
                let drop = self.pending.len() - keep;
                let _ = self.pending.split_to(drop);
                break;
            };
            if start > 0 {
                let _ = self.pending.split_to(start);
            }
            let Some(end) = find(&self.pending, &EOI, 2) else {
                break;
            };
            frames.push(self.pending.split_to(end + 2).freeze());
        }

        if self.pending.len() > MAX_PENDING {
            tracing::debug!(pending = self.pending.len(), "Discarding oversized partial frame");
            self.pending.clear();
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(fill: u8, len: usize) -> Vec<u8> {
        let mut v = vec![0xFF, 0xD8];
        v.extend(std::iter::repeat(fill).take(len));
        v.extend([0xFF, 0xD9]);
        v
    }

    #[test]
    fn test_frame_part_layout() {
        let part = frame_part(b"abc");
        let text = String::from_utf8_lossy(&part);
        assert!(text.starts_with("--thisMjpegStream\r\nContent-Type: image/jpeg\r\nContent-Length: 3\r\n\r\nabc"));
        assert!(text.ends_with("\r\n"));
    }

    #[test]
    fn test_splitter_across_chunks() {
        let a = jpeg(0x11, 10);
        let b = jpeg(0x22, 5);
        let mut stream = b"garbage".to_vec();
        stream.extend(&a);
        stream.extend(&b);

        let mut splitter = JpegSplitter::new();
        let mut frames = Vec::new();
        for chunk in stream.chunks(3) {
            frames.extend(splitter.push(chunk));
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], &a[..]);
        assert_eq!(&frames[1][..], &b[..]);
    }
}
