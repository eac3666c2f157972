//! MPEG audio (MP3) header extractor.
//!
//! Skips a leading ID3v2 tag, scans for a frame syncword, decodes the header
//! fields from the version/layer/bitrate tables, and double-checks against the
//! following frame header when enough bytes are available.

use tracing::debug;

use super::{ExtractError, Fetch, id3v2_len};

const PARSE_BUFFER_SIZE: usize = 2048;

#[derive(Debug, Clone, Copy, Default)]
pub struct Mp3Info {
    pub channels: u8,
    pub sample_rate: u32,
    /// kbit/s.
    pub bit_rate: u32,
    pub frame_size: u32,
    /// Absolute offset of the first valid frame.
    pub frame_start_offset: u64,
}

/// Locate an MPEG syncword (`0xFFE0`) in `buf`, returning its offset.
pub fn find_syncword(buf: &[u8]) -> Option<usize> {
    buf.windows(2)
        .position(|w| w[0] == 0xFF && (w[1] & 0xE0) == 0xE0)
}

/// Parse one frame header at the start of `buf`.
///
/// When `buf` also holds the start of the following frame, that header is
/// required to be valid too, rejecting syncword look-alikes inside payload data.
pub fn parse_header(buf: &[u8], info: &mut Mp3Info) -> Result<(), ExtractError> {
    if buf.len() < 4 {
        return Err(ExtractError::Underflow);
    }
    let fields = decode_header_fields(buf)?;
    info.channels = fields.channels;
    info.sample_rate = fields.sample_rate;
    info.bit_rate = fields.bit_rate;
    info.frame_size = fields.frame_size;

    let next = fields.frame_size as usize;
    if next + 4 <= buf.len() {
        decode_header_fields(&buf[next..])?;
    } else {
        debug!(frame_size = next, "not enough data to double-check next frame header");
    }
    Ok(())
}

struct HeaderFields {
    channels: u8,
    sample_rate: u32,
    bit_rate: u32,
    frame_size: u32,
}

fn decode_header_fields(buf: &[u8]) -> Result<HeaderFields, ExtractError> {
    if buf.len() < 4 {
        return Err(ExtractError::Underflow);
    }
    if buf[0] != 0xFF || (buf[1] & 0xE0) != 0xE0 {
        return Err(ExtractError::InvalidHeader);
    }

    let ver = (buf[1] >> 3) & 0x03; // 3 = MPEG1, 2 = MPEG2, 0 = MPEG2.5
    let layer = (buf[1] >> 1) & 0x03; // 3 = L1, 2 = L2, 1 = L3
    let br_idx = (buf[2] >> 4) & 0x0F;
    let sr_idx = (buf[2] >> 2) & 0x03;
    let padding = ((buf[2] >> 1) & 0x01) as u32;
    let mode = (buf[3] >> 6) & 0x03;

    if ver == 1 || sr_idx >= 3 || layer == 0 || br_idx == 15 || br_idx == 0 {
        return Err(ExtractError::InvalidHeader);
    }

    const SAMPLING_RATE_V1: [u32; 3] = [44100, 48000, 32000];
    let mut sample_rate = SAMPLING_RATE_V1[sr_idx as usize];
    if ver == 2 {
        sample_rate /= 2;
    } else if ver == 0 {
        sample_rate /= 4;
    }

    let bit_rate;
    let frame_size;
    if layer == 3 {
        // Layer I
        const BITRATE_V1: [u32; 14] = [32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448];
        const BITRATE_V2: [u32; 14] = [32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256];
        bit_rate = if ver == 3 {
            BITRATE_V1[br_idx as usize - 1]
        } else {
            BITRATE_V2[br_idx as usize - 1]
        };
        frame_size = (12000 * bit_rate / sample_rate + padding) * 4;
    } else {
        // Layer II / III
        const BITRATE_V1_L2: [u32; 14] = [32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384];
        const BITRATE_V1_L3: [u32; 14] = [32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
        const BITRATE_V2: [u32; 14] = [8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];
        bit_rate = if ver == 3 {
            if layer == 2 {
                BITRATE_V1_L2[br_idx as usize - 1]
            } else {
                BITRATE_V1_L3[br_idx as usize - 1]
            }
        } else {
            BITRATE_V2[br_idx as usize - 1]
        };
        frame_size = if ver == 3 {
            144000 * bit_rate / sample_rate + padding
        } else {
            let base = if layer == 1 { 72000 } else { 144000 };
            base * bit_rate / sample_rate + padding
        };
    }

    Ok(HeaderFields {
        channels: if mode == 0x03 { 1 } else { 2 },
        sample_rate,
        bit_rate,
        frame_size,
    })
}

/// Run the extractor against a fetch source.
pub fn extract(fetch: &mut dyn Fetch, info: &mut Mp3Info) -> Result<(), ExtractError> {
    let mut buf = vec![0u8; PARSE_BUFFER_SIZE];
    let mut n = fetch.fetch(&mut buf, 0)?;
    if n < 4 {
        return Err(ExtractError::Underflow);
    }

    let mut frame_start = id3v2_len(&buf[..n]);
    if frame_start > 0 {
        debug!(tag_len = frame_start, "skipping ID3v2 tag");
    }

    if frame_start as usize + 4 <= n {
        if parse_header(&buf[frame_start as usize..n], info).is_ok() {
            info.frame_start_offset = frame_start;
            return Ok(());
        }
    }

    if frame_start != 0 {
        // The tag was longer than the first buffer; refill past it.
        n = fetch.fetch(&mut buf, frame_start)?;
        if n < 4 {
            return Err(ExtractError::Underflow);
        }
    }

    // Scan forward for a header that survives the double check.
    let mut pos = 0usize;
    loop {
        if pos + 4 > n {
            return Err(ExtractError::InvalidHeader);
        }
        match find_syncword(&buf[pos..n]) {
            Some(off) => {
                pos += off;
                if parse_header(&buf[pos..n], info).is_ok() {
                    info.frame_start_offset = frame_start + pos as u64;
                    return Ok(());
                }
                pos += 1;
            }
            None => return Err(ExtractError::InvalidHeader),
        }
    }
}

#[cfg(test)]
pub(crate) fn frame_header(sample_rate: u32, bit_rate: u32, channels: u8, padding: bool) -> [u8; 4] {
    // MPEG1 Layer III header for tests.
    let sr_idx = match sample_rate {
        44100 => 0u8,
        48000 => 1,
        32000 => 2,
        _ => panic!("unsupported test sample rate"),
    };
    const BITRATE_V1_L3: [u32; 14] = [32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
    let br_idx = BITRATE_V1_L3
        .iter()
        .position(|&b| b == bit_rate)
        .expect("unsupported test bitrate") as u8
        + 1;
    let mode = if channels == 1 { 0x03u8 } else { 0x00 };
    [
        0xFF,
        0xFB, // MPEG1, Layer III, no CRC
        (br_idx << 4) | (sr_idx << 2) | ((padding as u8) << 1),
        mode << 6,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_with_frames(sample_rate: u32, bit_rate: u32, id3_pad: usize) -> Vec<u8> {
        let header = frame_header(sample_rate, bit_rate, 2, false);
        let frame_size = (144000 * bit_rate / sample_rate) as usize;
        let mut out = Vec::new();
        if id3_pad > 0 {
            let body = id3_pad - 10;
            out.extend_from_slice(b"ID3");
            out.extend_from_slice(&[3, 0, 0]);
            out.extend_from_slice(&[
                ((body >> 21) & 0x7F) as u8,
                ((body >> 14) & 0x7F) as u8,
                ((body >> 7) & 0x7F) as u8,
                (body & 0x7F) as u8,
            ]);
            out.resize(id3_pad, 0);
        }
        for _ in 0..3 {
            out.extend_from_slice(&header);
            out.resize(out.len() + frame_size - 4, 0xAA);
        }
        out
    }

    struct SliceFetch<'a>(&'a [u8]);
    impl Fetch for SliceFetch<'_> {
        fn fetch(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, ExtractError> {
            let off = offset as usize;
            if off >= self.0.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.0.len() - off);
            buf[..n].copy_from_slice(&self.0[off..off + n]);
            Ok(n)
        }
    }

    #[test]
    fn frame_size_matches_layer3_formula() {
        // 144000 * bitrate / rate + padding, within a byte of the reference.
        for &(rate, br) in &[(44100u32, 128u32), (48000, 192), (32000, 64)] {
            for padding in [false, true] {
                let hdr = frame_header(rate, br, 2, padding);
                let mut info = Mp3Info::default();
                let mut buf = hdr.to_vec();
                buf.resize(4, 0);
                // Single header only: double check is skipped for short buffers.
                parse_header(&buf, &mut info).unwrap();
                let expect = 144000 * br / rate + padding as u32;
                assert!(info.frame_size.abs_diff(expect) <= 1);
            }
        }
    }

    #[test]
    fn extracts_plain_stream() {
        let data = stream_with_frames(44100, 128, 0);
        let mut info = Mp3Info::default();
        extract(&mut SliceFetch(&data), &mut info).unwrap();
        assert_eq!(info.sample_rate, 44100);
        assert_eq!(info.bit_rate, 128);
        assert_eq!(info.channels, 2);
        assert_eq!(info.frame_start_offset, 0);
    }

    #[test]
    fn skips_id3v2_tag() {
        let data = stream_with_frames(48000, 192, 4106);
        let mut info = Mp3Info::default();
        extract(&mut SliceFetch(&data), &mut info).unwrap();
        assert_eq!(info.frame_start_offset, 4106);
        assert_eq!(info.sample_rate, 48000);
    }

    #[test]
    fn resynchronizes_past_false_syncword() {
        let mut data = vec![0xFF, 0xE2, 0x00, 0x00, 0x12, 0x34]; // sync-like garbage
        data.extend_from_slice(&stream_with_frames(44100, 128, 0));
        let mut info = Mp3Info::default();
        extract(&mut SliceFetch(&data), &mut info).unwrap();
        assert_eq!(info.frame_start_offset, 6);
    }

    #[test]
    fn rejects_garbage() {
        let data = vec![0u8; 512];
        let mut info = Mp3Info::default();
        assert_eq!(
            extract(&mut SliceFetch(&data), &mut info),
            Err(ExtractError::InvalidHeader)
        );
    }
}
