//! AAC ADTS header extractor.
//!
//! Raw AAC streams carry a 7-byte (9 with CRC) header per frame. The extractor
//! skips a leading ID3v2 tag, finds the first ADTS syncword with a sane
//! profile/sample-rate/channel configuration, and records the stream format.
//! Stream duration is unknowable without walking every frame and stays 0.

use tracing::debug;

use super::{ExtractError, Fetch, id3v2_len};

const PARSE_BUFFER_SIZE: usize = 2048;

pub const ADTS_HEADER_LEN: usize = 7;

/// Sample rates by ADTS sample-rate index (table 4.5.1).
pub const SAMPLE_RATES: [u32; 12] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000,
];

#[derive(Debug, Clone, Copy, Default)]
pub struct AacInfo {
    pub channels: u8,
    pub sample_rate: u32,
    /// Audio object type (profile + 1): 1 = Main, 2 = LC, 3 = SSR.
    pub object_type: u8,
    pub sample_rate_index: u8,
    pub frame_start_offset: u64,
}

/// Fields of one ADTS frame header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdtsHeader {
    pub object_type: u8,
    pub sample_rate_index: u8,
    pub channel_config: u8,
    /// Whole-frame length, header included.
    pub frame_length: usize,
    pub crc_present: bool,
}

/// Parse the fixed ADTS header at the start of `buf`.
pub fn parse_adts_header(buf: &[u8]) -> Result<AdtsHeader, ExtractError> {
    if buf.len() < ADTS_HEADER_LEN {
        return Err(ExtractError::Underflow);
    }
    if buf[0] != 0xFF || (buf[1] & 0xF0) != 0xF0 {
        return Err(ExtractError::InvalidHeader);
    }
    let layer = (buf[1] >> 1) & 0x03;
    if layer != 0 {
        return Err(ExtractError::InvalidHeader);
    }
    let profile = (buf[2] >> 6) & 0x03;
    if profile == 3 {
        return Err(ExtractError::Unsupported);
    }
    let sr_idx = (buf[2] >> 2) & 0x0F;
    if sr_idx as usize >= SAMPLE_RATES.len() {
        return Err(ExtractError::InvalidHeader);
    }
    let channel_config = ((buf[2] & 0x01) << 2) | ((buf[3] >> 6) & 0x03);
    if channel_config == 0 || channel_config > 7 {
        return Err(ExtractError::Unsupported);
    }
    let frame_length =
        (((buf[3] as usize & 0x03) << 11) | ((buf[4] as usize) << 3) | ((buf[5] as usize) >> 5)) as usize;
    if frame_length < ADTS_HEADER_LEN {
        return Err(ExtractError::InvalidHeader);
    }
    Ok(AdtsHeader {
        object_type: profile + 1,
        sample_rate_index: sr_idx,
        channel_config,
        frame_length,
        crc_present: (buf[1] & 0x01) == 0,
    })
}

/// Build the 2-byte AudioSpecificConfig equivalent to an ADTS header, for
/// decoders configured out-of-band.
pub fn adts_to_asc(hdr: &AdtsHeader) -> [u8; 2] {
    [
        (hdr.object_type << 3) | (hdr.sample_rate_index >> 1),
        ((hdr.sample_rate_index & 0x01) << 7) | (hdr.channel_config << 3),
    ]
}

/// Run the extractor against a fetch source.
pub fn extract(fetch: &mut dyn Fetch, info: &mut AacInfo) -> Result<(), ExtractError> {
    let mut buf = vec![0u8; PARSE_BUFFER_SIZE];
    let mut n = fetch.fetch(&mut buf, 0)?;
    if n < ADTS_HEADER_LEN {
        return Err(ExtractError::Underflow);
    }

    let tag_len = id3v2_len(&buf[..n]);
    if tag_len > 0 {
        debug!(tag_len, "skipping ID3v2 tag");
        n = fetch.fetch(&mut buf, tag_len)?;
        if n < ADTS_HEADER_LEN {
            return Err(ExtractError::Underflow);
        }
    }

    let mut pos = 0usize;
    while pos + ADTS_HEADER_LEN <= n {
        if buf[pos] == 0xFF && (buf[pos + 1] & 0xF0) == 0xF0 {
            if let Ok(hdr) = parse_adts_header(&buf[pos..n]) {
                info.channels = hdr.channel_config;
                info.sample_rate = SAMPLE_RATES[hdr.sample_rate_index as usize];
                info.object_type = hdr.object_type;
                info.sample_rate_index = hdr.sample_rate_index;
                info.frame_start_offset = tag_len + pos as u64;
                return Ok(());
            }
        }
        pos += 1;
    }
    Err(ExtractError::InvalidHeader)
}

#[cfg(test)]
pub(crate) fn adts_header(sr_idx: u8, channels: u8, frame_length: usize) -> [u8; 7] {
    [
        0xFF,
        0xF1, // MPEG-4, layer 0, no CRC
        (1 << 6) | (sr_idx << 2) | (channels >> 2), // LC profile
        ((channels & 0x03) << 6) | ((frame_length >> 11) as u8 & 0x03),
        (frame_length >> 3) as u8,
        ((frame_length as u8 & 0x07) << 5) | 0x1F,
        0xFC,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn parses_adts_fields() {
        let hdr = adts_header(4, 2, 371); // 44.1 kHz stereo
        let parsed = parse_adts_header(&hdr).unwrap();
        assert_eq!(parsed.sample_rate_index, 4);
        assert_eq!(parsed.channel_config, 2);
        assert_eq!(parsed.frame_length, 371);
        assert_eq!(parsed.object_type, 2);
        assert!(!parsed.crc_present);
    }

    #[test]
    fn asc_round_trips_header_fields() {
        let hdr = parse_adts_header(&adts_header(8, 1, 100)).unwrap(); // 16 kHz mono
        let asc = adts_to_asc(&hdr);
        assert_eq!(asc[0] >> 3, 2); // LC
        let sr_idx = ((asc[0] & 0x07) << 1) | (asc[1] >> 7);
        assert_eq!(sr_idx, 8);
        assert_eq!((asc[1] >> 3) & 0x0F, 1);
    }

    #[test]
    fn extracts_with_leading_junk() {
        let mut data = vec![0x00, 0x11, 0x22];
        data.extend_from_slice(&adts_header(4, 2, 200));
        data.resize(data.len() + 193, 0xAB);
        let mut info = AacInfo::default();
        extract(&mut SliceFetch(&data), &mut info).unwrap();
        assert_eq!(info.frame_start_offset, 3);
        assert_eq!(info.sample_rate, 44100);
        assert_eq!(info.channels, 2);
    }

    #[test]
    fn rejects_mpeg_layer_nonzero() {
        let mut hdr = adts_header(4, 2, 200);
        hdr[1] |= 0x06; // layer bits set
        assert_eq!(parse_adts_header(&hdr), Err(ExtractError::InvalidHeader));
    }

    #[test]
    fn duration_stays_unknown() {
        let mut data = adts_header(4, 2, 64).to_vec();
        data.resize(64, 0);
        let mut info = AacInfo::default();
        extract(&mut SliceFetch(&data), &mut info).unwrap();
        // The extractor only learns format, never length.
        assert_eq!(info.frame_start_offset, 0);
    }
}
