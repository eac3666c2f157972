//! MPEG-4 audio (M4A) container extractor.
//!
//! A pull parser over the atom tree: `ftyp` first, then either `moov` (parse in
//! place) or `mdat` (record its span and retry the parse at the `moov` that
//! follows it). The `stbl` tables are converted into owned arrays once; the
//! seek helper is a scan over the chunk-offset table.
//!
//! The tables can be large for long files; they are immutable after parsing and
//! the decoder only ever borrows them.

use tracing::{debug, warn};

use super::{ExtractError, Fetch};

const ESDS_MAX_LEN: usize = 256;
const ASC_MAX_LEN: usize = 16;

#[derive(Debug, Clone, Copy, Default)]
pub struct TimeToSample {
    pub sample_count: u32,
    pub sample_duration: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SampleToChunk {
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
    pub sample_description_index: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkOffset {
    /// Index of the first sample stored in this chunk.
    pub sample_index: u32,
    /// Absolute file offset of the chunk.
    pub chunk_offset: u32,
}

#[derive(Debug, Clone, Default)]
pub struct AudioSpecificConfig {
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u8,
}

#[derive(Debug, Clone, Default)]
pub struct M4aInfo {
    pub channels: u8,
    pub sample_rate: u32,
    pub bits: u8,
    pub bitrate_max: u32,
    pub bitrate_avg: u32,
    pub asc: AudioSpecificConfig,
    pub time_scale: u32,
    pub duration: u32,
    /// Absolute offset of the first media chunk (equals `stco[0].chunk_offset`).
    pub mdat_offset: u64,
    pub mdat_size: u64,
    pub moov_offset: u64,
    pub moov_tail: bool,
    /// Per-sample sizes (`stsz`); every entry fits in 16 bits.
    pub stsz: Vec<u16>,
    pub stsz_max: u16,
    /// Decode cursor into `stsz`, advanced by the decoder and rewritten on seek.
    pub stsz_index: u32,
    pub stts: Vec<TimeToSample>,
    pub stsc: Vec<SampleToChunk>,
    pub stco: Vec<ChunkOffset>,
}

impl M4aInfo {
    pub fn duration_ms(&self) -> u32 {
        if self.time_scale == 0 {
            return 0;
        }
        (self.duration as u64 * 1000 / self.time_scale as u64) as u32
    }
}

/// Cursor over a `Fetch` source with atom-level helpers.
struct AtomReader<'a> {
    fetch: &'a mut dyn Fetch,
    offset: u64,
}

impl<'a> AtomReader<'a> {
    fn new(fetch: &'a mut dyn Fetch, offset: u64) -> Self {
        Self { fetch, offset }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ExtractError> {
        let mut done = 0usize;
        while done < buf.len() {
            let n = self.fetch.fetch(&mut buf[done..], self.offset)?;
            if n == 0 {
                return Err(ExtractError::Underflow);
            }
            done += n;
            self.offset += n as u64;
        }
        Ok(())
    }

    fn skip(&mut self, len: u64) {
        self.offset += len;
    }

    fn read_u32(&mut self) -> Result<u32, ExtractError> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    fn read_u16(&mut self) -> Result<u16, ExtractError> {
        let mut b = [0u8; 2];
        self.read_exact(&mut b)?;
        Ok(u16::from_be_bytes(b))
    }

    /// Read the next atom header `(size, name)`.
    fn atom_header(&mut self) -> Result<(u64, [u8; 4]), ExtractError> {
        let size = self.read_u32()? as u64;
        let mut name = [0u8; 4];
        self.read_exact(&mut name)?;
        if size < 8 {
            return Err(ExtractError::InvalidHeader);
        }
        Ok((size, name))
    }

    /// Skip atoms at the current position until `name` is found; the cursor is
    /// left just past the matching header. Returns the atom's size.
    fn find_atom(&mut self, name: &[u8; 4]) -> Result<u64, ExtractError> {
        loop {
            let (size, found) = self.atom_header()?;
            debug!(atom = %String::from_utf8_lossy(&found), size, offset = self.offset, "atom");
            if &found == name {
                return Ok(size);
            }
            self.skip(size - 8);
        }
    }
}

fn parse_mdhd(rd: &mut AtomReader<'_>, size: u64, info: &mut M4aInfo) -> Result<(), ExtractError> {
    rd.read_u32()?; // version/flags
    rd.read_u32()?; // creation time
    rd.read_u32()?; // modification time
    info.time_scale = rd.read_u32()?;
    info.sample_rate = info.time_scale; // fixed up from the ASC later
    info.duration = rd.read_u32()?;
    rd.read_u16()?; // language
    rd.read_u16()?; // pre_defined
    if size > 8 + 24 {
        rd.skip(size - 8 - 24);
    }
    Ok(())
}

fn parse_hdlr(rd: &mut AtomReader<'_>, size: u64) -> Result<(), ExtractError> {
    rd.read_u32()?; // version/flags
    rd.read_u32()?; // component type
    let mut subtype = [0u8; 4];
    rd.read_exact(&mut subtype)?;
    if &subtype != b"soun" {
        warn!(subtype = %String::from_utf8_lossy(&subtype), "hdlr is not an audio track");
        return Err(ExtractError::Unsupported);
    }
    rd.skip(size.saturating_sub(8 + 12));
    Ok(())
}

fn parse_stsd(rd: &mut AtomReader<'_>) -> Result<(), ExtractError> {
    rd.read_u32()?; // version/flags
    let entries = rd.read_u32()?;
    if entries != 1 {
        return Err(ExtractError::Unsupported);
    }
    Ok(())
}

fn parse_mp4a(rd: &mut AtomReader<'_>, info: &mut M4aInfo) -> Result<(), ExtractError> {
    let mut reserved = [0u8; 6];
    rd.read_exact(&mut reserved)?;
    rd.read_u16()?; // data reference index
    rd.read_u16()?; // version
    rd.read_u16()?; // revision level
    rd.read_u32()?; // vendor
    info.channels = rd.read_u16()? as u8; // fixed up from the ASC later
    info.bits = rd.read_u16()? as u8;
    rd.read_u16()?; // compression id
    rd.read_u16()?; // packet size
    rd.read_u32()?; // sample rate 16.16
    Ok(())
}

/// Expandable-size field used by MPEG-4 descriptors.
fn descriptor_size(buf: &[u8], pos: &mut usize) -> Result<usize, ExtractError> {
    let mut size = 0usize;
    for _ in 0..4 {
        let b = *buf.get(*pos).ok_or(ExtractError::Underflow)?;
        *pos += 1;
        size = (size << 7) | (b & 0x7F) as usize;
        if b & 0x80 == 0 {
            break;
        }
    }
    Ok(size)
}

fn parse_esds(rd: &mut AtomReader<'_>, size: u64, info: &mut M4aInfo) -> Result<(), ExtractError> {
    const ES_DESCR: u8 = 3;
    const DEC_CONFIG_DESCR: u8 = 4;
    const DEC_SPECIFIC_DESCR: u8 = 5;

    let body_len = (size - 8) as usize;
    if body_len > ESDS_MAX_LEN {
        return Err(ExtractError::Unsupported);
    }
    let mut body = vec![0u8; body_len];
    rd.read_exact(&mut body)?;

    let mut pos = 4usize; // version/flags
    let tag = |b: &[u8], p: usize| -> Result<u8, ExtractError> {
        b.get(p).copied().ok_or(ExtractError::Underflow)
    };

    if tag(&body, pos)? != ES_DESCR {
        return Err(ExtractError::InvalidHeader);
    }
    pos += 1;
    descriptor_size(&body, &mut pos)?;
    pos += 3; // ES id + stream priority flags

    if tag(&body, pos)? != DEC_CONFIG_DESCR {
        return Err(ExtractError::InvalidHeader);
    }
    pos += 1;
    descriptor_size(&body, &mut pos)?;
    if tag(&body, pos)? != 0x40 {
        // Not MPEG-4 audio.
        return Err(ExtractError::Unsupported);
    }
    pos += 1;
    pos += 4; // stream type + buffer size
    if pos + 8 > body.len() {
        return Err(ExtractError::Underflow);
    }
    info.bitrate_max = u32::from_be_bytes([body[pos], body[pos + 1], body[pos + 2], body[pos + 3]]);
    info.bitrate_avg =
        u32::from_be_bytes([body[pos + 4], body[pos + 5], body[pos + 6], body[pos + 7]]);
    pos += 8;

    if tag(&body, pos)? != DEC_SPECIFIC_DESCR {
        return Err(ExtractError::InvalidHeader);
    }
    pos += 1;
    let asc_len = descriptor_size(&body, &mut pos)?;
    if asc_len > ASC_MAX_LEN || pos + asc_len > body.len() {
        return Err(ExtractError::InvalidHeader);
    }
    info.asc.data = body[pos..pos + asc_len].to_vec();
    Ok(())
}

fn parse_stts(rd: &mut AtomReader<'_>, size: u64, info: &mut M4aInfo) -> Result<(), ExtractError> {
    rd.read_u32()?; // version/flags
    let entries = rd.read_u32()?;
    let body = size.checked_sub(8 + 8).ok_or(ExtractError::InvalidHeader)?;
    if entries as u64 * 8 > body {
        return Err(ExtractError::InvalidHeader);
    }
    info.stts = Vec::new();
    info.stts
        .try_reserve_exact(entries as usize)
        .map_err(|_| ExtractError::NoMem)?;
    for _ in 0..entries {
        info.stts.push(TimeToSample {
            sample_count: rd.read_u32()?,
            sample_duration: rd.read_u32()?,
        });
    }
    rd.skip(body - entries as u64 * 8);
    Ok(())
}

fn parse_stsc(rd: &mut AtomReader<'_>, size: u64, info: &mut M4aInfo) -> Result<(), ExtractError> {
    rd.read_u32()?; // version/flags
    let entries = rd.read_u32()?;
    let body = size.checked_sub(8 + 8).ok_or(ExtractError::InvalidHeader)?;
    if entries as u64 * 12 > body {
        return Err(ExtractError::InvalidHeader);
    }
    info.stsc = Vec::new();
    info.stsc
        .try_reserve_exact(entries as usize)
        .map_err(|_| ExtractError::NoMem)?;
    for _ in 0..entries {
        info.stsc.push(SampleToChunk {
            first_chunk: rd.read_u32()?,
            samples_per_chunk: rd.read_u32()?,
            sample_description_index: rd.read_u32()?,
        });
    }
    rd.skip(body - entries as u64 * 12);
    Ok(())
}

fn parse_stsz(rd: &mut AtomReader<'_>, size: u64, info: &mut M4aInfo) -> Result<(), ExtractError> {
    rd.read_u32()?; // version/flags
    rd.read_u32()?; // uniform sample size
    let entries = rd.read_u32()?;
    let body = size.checked_sub(8 + 12).ok_or(ExtractError::InvalidHeader)?;
    if entries as u64 * 4 > body {
        return Err(ExtractError::InvalidHeader);
    }
    info.stsz = Vec::new();
    info.stsz
        .try_reserve_exact(entries as usize)
        .map_err(|_| ExtractError::NoMem)?;
    for _ in 0..entries {
        let sample_size = rd.read_u32()?;
        // Sizes are stored as u16 to halve table memory; larger frames are out
        // of contract for this decoder.
        if sample_size > 0xFFFF {
            warn!(sample_size, "stsz sample larger than 16-bit limit");
            return Err(ExtractError::Unsupported);
        }
        let sample_size = sample_size as u16;
        if sample_size > info.stsz_max {
            info.stsz_max = sample_size;
        }
        info.stsz.push(sample_size);
    }
    rd.skip(body - entries as u64 * 4);
    Ok(())
}

fn parse_stco(rd: &mut AtomReader<'_>, size: u64, info: &mut M4aInfo) -> Result<(), ExtractError> {
    rd.read_u32()?; // version/flags
    let entries = rd.read_u32()?;
    let body = size.checked_sub(8 + 8).ok_or(ExtractError::InvalidHeader)?;
    if entries as u64 * 4 > body || entries == 0 {
        return Err(ExtractError::InvalidHeader);
    }
    if info.stsc.is_empty() {
        return Err(ExtractError::Opcode);
    }
    info.stco = Vec::new();
    info.stco
        .try_reserve_exact(entries as usize)
        .map_err(|_| ExtractError::NoMem)?;

    // Expand the stsc run-length encoding into a cumulative first-sample index
    // per chunk, so seeking is a single scan over this table.
    let mut run = 0usize;
    let mut samples_so_far = 0u32;
    for chunk in 1..=entries {
        while run + 1 < info.stsc.len() && info.stsc[run + 1].first_chunk <= chunk {
            run += 1;
        }
        let offset = rd.read_u32()?;
        info.stco.push(ChunkOffset {
            sample_index: samples_so_far,
            chunk_offset: offset,
        });
        samples_so_far = samples_so_far.saturating_add(info.stsc[run].samples_per_chunk);
    }
    rd.skip(body - entries as u64 * 4);

    info.mdat_offset = info.stco[0].chunk_offset as u64;
    Ok(())
}

fn parse_moov(rd: &mut AtomReader<'_>, info: &mut M4aInfo) -> Result<(), ExtractError> {
    let size = rd.find_atom(b"mvhd")?;
    rd.skip(size - 8);

    rd.find_atom(b"trak")?;
    let size = rd.find_atom(b"tkhd")?;
    rd.skip(size - 8);
    rd.find_atom(b"mdia")?;
    let size = rd.find_atom(b"mdhd")?;
    parse_mdhd(rd, size, info)?;
    let size = rd.find_atom(b"hdlr")?;
    parse_hdlr(rd, size)?;
    rd.find_atom(b"minf")?;
    let size = rd.find_atom(b"smhd")?;
    rd.skip(size - 8);
    let size = rd.find_atom(b"dinf")?;
    rd.skip(size - 8);
    rd.find_atom(b"stbl")?;
    rd.find_atom(b"stsd")?;
    parse_stsd(rd)?;
    rd.find_atom(b"mp4a")?;
    parse_mp4a(rd, info)?;
    let size = rd.find_atom(b"esds")?;
    parse_esds(rd, size, info)?;
    let size = rd.find_atom(b"stts")?;
    parse_stts(rd, size, info)?;
    let size = rd.find_atom(b"stsc")?;
    parse_stsc(rd, size, info)?;
    let size = rd.find_atom(b"stsz")?;
    parse_stsz(rd, size, info)?;
    let size = rd.find_atom(b"stco")?;
    parse_stco(rd, size, info)?;
    Ok(())
}

/// Decode the 2-byte AudioSpecificConfig into rate/channels.
fn apply_asc(info: &mut M4aInfo) -> Result<(), ExtractError> {
    const SAMPLE_RATES: [u32; 12] = [
        96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000,
    ];
    if info.asc.data.len() < 2 {
        return Err(ExtractError::InvalidHeader);
    }
    let config = ((info.asc.data[0] as u16) << 8) | info.asc.data[1] as u16;
    let rate_index = ((config >> 7) & 0x0F) as usize;
    let channels = ((config >> 3) & 0x07) as u8;
    if rate_index >= SAMPLE_RATES.len() {
        return Err(ExtractError::InvalidHeader);
    }
    info.asc.sample_rate = SAMPLE_RATES[rate_index];
    info.asc.channels = channels;
    Ok(())
}

/// First pass: validate `ftyp` and locate either `moov` or `mdat`.
fn check_header(rd: &mut AtomReader<'_>, info: &mut M4aInfo) -> Result<(), ExtractError> {
    let (size, name) = rd.atom_header()?;
    if &name != b"ftyp" {
        return Err(ExtractError::Unsupported);
    }
    rd.skip(size - 8);

    loop {
        let atom_start = rd.offset;
        let (size, name) = rd.atom_header()?;
        match &name {
            b"moov" => {
                info.moov_tail = false;
                return parse_moov(rd, info);
            }
            b"mdat" => {
                // Tables live behind the media payload; restart there.
                info.mdat_offset = atom_start;
                info.mdat_size = size;
                info.moov_offset = atom_start + size;
                info.moov_tail = true;
                debug!(moov_offset = info.moov_offset, "moov behind mdat");
                return Err(ExtractError::Again);
            }
            _ => rd.skip(size - 8),
        }
    }
}

/// Run the extractor against a fetch source.
///
/// A `moov`-behind-`mdat` layout makes the first pass return [`ExtractError::Again`]
/// internally; the parse is then retried once at `moov_offset` through the same
/// fetch source (which reopens or seeks as needed).
pub fn extract(fetch: &mut dyn Fetch, info: &mut M4aInfo) -> Result<(), ExtractError> {
    let first = {
        let mut rd = AtomReader::new(&mut *fetch, 0);
        check_header(&mut rd, info)
    };
    match first {
        Ok(()) => {}
        Err(ExtractError::Again) => {
            let mut rd = AtomReader::new(fetch, info.moov_offset);
            rd.find_atom(b"moov")?;
            parse_moov(&mut rd, info)?;
        }
        Err(e) => return Err(e),
    }
    if info.stts.is_empty() || info.stco.is_empty() || info.stsz.is_empty() {
        return Err(ExtractError::InvalidHeader);
    }
    apply_asc(info)?;
    Ok(())
}

/// Map a seek time to `(stsz sample index, absolute chunk byte offset)`.
pub fn seek_offset(info: &M4aInfo, seek_ms: u32) -> Option<(u32, u64)> {
    let stts = info.stts.first()?;
    if stts.sample_duration == 0 || info.time_scale == 0 {
        return None;
    }
    let target = (seek_ms as u64 * info.time_scale as u64 / 1000 / stts.sample_duration as u64) as u32;

    let mut found = None;
    for pair in info.stco.windows(2) {
        if target >= pair[0].sample_index && target < pair[1].sample_index {
            found = Some(pair[0]);
            break;
        }
    }
    // Past the second-to-last boundary: the final chunk holds the target.
    let entry = found.or_else(|| {
        info.stco
            .last()
            .filter(|last| target >= last.sample_index)
            .copied()
    })?;

    if (entry.chunk_offset as u64) < info.mdat_offset {
        return None;
    }
    Some((entry.sample_index, entry.chunk_offset as u64))
}
