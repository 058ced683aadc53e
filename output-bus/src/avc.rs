use bytes::{BufMut, Bytes, BytesMut};

use crate::{error::OutputError, packet::EncoderPacket};

pub const NAL_SLICE: u8 = 1;
pub const NAL_SLICE_IDR: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

/// Annex B start code (4-byte)
const START_CODE: &[u8] = &[0x00, 0x00, 0x00, 0x01];

pub fn nal_type(nal: &[u8]) -> u8 {
    nal.first().map(|b| b & 0x1f).unwrap_or(0)
}

/// True if 4-byte big-endian NAL lengths tile the whole buffer.
pub fn is_avcc_packet(data: &[u8]) -> bool {
    let mut i = 0;
    while i + 4 <= data.len() {
        let len = u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]) as usize;
        if len == 0 {
            return false;
        }
        i += 4;
        match i.checked_add(len) {
            Some(end) if end <= data.len() => i = end,
            _ => return false,
        }
    }
    i == data.len() && i > 0
}

/// Check if packet data is in Annex B format by looking at the start codes.
///
/// A length-prefixed buffer whose first length reads like a start code
/// (`00 00 01 xx`, `00 00 00 01`) is not Annex B.
pub fn is_annexb_packet(data: &[u8]) -> bool {
    if data.len() < 4 || is_avcc_packet(data) {
        return false;
    }
    if data[0] == 0x00 && data[1] == 0x00 && data[2] == 0x00 && data[3] == 0x01 {
        return true;
    }
    if data[0] == 0x00 && data[1] == 0x00 && data[2] == 0x01 {
        return true;
    }
    false
}

/// Returns the offset of the next `00 00 01` at or after `from`.
fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    if data.len() < 3 {
        return None;
    }
    (from..data.len() - 2).find(|&i| data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1)
}

/// Iterates the NAL units of an Annex B byte stream.
///
/// Accepts both 3- and 4-byte start codes. Trailing zero bytes belonging to
/// the next 4-byte start code are not part of the yielded unit.
pub struct AnnexBNals<'a> {
    data: &'a [u8],
    next: Option<usize>,
}

impl<'a> AnnexBNals<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        let next = find_start_code(data, 0).map(|pos| pos + 3);
        Self { data, next }
    }
}

impl<'a> Iterator for AnnexBNals<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let start = self.next?;
            let end = match find_start_code(self.data, start) {
                Some(pos) => {
                    self.next = Some(pos + 3);
                    let mut end = pos;
                    while end > start && self.data[end - 1] == 0 {
                        end -= 1;
                    }
                    end
                }
                None => {
                    self.next = None;
                    self.data.len()
                }
            };
            if end > start {
                return Some(&self.data[start..end]);
            }
        }
    }
}

/// Converts Annex B (start code + NAL) to AVCC (4-byte big-endian length + NAL).
pub fn convert_annexb_to_avcc(annexb: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(annexb.len() + 16);
    for nal in AnnexBNals::new(annexb) {
        out.put_u32(nal.len() as u32);
        out.extend_from_slice(nal);
    }
    out.freeze()
}

/// Converts AVCC (4-byte length + NAL) to Annex B (start code + NAL).
pub fn convert_avcc_to_annexb(avcc: &[u8]) -> Bytes {
    let mut out = BytesMut::new();
    let mut i = 0;
    while i + 4 <= avcc.len() {
        let len = (u32::from(avcc[i]) << 24
            | u32::from(avcc[i + 1]) << 16
            | u32::from(avcc[i + 2]) << 8
            | u32::from(avcc[i + 3])) as usize;
        i += 4;
        if len == 0 || i + len > avcc.len() {
            break;
        }
        out.extend_from_slice(START_CODE);
        out.extend_from_slice(&avcc[i..i + len]);
        i += len;
    }
    out.freeze()
}

/// True if the Annex B access unit contains an IDR slice.
pub fn avc_keyframe(data: &[u8]) -> bool {
    AnnexBNals::new(data).any(|nal| nal_type(nal) == NAL_SLICE_IDR)
}

/// Re-encapsulates a video packet into length-prefixed NAL units.
///
/// Packets that are already length-prefixed pass through unchanged.
pub fn parse_avc_packet(packet: &EncoderPacket) -> EncoderPacket {
    let mut out = packet.clone();
    if is_annexb_packet(&packet.data) {
        out.keyframe = packet.keyframe || avc_keyframe(&packet.data);
        out.data = convert_annexb_to_avcc(&packet.data);
    }
    out
}

/// Builds an AVCDecoderConfigurationRecord from encoder extra data.
///
/// Extra data that already is a record (first byte 1) is returned as is.
pub fn parse_avc_header(extra: &[u8]) -> Result<Bytes, OutputError> {
    if extra.first() == Some(&0x01) && extra.len() >= 7 {
        return Ok(Bytes::copy_from_slice(extra));
    }

    let (sps_list, pps_list) = parameter_sets(extra);
    let sps = sps_list
        .first()
        .filter(|sps| sps.len() >= 4)
        .ok_or_else(|| OutputError::InvalidStream("video header has no SPS".into()))?;
    if pps_list.is_empty() {
        return Err(OutputError::InvalidStream("video header has no PPS".into()));
    }

    let mut out = BytesMut::new();
    out.put_u8(0x01);
    out.put_u8(sps[1]);
    out.put_u8(sps[2]);
    out.put_u8(sps[3]);
    // 4-byte NAL length fields
    out.put_u8(0xff);
    out.put_u8(0xe0 | (sps_list.len() as u8 & 0x1f));
    for sps in &sps_list {
        out.put_u16(sps.len() as u16);
        out.extend_from_slice(sps);
    }
    out.put_u8(pps_list.len() as u8);
    for pps in &pps_list {
        out.put_u16(pps.len() as u16);
        out.extend_from_slice(pps);
    }
    Ok(out.freeze())
}

/// Splits Annex B extra data into its SPS and PPS units.
pub fn parameter_sets(extra: &[u8]) -> (Vec<&[u8]>, Vec<&[u8]>) {
    let mut sps = Vec::new();
    let mut pps = Vec::new();
    for nal in AnnexBNals::new(extra) {
        match nal_type(nal) {
            NAL_SPS => sps.push(nal),
            NAL_PPS => pps.push(nal),
            _ => {}
        }
    }
    (sps, pps)
}
