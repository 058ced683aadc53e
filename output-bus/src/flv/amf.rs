use bytes::{BufMut, Bytes, BytesMut};

const AMF_NUMBER: u8 = 0x00;
const AMF_BOOLEAN: u8 = 0x01;
const AMF_STRING: u8 = 0x02;
const AMF_OBJECT: u8 = 0x03;
const AMF_ECMA_ARRAY: u8 = 0x08;
const AMF_OBJECT_END: u8 = 0x09;
const AMF_STRICT_ARRAY: u8 = 0x0a;

/// AMF0 encoder for FLV script data.
///
/// Number writers return the offset of the 8-byte payload so callers can
/// patch the value in place later.
#[derive(Default)]
pub(crate) struct AmfWriter {
    buf: BytesMut,
}

impl AmfWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(&mut self, name: &str) {
        self.buf.put_u16(name.len() as u16);
        self.buf.extend_from_slice(name.as_bytes());
    }

    pub fn string(&mut self, value: &str) {
        self.buf.put_u8(AMF_STRING);
        self.key(value);
    }

    pub fn ecma_array(&mut self, count: u32) {
        self.buf.put_u8(AMF_ECMA_ARRAY);
        self.buf.put_u32(count);
    }

    pub fn number(&mut self, name: &str, value: f64) -> usize {
        self.key(name);
        self.number_value(value)
    }

    pub fn number_value(&mut self, value: f64) -> usize {
        self.buf.put_u8(AMF_NUMBER);
        let offset = self.buf.len();
        self.buf.put_f64(value);
        offset
    }

    pub fn boolean(&mut self, name: &str, value: bool) {
        self.key(name);
        self.buf.put_u8(AMF_BOOLEAN);
        self.buf.put_u8(value as u8);
    }

    pub fn string_entry(&mut self, name: &str, value: &str) {
        self.key(name);
        self.string(value);
    }

    pub fn object(&mut self, name: &str) {
        self.key(name);
        self.buf.put_u8(AMF_OBJECT);
    }

    /// Writes `count` zeroed numbers and returns the offset of the first payload.
    pub fn number_array(&mut self, name: &str, count: usize) -> usize {
        self.key(name);
        self.buf.put_u8(AMF_STRICT_ARRAY);
        self.buf.put_u32(count as u32);
        let first = self.buf.len() + 1;
        for _ in 0..count {
            self.number_value(0.0);
        }
        first
    }

    pub fn end_object(&mut self) {
        self.buf.put_u16(0);
        self.buf.put_u8(AMF_OBJECT_END);
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_entry() {
        let mut amf = AmfWriter::new();
        let offset = amf.number("duration", 1.5);
        let bytes = amf.into_bytes();
        assert_eq!(&bytes[..2], &[0x00, 0x08]);
        assert_eq!(&bytes[2..10], b"duration");
        assert_eq!(bytes[10], AMF_NUMBER);
        assert_eq!(offset, 11);
        assert_eq!(&bytes[offset..offset + 8], &1.5f64.to_be_bytes());
    }

    #[test]
    fn test_number_array_layout() {
        let mut amf = AmfWriter::new();
        let first = amf.number_array("times", 3);
        let bytes = amf.into_bytes();
        // key + marker + count + 3 * (marker + f64)
        assert_eq!(bytes.len(), 2 + 5 + 1 + 4 + 3 * 9);
        assert_eq!(bytes[first - 1], AMF_NUMBER);
        assert_eq!(bytes[first + 8], AMF_NUMBER);
    }

    #[test]
    fn test_object_end_marker() {
        let mut amf = AmfWriter::new();
        amf.string("onMetaData");
        amf.end_object();
        let bytes = amf.into_bytes();
        assert_eq!(&bytes[..3], &[AMF_STRING, 0x00, 0x0a]);
        assert_eq!(&bytes[bytes.len() - 3..], &[0x00, 0x00, 0x09]);
    }
}
