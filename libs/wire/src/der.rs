//! Minimal ASN.1 DER primitives.
//!
//! Only what the RDCleanPath PDU needs: definite lengths, SEQUENCE,
//! INTEGER, OCTET STRING, the common string types, and EXPLICIT
//! context-specific tags.

use crate::error::PduError;

pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_UTF8_STRING: u8 = 0x0C;
pub const TAG_PRINTABLE_STRING: u8 = 0x13;
pub const TAG_IA5_STRING: u8 = 0x16;
pub const TAG_SEQUENCE: u8 = 0x30;

/// Class bits (context-specific) plus the constructed bit.
const CONTEXT_CONSTRUCTED: u8 = 0xA0;
const CONTEXT_TAG_MASK: u8 = 0xE0;
const CONTEXT_NUMBER_MASK: u8 = 0x1F;

/// Widest length field accepted, in bytes.
const MAX_LENGTH_BYTES: usize = 4;

/// Identifier octet for an EXPLICIT `[n]` wrapper.
pub fn context_tag(number: u8) -> u8 {
    CONTEXT_CONSTRUCTED | (number & CONTEXT_NUMBER_MASK)
}

/// Returns the tag number if `tag` is a constructed context-specific tag.
pub fn context_number(tag: u8) -> Option<u8> {
    (tag & CONTEXT_TAG_MASK == CONTEXT_CONSTRUCTED).then_some(tag & CONTEXT_NUMBER_MASK)
}

/// Append a definite length in its shortest form.
pub fn write_length(out: &mut Vec<u8>, len: usize) -> Result<(), PduError> {
    if len < 0x80 {
        out.push(len as u8);
        return Ok(());
    }

    let bytes = u32::try_from(len)
        .map_err(|_| PduError::LengthOverflow(std::mem::size_of::<usize>()))?
        .to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    let significant = &bytes[skip..];

    out.push(0x80 | significant.len() as u8);
    out.extend_from_slice(significant);
    Ok(())
}

/// Append a complete TLV.
pub fn write_tlv(out: &mut Vec<u8>, tag: u8, content: &[u8]) -> Result<(), PduError> {
    out.push(tag);
    write_length(out, content.len())?;
    out.extend_from_slice(content);
    Ok(())
}

/// Encode a non-negative INTEGER's content octets.
pub fn integer_content(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes
        .iter()
        .take_while(|&&b| b == 0)
        .count()
        .min(bytes.len() - 1);
    let mut content = Vec::with_capacity(bytes.len() - skip + 1);
    // Leading zero keeps the value positive in two's complement.
    if bytes[skip] & 0x80 != 0 {
        content.push(0x00);
    }
    content.extend_from_slice(&bytes[skip..]);
    content
}

/// Decode a non-negative INTEGER's content octets.
pub fn parse_integer(content: &[u8]) -> Result<u64, PduError> {
    let Some(&first) = content.first() else {
        return Err(PduError::InvalidInteger);
    };
    if first & 0x80 != 0 {
        return Err(PduError::InvalidInteger);
    }

    let skip = content.iter().take_while(|&&b| b == 0).count();
    let significant = &content[skip..];
    if significant.len() > std::mem::size_of::<u64>() {
        return Err(PduError::InvalidInteger);
    }

    Ok(significant
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
}

/// One decoded TLV borrowed from its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub tag: u8,
    pub content: &'a [u8],
}

/// Sequential reader over concatenated TLVs.
#[derive(Debug, Clone)]
pub struct DerReader<'a> {
    input: &'a [u8],
}

impl<'a> DerReader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> &'a [u8] {
        self.input
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    /// Read the next TLV.
    pub fn read_tlv(&mut self) -> Result<Tlv<'a>, PduError> {
        let input = self.input;
        let (&tag, rest) = input
            .split_first()
            .ok_or(PduError::Truncated { needed: 2 })?;
        let (&first_len, rest) = rest.split_first().ok_or(PduError::Truncated { needed: 1 })?;

        let (len, rest) = if first_len < 0x80 {
            (usize::from(first_len), rest)
        } else if first_len == 0x80 {
            return Err(PduError::IndefiniteLength);
        } else {
            let count = usize::from(first_len & 0x7F);
            if count > MAX_LENGTH_BYTES {
                return Err(PduError::LengthOverflow(count));
            }
            if rest.len() < count {
                return Err(PduError::Truncated {
                    needed: count - rest.len(),
                });
            }
            let (len_bytes, rest) = rest.split_at(count);
            let len = len_bytes
                .iter()
                .fold(0usize, |acc, &b| (acc << 8) | usize::from(b));
            (len, rest)
        };

        if rest.len() < len {
            return Err(PduError::Truncated {
                needed: len - rest.len(),
            });
        }

        let (content, rest) = rest.split_at(len);
        self.input = rest;
        Ok(Tlv { tag, content })
    }

    /// Read the next TLV and require its tag.
    pub fn read_expected(&mut self, tag: u8, name: &'static str) -> Result<&'a [u8], PduError> {
        let tlv = self.read_tlv()?;
        if tlv.tag != tag {
            return Err(PduError::UnexpectedTag {
                expected: name,
                actual: tlv.tag,
            });
        }
        Ok(tlv.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_forms() {
        let mut out = Vec::new();
        write_length(&mut out, 0x7F).unwrap();
        assert_eq!(out, [0x7F]);

        out.clear();
        write_length(&mut out, 0x80).unwrap();
        assert_eq!(out, [0x81, 0x80]);

        out.clear();
        write_length(&mut out, 0x0123).unwrap();
        assert_eq!(out, [0x82, 0x01, 0x23]);
    }

    #[test]
    fn test_integer_content() {
        assert_eq!(integer_content(0), [0x00]);
        assert_eq!(integer_content(0x7F), [0x7F]);
        assert_eq!(integer_content(0x80), [0x00, 0x80]);
        // 3390, the RDCleanPath version.
        assert_eq!(integer_content(3390), [0x0D, 0x3E]);
        assert_eq!(integer_content(u64::MAX).len(), 9);
    }

    #[test]
    fn test_parse_integer() {
        assert_eq!(parse_integer(&[0x0D, 0x3E]).unwrap(), 3390);
        assert_eq!(parse_integer(&[0x00, 0x80]).unwrap(), 0x80);
        assert_eq!(parse_integer(&integer_content(u64::MAX)).unwrap(), u64::MAX);
        assert_eq!(parse_integer(&[]), Err(PduError::InvalidInteger));
        assert_eq!(parse_integer(&[0xFF]), Err(PduError::InvalidInteger));
        assert_eq!(
            parse_integer(&[0x01, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(PduError::InvalidInteger)
        );
    }

    #[test]
    fn test_context_tags() {
        assert_eq!(context_tag(0), 0xA0);
        assert_eq!(context_tag(9), 0xA9);
        assert_eq!(context_number(0xA7), Some(7));
        assert_eq!(context_number(TAG_SEQUENCE), None);
        // Primitive context-specific tags are not EXPLICIT wrappers.
        assert_eq!(context_number(0x82), None);
    }

    #[test]
    fn test_reader_walks_tlvs() {
        let data = [0x02, 0x01, 0x05, 0x04, 0x82, 0x00, 0x02, 0xAA, 0xBB, 0xFF];
        let mut reader = DerReader::new(&data);

        let first = reader.read_tlv().unwrap();
        assert_eq!(first.tag, TAG_INTEGER);
        assert_eq!(first.content, &[0x05]);

        let second = reader.read_expected(TAG_OCTET_STRING, "OCTET STRING").unwrap();
        assert_eq!(second, &[0xAA, 0xBB]);
        assert_eq!(reader.remaining(), &[0xFF]);
    }

    #[test]
    fn test_reader_rejects_bad_lengths() {
        assert_eq!(
            DerReader::new(&[0x30, 0x80, 0x00, 0x00]).read_tlv(),
            Err(PduError::IndefiniteLength)
        );
        assert_eq!(
            DerReader::new(&[0x30, 0x85, 1, 2, 3, 4, 5]).read_tlv(),
            Err(PduError::LengthOverflow(5))
        );
        assert_eq!(
            DerReader::new(&[0x04, 0x03, 0x01]).read_tlv(),
            Err(PduError::Truncated { needed: 2 })
        );
        assert_eq!(
            DerReader::new(&[0x04, 0x82, 0x01]).read_tlv(),
            Err(PduError::Truncated { needed: 1 })
        );
    }
}
