//!
//! Binary payload primitives: header words, block compression, base64.
//!
//! Every binary payload in a file is either a single header word (the byte
//! count) followed by raw data, or a block header
//! `{num_blocks, block_size, last_block_size, compressed_size[n]}` followed by
//! independently compressed blocks. Header words and payload words share the
//! file's byte order.
//!

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use byteorder::ByteOrder as ByteOrderExt;
use byteorder::{BE, LE};

use crate::model::ByteOrder;

#[derive(Debug)]
pub enum Error {
    UnknownCompressor(String),
    /// The file needs a compressor whose cargo feature is disabled.
    CompressionDisabled(Compressor),
    /// A header or payload read past the end of the available bytes.
    OutOfBounds,
    Base64(base64::DecodeError),
    Decompress(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::UnknownCompressor(tag) => write!(f, "Unknown compressor tag {:?}", tag),
            Error::CompressionDisabled(c) => {
                write!(f, "Support for {:?} compression is not enabled", c)
            }
            Error::OutOfBounds => write!(f, "Binary payload is truncated"),
            Error::Base64(e) => write!(f, "Base64 decode error: {}", e),
            Error::Decompress(msg) => write!(f, "Decompression error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Base64(e) => Some(e),
            _ => None,
        }
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Error {
        Error::Base64(e)
    }
}

/// Compression scheme applied to binary payload blocks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Compressor {
    #[default]
    None,
    ZLib,
    Lz4,
    Lzma,
}

impl Compressor {
    /// Recognize a `compressor` attribute value.
    ///
    /// Tags are matched by suffix so both `vtk` and `svtk` class prefixes are
    /// accepted. An empty attribute means no compression.
    pub fn from_tag(tag: &str) -> Result<Compressor, Error> {
        if tag.is_empty() {
            Ok(Compressor::None)
        } else if tag.ends_with("ZLibDataCompressor") {
            Ok(Compressor::ZLib)
        } else if tag.ends_with("LZ4DataCompressor") {
            Ok(Compressor::Lz4)
        } else if tag.ends_with("LZMADataCompressor") {
            Ok(Compressor::Lzma)
        } else {
            Err(Error::UnknownCompressor(tag.to_string()))
        }
    }
}

/// Width of header words, from the `header_type` attribute.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum HeaderType {
    #[default]
    UInt32,
    UInt64,
}

impl HeaderType {
    pub fn from_tag(tag: &str) -> Option<HeaderType> {
        match tag {
            "UInt32" => Some(HeaderType::UInt32),
            "UInt64" => Some(HeaderType::UInt64),
            _ => None,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            HeaderType::UInt32 => 4,
            HeaderType::UInt64 => 8,
        }
    }
}

/// Read `count` header words starting at the beginning of `bytes`.
pub fn read_header_words(
    bytes: &[u8],
    count: usize,
    header_type: HeaderType,
    byte_order: ByteOrder,
) -> Result<Vec<u64>, Error> {
    let word = header_type.size();
    if bytes.len() < count * word {
        return Err(Error::OutOfBounds);
    }
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let chunk = &bytes[i * word..(i + 1) * word];
        out.push(match (header_type, byte_order) {
            (HeaderType::UInt32, ByteOrder::BigEndian) => BE::read_u32(chunk) as u64,
            (HeaderType::UInt32, ByteOrder::LittleEndian) => LE::read_u32(chunk) as u64,
            (HeaderType::UInt64, ByteOrder::BigEndian) => BE::read_u64(chunk),
            (HeaderType::UInt64, ByteOrder::LittleEndian) => LE::read_u64(chunk),
        });
    }
    Ok(out)
}

/// The block table preceding a compressed payload.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct BlockHeader {
    pub block_size: u64,
    pub last_block_size: u64,
    pub compressed_sizes: Vec<u64>,
}

impl BlockHeader {
    /// Parse a block header from the start of `bytes`.
    ///
    /// Returns the header and the number of bytes it occupied.
    pub fn parse(
        bytes: &[u8],
        header_type: HeaderType,
        byte_order: ByteOrder,
    ) -> Result<(BlockHeader, usize), Error> {
        let lead = read_header_words(bytes, 3, header_type, byte_order)?;
        let num_blocks = lead[0] as usize;
        let word = header_type.size();
        let sizes = read_header_words(&bytes[3 * word..], num_blocks, header_type, byte_order)?;
        Ok((
            BlockHeader {
                block_size: lead[1],
                last_block_size: lead[2],
                compressed_sizes: sizes,
            },
            (3 + num_blocks) * word,
        ))
    }

    pub fn num_blocks(&self) -> usize {
        self.compressed_sizes.len()
    }

    /// Uncompressed size of block `i`; all blocks are full-sized except the
    /// last.
    pub fn block_uncompressed_size(&self, i: usize) -> u64 {
        if i + 1 == self.num_blocks() && self.last_block_size > 0 {
            self.last_block_size
        } else {
            self.block_size
        }
    }

    pub fn uncompressed_size(&self) -> u64 {
        (0..self.num_blocks())
            .map(|i| self.block_uncompressed_size(i))
            .sum()
    }

    pub fn compressed_size(&self) -> u64 {
        self.compressed_sizes.iter().sum()
    }

    /// Byte offset of block `i` within the concatenated compressed payload.
    pub fn block_compressed_offset(&self, i: usize) -> u64 {
        self.compressed_sizes[..i].iter().sum()
    }
}

/// Decompress one block to exactly `uncompressed_size` bytes.
pub fn decompress_block(
    block: &[u8],
    uncompressed_size: usize,
    compressor: Compressor,
) -> Result<Vec<u8>, Error> {
    match compressor {
        Compressor::None => {
            if block.len() < uncompressed_size {
                return Err(Error::OutOfBounds);
            }
            Ok(block[..uncompressed_size].to_vec())
        }
        Compressor::ZLib => {
            #[cfg(feature = "flate2")]
            {
                use std::io::Read;
                let mut out = Vec::with_capacity(uncompressed_size);
                flate2::read::ZlibDecoder::new(block)
                    .read_to_end(&mut out)
                    .map_err(|e| Error::Decompress(e.to_string()))?;
                if out.len() != uncompressed_size {
                    return Err(Error::Decompress(format!(
                        "zlib block inflated to {} bytes, expected {}",
                        out.len(),
                        uncompressed_size
                    )));
                }
                Ok(out)
            }
            #[cfg(not(feature = "flate2"))]
            Err(Error::CompressionDisabled(compressor))
        }
        Compressor::Lz4 => {
            #[cfg(feature = "lz4")]
            {
                lz4::block::decompress(block, uncompressed_size)
                    .map_err(|e| Error::Decompress(e.to_string()))
            }
            #[cfg(not(feature = "lz4"))]
            Err(Error::CompressionDisabled(compressor))
        }
        Compressor::Lzma => {
            #[cfg(feature = "xz2")]
            {
                use std::io::Read;
                let mut out = Vec::with_capacity(uncompressed_size);
                xz2::read::XzDecoder::new(block)
                    .read_to_end(&mut out)
                    .map_err(|e| Error::Decompress(e.to_string()))?;
                if out.len() != uncompressed_size {
                    return Err(Error::Decompress(format!(
                        "lzma block inflated to {} bytes, expected {}",
                        out.len(),
                        uncompressed_size
                    )));
                }
                Ok(out)
            }
            #[cfg(not(feature = "xz2"))]
            Err(Error::CompressionDisabled(compressor))
        }
    }
}

/// Extract `[start, start + len)` of the uncompressed payload, decompressing
/// only the blocks overlapping that range.
pub fn decode_range(
    compressed: &[u8],
    header: &BlockHeader,
    compressor: Compressor,
    start: u64,
    len: u64,
) -> Result<Vec<u8>, Error> {
    if len == 0 {
        return Ok(Vec::new());
    }
    if header.block_size == 0 || start + len > header.uncompressed_size() {
        return Err(Error::OutOfBounds);
    }
    let first = (start / header.block_size) as usize;
    let last = ((start + len - 1) / header.block_size) as usize;

    let mut joined = Vec::with_capacity(((last - first + 1) as u64 * header.block_size) as usize);
    for i in first..=last {
        let off = header.block_compressed_offset(i) as usize;
        let block = block_slice(compressed, off, header.compressed_sizes[i] as usize)?;
        let out = decompress_block(block, header.block_uncompressed_size(i) as usize, compressor)?;
        joined.extend_from_slice(&out);
    }

    let local = (start - first as u64 * header.block_size) as usize;
    if local + len as usize > joined.len() {
        return Err(Error::OutOfBounds);
    }
    Ok(joined[local..local + len as usize].to_vec())
}

fn block_slice(bytes: &[u8], offset: usize, len: usize) -> Result<&[u8], Error> {
    bytes.get(offset..offset + len).ok_or(Error::OutOfBounds)
}

/// Number of base64 characters occupied by `nbytes` of encoded binary data.
pub fn base64_len(nbytes: usize) -> usize {
    4 * ((nbytes + 2) / 3)
}

/// Decode the first `nbytes` of a base64 stream, ignoring embedded ascii
/// whitespace.
///
/// Decodes only the character prefix covering the requested bytes, so a
/// stream followed by unrelated text (or further streams) is fine.
pub fn decode_base64_prefix(text: &[u8], nbytes: usize) -> Result<Vec<u8>, Error> {
    let chars: Vec<u8> = text
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .take(base64_len(nbytes))
        .collect();
    let mut out = BASE64.decode(&chars)?;
    if out.len() < nbytes {
        return Err(Error::OutOfBounds);
    }
    out.truncate(nbytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn compressor_tags_by_suffix() {
        assert_eq!(Compressor::from_tag("").unwrap(), Compressor::None);
        assert_eq!(
            Compressor::from_tag("vtkZLibDataCompressor").unwrap(),
            Compressor::ZLib
        );
        assert_eq!(
            Compressor::from_tag("svtkZLibDataCompressor").unwrap(),
            Compressor::ZLib
        );
        assert_eq!(
            Compressor::from_tag("svtkLZ4DataCompressor").unwrap(),
            Compressor::Lz4
        );
        assert_eq!(
            Compressor::from_tag("svtkLZMADataCompressor").unwrap(),
            Compressor::Lzma
        );
        assert!(Compressor::from_tag("svtkFancyCompressor").is_err());
    }

    #[test]
    fn header_words_both_widths_and_orders() {
        let le32 = [0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];
        assert_eq!(
            read_header_words(&le32, 2, HeaderType::UInt32, ByteOrder::LittleEndian).unwrap(),
            vec![1, 2]
        );
        let be32 = [0x00, 0x00, 0x00, 0x01];
        assert_eq!(
            read_header_words(&be32, 1, HeaderType::UInt32, ByteOrder::BigEndian).unwrap(),
            vec![1]
        );
        let be64 = [0, 0, 0, 0, 0, 0, 0, 5];
        assert_eq!(
            read_header_words(&be64, 1, HeaderType::UInt64, ByteOrder::BigEndian).unwrap(),
            vec![5]
        );
        assert!(read_header_words(&be64, 2, HeaderType::UInt64, ByteOrder::BigEndian).is_err());
    }

    #[test]
    fn block_header_parse() {
        // num_blocks=2, block_size=8, last_block_size=3, sizes [5, 4].
        let mut bytes = Vec::new();
        for w in [2u32, 8, 3, 5, 4] {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        let (header, consumed) =
            BlockHeader::parse(&bytes, HeaderType::UInt32, ByteOrder::LittleEndian).unwrap();
        assert_eq!(consumed, 20);
        assert_eq!(header.num_blocks(), 2);
        assert_eq!(header.uncompressed_size(), 11);
        assert_eq!(header.block_uncompressed_size(0), 8);
        assert_eq!(header.block_uncompressed_size(1), 3);
        assert_eq!(header.block_compressed_offset(1), 5);
    }

    #[cfg(feature = "flate2")]
    fn zlib_compress(data: &[u8]) -> Vec<u8> {
        use std::io::Write;
        let mut enc =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[cfg(feature = "flate2")]
    #[test]
    fn zlib_partial_range() {
        let payload: Vec<u8> = (0u8..16).collect();
        let blocks: Vec<Vec<u8>> = payload.chunks(8).map(zlib_compress).collect();
        let header = BlockHeader {
            block_size: 8,
            last_block_size: 8,
            compressed_sizes: blocks.iter().map(|b| b.len() as u64).collect(),
        };
        let compressed: Vec<u8> = blocks.concat();

        // A range spanning the block boundary.
        let got = decode_range(&compressed, &header, Compressor::ZLib, 6, 4).unwrap();
        assert_eq!(got, vec![6, 7, 8, 9]);
        // Full payload.
        let got = decode_range(&compressed, &header, Compressor::ZLib, 0, 16).unwrap();
        assert_eq!(got, payload);
        // Past the end.
        assert!(decode_range(&compressed, &header, Compressor::ZLib, 10, 8).is_err());
    }

    // An empty array compresses to a header with no blocks at all.
    #[test]
    fn zero_block_payload() {
        let header = BlockHeader::default();
        assert_eq!(header.num_blocks(), 0);
        assert_eq!(header.uncompressed_size(), 0);
        let got = decode_range(&[], &header, Compressor::ZLib, 0, 0).unwrap();
        assert!(got.is_empty());
        assert!(decode_range(&[], &header, Compressor::ZLib, 0, 1).is_err());
    }

    #[cfg(feature = "flate2")]
    #[test]
    fn zlib_partial_last_block() {
        let payload: Vec<u8> = (0u8..13).collect();
        let blocks: Vec<Vec<u8>> = payload.chunks(8).map(zlib_compress).collect();
        let header = BlockHeader {
            block_size: 8,
            last_block_size: 5,
            compressed_sizes: blocks.iter().map(|b| b.len() as u64).collect(),
        };
        let compressed: Vec<u8> = blocks.concat();

        // A range reaching into the short last block.
        let got = decode_range(&compressed, &header, Compressor::ZLib, 6, 5).unwrap();
        assert_eq!(got, vec![6, 7, 8, 9, 10]);
        // Full payload ends where the short block does.
        let got = decode_range(&compressed, &header, Compressor::ZLib, 0, 13).unwrap();
        assert_eq!(got, payload);
        // Asking for a full-sized last block overruns.
        assert!(decode_range(&compressed, &header, Compressor::ZLib, 8, 6).is_err());
    }

    #[cfg(feature = "lz4")]
    #[test]
    fn lz4_block_roundtrip() {
        let payload = b"abcdabcdabcdabcd";
        let block = lz4::block::compress(payload);
        let out = decompress_block(&block, payload.len(), Compressor::Lz4).unwrap();
        assert_eq!(out, payload);
    }

    #[cfg(feature = "xz2")]
    #[test]
    fn lzma_block_roundtrip() {
        use std::io::Read;
        let payload = b"hello hello hello";
        let mut block = Vec::new();
        xz2::read::XzEncoder::new(&payload[..], 6)
            .read_to_end(&mut block)
            .unwrap();
        let out = decompress_block(&block, payload.len(), Compressor::Lzma).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn base64_prefix_skips_whitespace_and_trailing_text() {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        let encoded = STANDARD.encode([1u8, 2, 3, 4, 5]);
        let text = format!("  {}\n  trailing", encoded);
        let got = decode_base64_prefix(text.as_bytes(), 5).unwrap();
        assert_eq!(got, vec![1, 2, 3, 4, 5]);
        // A shorter prefix only consumes the chars it needs.
        let got = decode_base64_prefix(text.as_bytes(), 3).unwrap();
        assert_eq!(got, vec![1, 2, 3]);
    }
}
