//!
//! Decoding of `DataArray` element contents.
//!
//! Arrays come in three storage formats: ascii text, inline base64 ("binary")
//! and references into the appended section. All three decode through
//! [`read_array_values`], which writes a word range into a caller-sized
//! buffer at a destination offset, so piece readers can place multiple
//! pieces' values into one contiguous array.
//!

use std::fmt;

use log::warn;

use crate::codec::{self, BlockHeader, Compressor, HeaderType};
use crate::model::{ByteOrder, DataArray, IOBuffer, ScalarType};
use crate::xml::{AppendedData, Element, Encoding};

#[derive(Debug)]
pub enum Error {
    Codec(codec::Error),
    Model(crate::model::Error),
    UnknownScalarType(String),
    UnknownFormat(String),
    /// An appended-format array without an `offset` attribute.
    MissingOffset(String),
    /// An appended-format array in a file with no appended section.
    MissingAppendedSection(String),
    /// The requested destination range does not fit the output buffer.
    DestinationOverflow(String),
    /// Output buffer scalar type differs from the decoded data.
    TypeMismatch(String),
    /// Fewer ascii values present than the requested word count.
    ShortRead {
        name: String,
        expected: usize,
        found: usize,
    },
    /// Bit-array ranges must start on a byte boundary.
    MisalignedBitRange(String),
    InvalidAscii {
        name: String,
        token: String,
    },
    Xml(crate::xml::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Codec(e) => write!(f, "Payload decode error: {}", e),
            Error::Model(e) => write!(f, "Model error: {}", e),
            Error::UnknownScalarType(t) => write!(f, "Unknown data array type {:?}", t),
            Error::UnknownFormat(t) => write!(f, "Unknown data array format {:?}", t),
            Error::MissingOffset(name) => {
                write!(f, "Appended array {:?} is missing an offset attribute", name)
            }
            Error::MissingAppendedSection(name) => write!(
                f,
                "Array {:?} references the appended section but the file has none",
                name
            ),
            Error::DestinationOverflow(name) => {
                write!(f, "Array {:?} does not fit its destination buffer", name)
            }
            Error::TypeMismatch(name) => {
                write!(f, "Array {:?} decoded to an unexpected scalar type", name)
            }
            Error::ShortRead {
                name,
                expected,
                found,
            } => write!(
                f,
                "Array {:?} holds {} values where {} were required",
                name, found, expected
            ),
            Error::MisalignedBitRange(name) => {
                write!(f, "Bit array {:?} range is not byte aligned", name)
            }
            Error::InvalidAscii { name, token } => {
                write!(f, "Array {:?} has a malformed ascii value {:?}", name, token)
            }
            Error::Xml(e) => write!(f, "XML error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Codec(e) => Some(e),
            Error::Model(e) => Some(e),
            Error::Xml(e) => Some(e),
            _ => None,
        }
    }
}

impl From<codec::Error> for Error {
    fn from(e: codec::Error) -> Error {
        Error::Codec(e)
    }
}

impl From<crate::model::Error> for Error {
    fn from(e: crate::model::Error) -> Error {
        Error::Model(e)
    }
}

impl From<crate::xml::Error> for Error {
    fn from(e: crate::xml::Error) -> Error {
        Error::Xml(e)
    }
}

/// Storage format of one data array.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Ascii,
    Binary,
    Appended,
}

/// Attributes of a `DataArray` (or `Array`) element, parsed once up front.
#[derive(Clone, Debug, PartialEq)]
pub struct ArrayDescriptor {
    pub name: String,
    pub scalar_type: ScalarType,
    pub num_comp: u32,
    pub format: Format,
    pub offset: Option<u64>,
    /// Time steps this array participates in, from the `TimeStep` attribute.
    pub time_steps: Vec<i32>,
    pub num_tuples: Option<u64>,
    /// The `IdType` marker requesting the native index width.
    pub id_type: bool,
}

impl ArrayDescriptor {
    pub fn parse(el: &Element) -> Result<ArrayDescriptor, Error> {
        let type_tag = el.attr("type").unwrap_or("");
        let scalar_type = ScalarType::from_xml_tag(type_tag)
            .ok_or_else(|| Error::UnknownScalarType(type_tag.to_string()))?;
        let format = match el.attr("format").unwrap_or("ascii") {
            "ascii" => Format::Ascii,
            "binary" => Format::Binary,
            "appended" => Format::Appended,
            other => return Err(Error::UnknownFormat(other.to_string())),
        };
        Ok(ArrayDescriptor {
            name: el.attr("Name").unwrap_or("").to_string(),
            scalar_type,
            num_comp: el.scalar_attr("NumberOfComponents")?.unwrap_or(1),
            format,
            offset: el.scalar_attr("offset")?,
            time_steps: el.vector_attr("TimeStep")?.unwrap_or_default(),
            num_tuples: el.scalar_attr("NumberOfTuples")?,
            id_type: false,
        }
        .with_id_type(el)?)
    }

    fn with_id_type(mut self, el: &Element) -> Result<ArrayDescriptor, Error> {
        self.id_type = el.scalar_attr::<u32>("IdType")? == Some(1);
        Ok(self)
    }

    /// The scalar type arrays of this descriptor are stored with, after the
    /// `IdType` override.
    ///
    /// Arrays marked `IdType` prefer the native index type when the declared
    /// word width matches; a mismatched width is reported and ignored.
    pub fn effective_scalar_type(&self) -> ScalarType {
        if !self.id_type {
            return self.scalar_type;
        }
        match self.scalar_type {
            ScalarType::I64 | ScalarType::U64 => ScalarType::I64,
            other => {
                warn!(
                    "array {:?}: IdType requested for incompatible type {}; ignoring",
                    self.name, other
                );
                other
            }
        }
    }
}

/// Everything needed to decode binary payloads of one file.
#[derive(Clone, Debug)]
pub struct DecodeContext<'a> {
    pub byte_order: ByteOrder,
    pub header_type: HeaderType,
    pub compressor: Compressor,
    pub appended: Option<&'a AppendedData>,
}

enum Stream<'a> {
    Raw(&'a [u8]),
    /// Base64 text, possibly with embedded whitespace.
    Base64(&'a [u8]),
}

/// Position a stream at an array's `offset` within the appended section.
///
/// Raw offsets address bytes; base64 offsets address text characters with
/// whitespace excluded.
fn appended_stream(appended: &AppendedData, offset: usize) -> Result<Stream, Error> {
    match appended.encoding {
        Encoding::Raw => {
            if offset > appended.data.len() {
                return Err(Error::Codec(codec::Error::OutOfBounds));
            }
            Ok(Stream::Raw(&appended.data[offset..]))
        }
        Encoding::Base64 => Ok(Stream::Base64(skip_chars(&appended.data, offset))),
    }
}

/// Decode `num_values` words starting at source word `src_start` into `out`
/// at value offset `dst_start`.
///
/// `Bit` arrays count words in bits but transfer whole bytes, so both offsets
/// must be multiples of 8. `String` arrays ignore `src_start` and store
/// `num_values` NUL terminated runs from the beginning of the payload.
pub fn read_array_values(
    el: &Element,
    desc: &ArrayDescriptor,
    ctx: &DecodeContext,
    out: &mut IOBuffer,
    dst_start: usize,
    num_values: usize,
    src_start: usize,
) -> Result<(), Error> {
    if num_values == 0 {
        return Ok(());
    }
    match desc.format {
        Format::Ascii => read_ascii_values(el, desc, out, dst_start, num_values, src_start),
        Format::Binary => {
            let stream = Stream::Base64(el.text.as_bytes());
            read_stream_values(stream, desc, ctx, out, dst_start, num_values, src_start)
        }
        Format::Appended => {
            let appended = ctx
                .appended
                .ok_or_else(|| Error::MissingAppendedSection(desc.name.clone()))?;
            let offset = desc
                .offset
                .ok_or_else(|| Error::MissingOffset(desc.name.clone()))? as usize;
            let stream = appended_stream(appended, offset)?;
            read_stream_values(stream, desc, ctx, out, dst_start, num_values, src_start)
        }
    }
}

/// Read a whole array: descriptor parse, allocation and decode in one step.
///
/// Used for geometry arrays whose size is known from the payload itself.
pub fn read_data_array(el: &Element, ctx: &DecodeContext) -> Result<DataArray, Error> {
    let desc = ArrayDescriptor::parse(el)?;
    let scalar_type = desc.effective_scalar_type();
    let data = match desc.format {
        Format::Ascii => {
            // Numeric and bit arrays hold one value per token; string arrays
            // hold byte-valued tokens forming NUL terminated runs.
            let num = match scalar_type {
                ScalarType::Str => match desc.num_tuples {
                    Some(n) => n as usize,
                    None => el
                        .text
                        .split_whitespace()
                        .filter_map(|t| t.parse::<u8>().ok())
                        .collect::<Vec<u8>>()
                        .split(|&b| b == 0)
                        .filter(|s| !s.is_empty())
                        .count(),
                },
                _ => el.text.split_whitespace().count(),
            };
            let mut out = IOBuffer::allocate(scalar_type, num);
            read_ascii_values(el, &desc, &mut out, 0, num, 0)?;
            out
        }
        Format::Binary | Format::Appended => {
            let bytes = match desc.format {
                Format::Binary => {
                    read_payload(Stream::Base64(el.text.as_bytes()), ctx, 0, None)?
                }
                _ => {
                    let appended = ctx
                        .appended
                        .ok_or_else(|| Error::MissingAppendedSection(desc.name.clone()))?;
                    let offset = desc
                        .offset
                        .ok_or_else(|| Error::MissingOffset(desc.name.clone()))?
                        as usize;
                    read_payload(appended_stream(appended, offset)?, ctx, 0, None)?
                }
            };
            IOBuffer::from_bytes(bytes, scalar_type, ctx.byte_order)?
        }
    };
    Ok(DataArray {
        name: desc.name,
        num_comp: desc.num_comp,
        data,
    })
}

fn read_stream_values(
    stream: Stream,
    desc: &ArrayDescriptor,
    ctx: &DecodeContext,
    out: &mut IOBuffer,
    dst_start: usize,
    num_values: usize,
    src_start: usize,
) -> Result<(), Error> {
    let scalar_type = desc.effective_scalar_type();
    match scalar_type {
        ScalarType::Bit => {
            if dst_start % 8 != 0 || src_start % 8 != 0 {
                return Err(Error::MisalignedBitRange(desc.name.clone()));
            }
            let nbytes = (num_values + 7) / 8;
            let bytes = read_payload(stream, ctx, src_start / 8, Some(nbytes))?;
            let dst_byte = dst_start / 8;
            match out {
                IOBuffer::Bit(o) => {
                    if dst_byte + bytes.len() > o.len() {
                        return Err(Error::DestinationOverflow(desc.name.clone()));
                    }
                    o[dst_byte..dst_byte + bytes.len()].copy_from_slice(&bytes);
                    Ok(())
                }
                _ => Err(Error::TypeMismatch(desc.name.clone())),
            }
        }
        ScalarType::Str => {
            // String payloads have no fixed word size; read everything and
            // split on NUL terminators.
            let bytes = read_payload(stream, ctx, 0, None)?;
            let strings: Vec<String> = bytes
                .split(|&b| b == 0)
                .filter(|s| !s.is_empty())
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .collect();
            store_strings(out, desc, dst_start, num_values, strings)
        }
        st => {
            let word = st.size().unwrap();
            let bytes = read_payload(stream, ctx, src_start * word, Some(num_values * word))?;
            let decoded = IOBuffer::from_bytes(bytes, st, ctx.byte_order)?;
            splice(out, decoded, desc, dst_start)
        }
    }
}

fn store_strings(
    out: &mut IOBuffer,
    desc: &ArrayDescriptor,
    dst_start: usize,
    num_values: usize,
    strings: Vec<String>,
) -> Result<(), Error> {
    match out {
        IOBuffer::Str(o) => {
            if strings.len() < num_values {
                return Err(Error::ShortRead {
                    name: desc.name.clone(),
                    expected: num_values,
                    found: strings.len(),
                });
            }
            if dst_start + num_values > o.len() {
                return Err(Error::DestinationOverflow(desc.name.clone()));
            }
            for (slot, s) in o[dst_start..dst_start + num_values].iter_mut().zip(strings) {
                *slot = s;
            }
            Ok(())
        }
        _ => Err(Error::TypeMismatch(desc.name.clone())),
    }
}

macro_rules! impl_splice {
    ($out:expr, $decoded:expr, $desc:expr, $dst:expr; $($v:ident),*) => {
        match ($out, $decoded) {
            $(
                (IOBuffer::$v(o), IOBuffer::$v(t)) => {
                    if $dst + t.len() > o.len() {
                        return Err(Error::DestinationOverflow($desc.name.clone()));
                    }
                    o[$dst..$dst + t.len()].copy_from_slice(&t);
                    Ok(())
                }
            )*
            _ => Err(Error::TypeMismatch($desc.name.clone())),
        }
    };
}

fn splice(
    out: &mut IOBuffer,
    decoded: IOBuffer,
    desc: &ArrayDescriptor,
    dst_start: usize,
) -> Result<(), Error> {
    impl_splice!(out, decoded, desc, dst_start; U8, I8, U16, I16, U32, I32, U64, I64, F32, F64)
}

macro_rules! impl_parse_ascii {
    ($out:expr, $desc:expr, $tokens:expr, $dst:expr, $num:expr; $($v:ident),*) => {
        match $out {
            $(
                IOBuffer::$v(o) => {
                    let mut found = 0;
                    for (i, tok) in $tokens.enumerate() {
                        let val = tok.parse().map_err(|_| Error::InvalidAscii {
                            name: $desc.name.clone(),
                            token: tok.to_string(),
                        })?;
                        let slot = o
                            .get_mut($dst + i)
                            .ok_or_else(|| Error::DestinationOverflow($desc.name.clone()))?;
                        *slot = val;
                        found = i + 1;
                    }
                    if found < $num {
                        return Err(Error::ShortRead {
                            name: $desc.name.clone(),
                            expected: $num,
                            found,
                        });
                    }
                    Ok(())
                }
            )*
            _ => Err(Error::TypeMismatch($desc.name.clone())),
        }
    };
}

fn read_ascii_values(
    el: &Element,
    desc: &ArrayDescriptor,
    out: &mut IOBuffer,
    dst_start: usize,
    num_values: usize,
    src_start: usize,
) -> Result<(), Error> {
    match desc.effective_scalar_type() {
        ScalarType::Bit => {
            // Ascii bit values are whole 0/1 words, one per bit.
            let tokens = el.text.split_whitespace().skip(src_start).take(num_values);
            match out {
                IOBuffer::Bit(o) => {
                    let mut found = 0;
                    for (i, tok) in tokens.enumerate() {
                        let val: u8 = tok.parse().map_err(|_| Error::InvalidAscii {
                            name: desc.name.clone(),
                            token: tok.to_string(),
                        })?;
                        let bit = dst_start + i;
                        if bit / 8 >= o.len() {
                            return Err(Error::DestinationOverflow(desc.name.clone()));
                        }
                        let mask = 1u8 << (7 - (bit % 8));
                        if val != 0 {
                            o[bit / 8] |= mask;
                        } else {
                            o[bit / 8] &= !mask;
                        }
                        found = i + 1;
                    }
                    if found < num_values {
                        return Err(Error::ShortRead {
                            name: desc.name.clone(),
                            expected: num_values,
                            found,
                        });
                    }
                    Ok(())
                }
                _ => Err(Error::TypeMismatch(desc.name.clone())),
            }
        }
        ScalarType::Str => {
            // Ascii string data is a whitespace separated list of byte
            // values forming NUL terminated runs.
            let mut bytes = Vec::new();
            for tok in el.text.split_whitespace() {
                let b: u8 = tok.parse().map_err(|_| Error::InvalidAscii {
                    name: desc.name.clone(),
                    token: tok.to_string(),
                })?;
                bytes.push(b);
            }
            let strings: Vec<String> = bytes
                .split(|&b| b == 0)
                .filter(|s| !s.is_empty())
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .collect();
            store_strings(out, desc, dst_start, num_values, strings)
        }
        _ => {
            let tokens = el.text.split_whitespace().skip(src_start).take(num_values);
            impl_parse_ascii!(out, desc, tokens, dst_start, num_values; U8, I8, U16, I16, U32, I32, U64, I64, F32, F64)
        }
    }
}

/// Extract an uncompressed byte range of one payload stream.
///
/// `byte_len = None` reads everything past `byte_start`.
fn read_payload(
    stream: Stream,
    ctx: &DecodeContext,
    byte_start: usize,
    byte_len: Option<usize>,
) -> Result<Vec<u8>, Error> {
    match (stream, ctx.compressor) {
        (Stream::Raw(bytes), Compressor::None) => {
            let words = codec::read_header_words(bytes, 1, ctx.header_type, ctx.byte_order)?;
            let nbytes = words[0] as usize;
            let data = bytes
                .get(ctx.header_type.size()..)
                .ok_or(codec::Error::OutOfBounds)?;
            slice_payload(data, nbytes, byte_start, byte_len)
        }
        (Stream::Raw(bytes), compressor) => {
            let (header, consumed) =
                BlockHeader::parse(bytes, ctx.header_type, ctx.byte_order)?;
            let compressed = &bytes[consumed..];
            let total = header.uncompressed_size() as usize;
            let (start, len) = clamp_range(total, byte_start, byte_len)?;
            Ok(codec::decode_range(
                compressed,
                &header,
                compressor,
                start as u64,
                len as u64,
            )?)
        }
        (Stream::Base64(text), Compressor::None) => {
            // One base64 stream holding the count header followed by data.
            let hdr = ctx.header_type.size();
            let head = codec::decode_base64_prefix(text, hdr)?;
            let words = codec::read_header_words(&head, 1, ctx.header_type, ctx.byte_order)?;
            let nbytes = words[0] as usize;
            let (start, len) = clamp_range(nbytes, byte_start, byte_len)?;
            let full = codec::decode_base64_prefix(text, hdr + start + len)?;
            Ok(full[hdr + start..hdr + start + len].to_vec())
        }
        (Stream::Base64(text), compressor) => {
            // The block header forms its own base64 stream; the compressed
            // payload stream begins right after its character run.
            let word = ctx.header_type.size();
            let lead = codec::decode_base64_prefix(text, 3 * word)?;
            let lead_words =
                codec::read_header_words(&lead, 3, ctx.header_type, ctx.byte_order)?;
            let num_blocks = lead_words[0] as usize;
            let header_bytes = (3 + num_blocks) * word;
            let head = codec::decode_base64_prefix(text, header_bytes)?;
            let (header, _) = BlockHeader::parse(&head, ctx.header_type, ctx.byte_order)?;

            let header_chars = codec::base64_len(header_bytes);
            let payload_text = skip_chars(text, header_chars);

            let total = header.uncompressed_size() as usize;
            let (start, len) = clamp_range(total, byte_start, byte_len)?;
            if len == 0 {
                return Ok(Vec::new());
            }
            // Decompress only up to the last block overlapping the range.
            let block_size = header.block_size.max(1) as usize;
            let last = (start + len - 1) / block_size;
            let comp_end = (header.block_compressed_offset(last)
                + header.compressed_sizes.get(last).copied().unwrap_or(0))
                as usize;
            let compressed = codec::decode_base64_prefix(payload_text, comp_end)?;
            Ok(codec::decode_range(
                &compressed,
                &header,
                compressor,
                start as u64,
                len as u64,
            )?)
        }
    }
}

fn slice_payload(
    data: &[u8],
    nbytes: usize,
    byte_start: usize,
    byte_len: Option<usize>,
) -> Result<Vec<u8>, Error> {
    let (start, len) = clamp_range(nbytes, byte_start, byte_len)?;
    data.get(start..start + len)
        .map(|s| s.to_vec())
        .ok_or(Error::Codec(codec::Error::OutOfBounds))
}

fn clamp_range(
    total: usize,
    byte_start: usize,
    byte_len: Option<usize>,
) -> Result<(usize, usize), Error> {
    if byte_start > total {
        return Err(Error::Codec(codec::Error::OutOfBounds));
    }
    let len = byte_len.unwrap_or(total - byte_start);
    if byte_start + len > total {
        return Err(Error::Codec(codec::Error::OutOfBounds));
    }
    Ok((byte_start, len))
}

/// Skip the first `n` non-whitespace characters of a base64 text run.
fn skip_chars(text: &[u8], n: usize) -> &[u8] {
    let mut seen = 0;
    for (i, b) in text.iter().enumerate() {
        if seen == n {
            return &text[i..];
        }
        if !b.is_ascii_whitespace() {
            seen += 1;
        }
    }
    &text[text.len()..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ByteOrder;
    use crate::xml::Encoding;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use pretty_assertions::assert_eq;

    fn data_array_element(attrs: &[(&str, &str)], text: &str) -> Element {
        let mut el = Element::new("DataArray");
        el.attributes = attrs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        el.text = text.to_string();
        el
    }

    fn plain_ctx() -> DecodeContext<'static> {
        DecodeContext {
            byte_order: ByteOrder::LittleEndian,
            header_type: HeaderType::UInt32,
            compressor: Compressor::None,
            appended: None,
        }
    }

    #[test]
    fn ascii_values_at_offset() {
        let el = data_array_element(
            &[("type", "Float64"), ("Name", "w"), ("format", "ascii")],
            "0.5 1.5 2.5 3.5",
        );
        let desc = ArrayDescriptor::parse(&el).unwrap();
        let mut out = IOBuffer::allocate(ScalarType::F64, 6);
        // Source words 1..3 land at destination offset 4.
        read_array_values(&el, &desc, &plain_ctx(), &mut out, 4, 2, 1).unwrap();
        assert_eq!(out, IOBuffer::F64(vec![0.0, 0.0, 0.0, 0.0, 1.5, 2.5]));
    }

    #[test]
    fn ascii_bad_token_is_an_error() {
        let el = data_array_element(&[("type", "Int32"), ("format", "ascii")], "1 nope 3");
        let desc = ArrayDescriptor::parse(&el).unwrap();
        let mut out = IOBuffer::allocate(ScalarType::I32, 3);
        assert!(matches!(
            read_array_values(&el, &desc, &plain_ctx(), &mut out, 0, 3, 0),
            Err(Error::InvalidAscii { .. })
        ));
    }

    #[test]
    fn inline_base64_uncompressed_single_stream() {
        // Header word (byte count) and payload share one base64 stream.
        let payload: Vec<u8> = vec![1, 0, 2, 0, 3, 0]; // u16 LE [1, 2, 3]
        let mut raw = (payload.len() as u32).to_le_bytes().to_vec();
        raw.extend_from_slice(&payload);
        let el = data_array_element(
            &[("type", "UInt16"), ("Name", "v"), ("format", "binary")],
            &STANDARD.encode(&raw),
        );
        let desc = ArrayDescriptor::parse(&el).unwrap();
        let mut out = IOBuffer::allocate(ScalarType::U16, 3);
        read_array_values(&el, &desc, &plain_ctx(), &mut out, 0, 3, 0).unwrap();
        assert_eq!(out, IOBuffer::U16(vec![1, 2, 3]));
    }

    #[test]
    fn appended_raw_at_offset() {
        // Two arrays in one appended section addressed by byte offsets.
        let mut section = Vec::new();
        let a: Vec<u8> = vec![10, 20]; // u8 x2
        section.extend_from_slice(&(a.len() as u32).to_le_bytes());
        section.extend_from_slice(&a);
        let second_offset = section.len() as u64;
        let b = [1.0f32, 2.0].iter().flat_map(|f| f.to_le_bytes()).collect::<Vec<u8>>();
        section.extend_from_slice(&(b.len() as u32).to_le_bytes());
        section.extend_from_slice(&b);

        let appended = AppendedData {
            encoding: Encoding::Raw,
            data: section,
        };
        let ctx = DecodeContext {
            appended: Some(&appended),
            ..plain_ctx()
        };

        let el = data_array_element(
            &[("type", "Float32"), ("Name", "b"), ("format", "appended"),
              ("offset", &second_offset.to_string())],
            "",
        );
        let desc = ArrayDescriptor::parse(&el).unwrap();
        let mut out = IOBuffer::allocate(ScalarType::F32, 2);
        read_array_values(&el, &desc, &ctx, &mut out, 0, 2, 0).unwrap();
        assert_eq!(out, IOBuffer::F32(vec![1.0, 2.0]));
    }

    #[test]
    fn ascii_short_token_count_is_an_error() {
        let el = data_array_element(
            &[("type", "Float64"), ("Name", "w"), ("format", "ascii")],
            "1.0 2.0",
        );
        let desc = ArrayDescriptor::parse(&el).unwrap();
        let mut out = IOBuffer::allocate(ScalarType::F64, 4);
        assert!(matches!(
            read_array_values(&el, &desc, &plain_ctx(), &mut out, 0, 4, 0),
            Err(Error::ShortRead {
                expected: 4,
                found: 2,
                ..
            })
        ));
    }

    #[test]
    fn appended_base64_offset_counts_characters() {
        // Two base64 streams separated by a newline; the second array's
        // offset counts the first stream's characters, not body bytes.
        let mut raw_a = 2u32.to_le_bytes().to_vec();
        raw_a.extend_from_slice(&[7u8, 8]);
        let mut raw_b = 3u32.to_le_bytes().to_vec();
        raw_b.extend_from_slice(&[9u8, 10, 11]);
        let enc_a = STANDARD.encode(&raw_a);
        let enc_b = STANDARD.encode(&raw_b);
        let body = format!("{}\n{}", enc_a, enc_b);

        let appended = AppendedData {
            encoding: Encoding::Base64,
            data: body.into_bytes(),
        };
        let ctx = DecodeContext {
            appended: Some(&appended),
            ..plain_ctx()
        };

        let el = data_array_element(
            &[("type", "UInt8"), ("Name", "b"), ("format", "appended"),
              ("offset", &enc_a.len().to_string())],
            "",
        );
        let desc = ArrayDescriptor::parse(&el).unwrap();
        let mut out = IOBuffer::allocate(ScalarType::U8, 3);
        read_array_values(&el, &desc, &ctx, &mut out, 0, 3, 0).unwrap();
        assert_eq!(out, IOBuffer::U8(vec![9, 10, 11]));
    }

    #[cfg(feature = "flate2")]
    #[test]
    fn inline_base64_compressed_two_streams() {
        use std::io::Write;
        let payload: Vec<u8> = (0u8..12).collect();
        let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(&payload).unwrap();
        let block = enc.finish().unwrap();

        let mut header = Vec::new();
        for w in [1u32, payload.len() as u32, payload.len() as u32, block.len() as u32] {
            header.extend_from_slice(&w.to_le_bytes());
        }
        // Header and payload are separate base64 streams.
        let text = format!("{}{}", STANDARD.encode(&header), STANDARD.encode(&block));

        let el = data_array_element(
            &[("type", "UInt8"), ("Name", "z"), ("format", "binary")],
            &text,
        );
        let desc = ArrayDescriptor::parse(&el).unwrap();
        let ctx = DecodeContext {
            compressor: Compressor::ZLib,
            ..plain_ctx()
        };
        let mut out = IOBuffer::allocate(ScalarType::U8, 12);
        read_array_values(&el, &desc, &ctx, &mut out, 0, 12, 0).unwrap();
        assert_eq!(out, IOBuffer::U8(payload));
    }

    #[test]
    fn string_array_ascii_runs() {
        // "ab\0c\0" as whitespace separated byte values.
        let el = data_array_element(
            &[("type", "String"), ("Name", "names"), ("format", "ascii"),
              ("NumberOfTuples", "2")],
            "97 98 0 99 0",
        );
        let desc = ArrayDescriptor::parse(&el).unwrap();
        assert_eq!(desc.num_tuples, Some(2));
        let mut out = IOBuffer::allocate(ScalarType::Str, 2);
        read_array_values(&el, &desc, &plain_ctx(), &mut out, 0, 2, 0).unwrap();
        assert_eq!(
            out,
            IOBuffer::Str(vec!["ab".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn bit_array_ascii() {
        let el = data_array_element(&[("type", "Bit"), ("format", "ascii")], "1 0 1 1 0 0 0 0 1");
        let desc = ArrayDescriptor::parse(&el).unwrap();
        let mut out = IOBuffer::allocate(ScalarType::Bit, 9);
        read_array_values(&el, &desc, &plain_ctx(), &mut out, 0, 9, 0).unwrap();
        assert_eq!(out, IOBuffer::Bit(vec![0b1011_0000, 0b1000_0000]));
    }

    #[test]
    fn id_type_override() {
        let el = data_array_element(
            &[("type", "Int64"), ("Name", "ids"), ("format", "ascii"), ("IdType", "1")],
            "",
        );
        let desc = ArrayDescriptor::parse(&el).unwrap();
        assert_eq!(desc.effective_scalar_type(), ScalarType::I64);

        // Mismatched width is ignored.
        let el = data_array_element(
            &[("type", "Int32"), ("Name", "ids"), ("format", "ascii"), ("IdType", "1")],
            "",
        );
        let desc = ArrayDescriptor::parse(&el).unwrap();
        assert_eq!(desc.effective_scalar_type(), ScalarType::I32);
    }

    #[test]
    fn whole_array_read() {
        let el = data_array_element(
            &[("type", "Int32"), ("Name", "conn"), ("format", "ascii"),
              ("NumberOfComponents", "1")],
            "0 1 2 2 1 3",
        );
        let arr = read_data_array(&el, &plain_ctx()).unwrap();
        assert_eq!(arr.name, "conn");
        assert_eq!(arr.data, IOBuffer::I32(vec![0, 1, 2, 2, 1, 3]));
    }
}
