//! CLIPRDR file transfer PDUs
//!
//! Encoders and decoders for the four message shapes used by clipboard
//! file transfer ([MS-RDPECLIP] 2.2.5.2.3.1, 2.2.5.3, 2.2.5.4):
//!
//! ```text
//! Offset | Size | Field (common header)
//! -------|------|----------------------
//! 0      | 2    | msgType
//! 2      | 2    | msgFlags (status)
//! 4      | 4    | dataLen (bytes after the header)
//! ```
//!
//! All integers are little-endian. Lengths are always computed on encode;
//! on decode only "enough bytes remain" is checked.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::error;

use crate::clipboard::cursor::ReadCursor;
use crate::clipboard::error::{ClipboardError, Result};
use crate::clipboard::filename::{decode_utf16le_as_utf8, put_filename_field, FILENAME_FIELD_BYTES};

/// CLIPRDR_FORMAT_DATA_RESPONSE
pub const CB_FORMAT_DATA_RESPONSE: u16 = 5;

/// CLIPRDR_FILECONTENTS_REQUEST
pub const CB_FILECONTENTS_REQUEST: u16 = 8;

/// CLIPRDR_FILECONTENTS_RESPONSE
pub const CB_FILECONTENTS_RESPONSE: u16 = 9;

/// Upper bound on `cItems` accepted from a peer
pub const FILE_LIST_MAX_ITEMS: u32 = 64 * 1024;

bitflags! {
    /// `msgFlags` of the common header
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClipboardPduFlags: u16 {
        /// CB_RESPONSE_OK
        const RESPONSE_OK = 0x0001;
        /// CB_RESPONSE_FAIL
        const RESPONSE_FAIL = 0x0002;
    }
}

bitflags! {
    /// `dwFlags` of CLIPRDR_FILECONTENTS_REQUEST
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FileContentsFlags: u32 {
        /// FILECONTENTS_SIZE
        const SIZE = 0x0000_0001;
        /// FILECONTENTS_RANGE
        const RANGE = 0x0000_0002;
    }
}

bitflags! {
    /// `flags` of CLIPRDR_FILEDESCRIPTOR (which optional fields are valid)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FileDescriptorFlags: u32 {
        /// FD_ATTRIBUTES
        const ATTRIBUTES = 0x0000_0004;
        /// FD_WRITESTIME
        const WRITESTIME = 0x0000_0020;
        /// FD_FILESIZE
        const FILESIZE = 0x0000_0040;
        /// FD_SHOWPROGRESSUI
        const SHOWPROGRESSUI = 0x0000_4000;
    }
}

bitflags! {
    /// Windows `FILE_ATTRIBUTE_*` bits carried in `fileAttributes`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FileAttributes: u32 {
        /// FILE_ATTRIBUTE_READONLY
        const READONLY = 0x0000_0001;
        /// FILE_ATTRIBUTE_HIDDEN
        const HIDDEN = 0x0000_0002;
        /// FILE_ATTRIBUTE_SYSTEM
        const SYSTEM = 0x0000_0004;
        /// FILE_ATTRIBUTE_DIRECTORY
        const DIRECTORY = 0x0000_0010;
        /// FILE_ATTRIBUTE_ARCHIVE
        const ARCHIVE = 0x0000_0020;
        /// FILE_ATTRIBUTE_NORMAL
        const NORMAL = 0x0000_0080;
    }
}

// =============================================================================
// Common header
// =============================================================================

/// CLIPRDR_HEADER
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipboardHeader {
    /// Message type
    pub msg_type: u16,
    /// Status flags
    pub msg_flags: ClipboardPduFlags,
    /// Declared length of the data following the header
    pub data_len: u32,
}

impl ClipboardHeader {
    /// Encoded size
    pub const SIZE: usize = 8;

    /// Decode the header from the start of a message
    pub fn decode(src: &mut ReadCursor<'_>) -> Result<Self> {
        src.ensure(Self::SIZE)?;
        let msg_type = src.read_u16()?;
        let msg_flags = ClipboardPduFlags::from_bits_retain(src.read_u16()?);
        let data_len = src.read_u32()?;
        Ok(Self {
            msg_type,
            msg_flags,
            data_len,
        })
    }

    /// Append the header to `dst`
    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_u16_le(self.msg_type);
        dst.put_u16_le(self.msg_flags.bits());
        dst.put_u32_le(self.data_len);
    }

    /// Whether the peer flagged the message as failed
    pub fn is_fail(&self) -> bool {
        self.msg_flags.contains(ClipboardPduFlags::RESPONSE_FAIL)
    }

    /// Declared data length as a buffer size
    pub fn data_length(&self) -> usize {
        self.data_len as usize
    }
}

fn data_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| ClipboardError::InvalidField {
        field: "dataLen",
        reason: "message too large",
    })
}

// =============================================================================
// CLIPRDR_FILECONTENTS_REQUEST
// =============================================================================

/// Request for the size or a byte range of file `lindex`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileContentsRequest {
    /// Correlation id echoed by the response
    pub stream_id: u32,
    /// Index into the most recently announced file list
    pub lindex: u32,
    /// SIZE and/or RANGE
    pub flags: FileContentsFlags,
    /// Low 32 bits of the byte offset
    pub position_low: u32,
    /// High 32 bits of the byte offset (always zero here)
    pub position_high: u32,
    /// Number of bytes requested
    pub requested_bytes: u32,
    /// Lock id, unused
    pub clip_data_id: u32,
}

impl FileContentsRequest {
    const NAME: &'static str = "CLIPRDR_FILECONTENTS_REQUEST";

    /// Declared body length
    pub const BODY_SIZE: usize = 28;

    /// Size of a fully encoded request, trailing pad included
    pub const ENCODED_SIZE: usize = ClipboardHeader::SIZE + Self::BODY_SIZE + 4;

    /// Build a FILECONTENTS_SIZE request
    pub fn size(stream_id: u32, lindex: u32) -> Self {
        Self {
            stream_id,
            lindex,
            flags: FileContentsFlags::SIZE,
            position_low: 0,
            position_high: 0,
            requested_bytes: 0,
            clip_data_id: 0,
        }
    }

    /// Build a FILECONTENTS_RANGE request
    pub fn range(stream_id: u32, lindex: u32, offset: u32, length: u32) -> Self {
        Self {
            stream_id,
            lindex,
            flags: FileContentsFlags::RANGE,
            position_low: offset,
            position_high: 0,
            requested_bytes: length,
            clip_data_id: 0,
        }
    }

    /// Serialize with header and trailing reserved word
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(Self::ENCODED_SIZE);
        ClipboardHeader {
            msg_type: CB_FILECONTENTS_REQUEST,
            msg_flags: ClipboardPduFlags::empty(),
            data_len: Self::BODY_SIZE as u32,
        }
        .encode(&mut dst);
        dst.put_u32_le(self.stream_id);
        dst.put_u32_le(self.lindex);
        dst.put_u32_le(self.flags.bits());
        dst.put_u32_le(self.position_low);
        dst.put_u32_le(self.position_high);
        dst.put_u32_le(self.requested_bytes);
        dst.put_u32_le(self.clip_data_id);
        dst.put_u32_le(0);
        dst.freeze()
    }

    /// Decode the body that follows a type 8 header
    pub fn decode_body(src: &mut ReadCursor<'_>) -> Result<Self> {
        src.set_context(Self::NAME);
        src.ensure(Self::BODY_SIZE)?;
        Ok(Self {
            stream_id: src.read_u32()?,
            lindex: src.read_u32()?,
            flags: FileContentsFlags::from_bits_retain(src.read_u32()?),
            position_low: src.read_u32()?,
            position_high: src.read_u32()?,
            requested_bytes: src.read_u32()?,
            clip_data_id: src.read_u32()?,
        })
    }
}

// =============================================================================
// CLIPRDR_FILECONTENTS_RESPONSE
// =============================================================================

/// Answer to a FileContentsRequest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContentsResponse {
    /// CB_RESPONSE_FAIL carrying only the stream id
    Fail {
        /// Echoed stream id
        stream_id: u32,
    },
    /// File size, split into low/high words on the wire
    Size {
        /// Echoed stream id
        stream_id: u32,
        /// File size in bytes
        size: u64,
    },
    /// Raw file bytes
    Range {
        /// Echoed stream id
        stream_id: u32,
        /// Bytes actually read, possibly fewer than requested
        data: Bytes,
    },
}

impl FileContentsResponse {
    const NAME: &'static str = "CLIPRDR_FILECONTENTS_RESPONSE";

    /// Stream id carried by the response
    pub fn stream_id(&self) -> u32 {
        match self {
            Self::Fail { stream_id }
            | Self::Size { stream_id, .. }
            | Self::Range { stream_id, .. } => *stream_id,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Self::Fail { .. } => 4,
            Self::Size { .. } => 12,
            Self::Range { data, .. } => 4 + data.len(),
        }
    }

    /// Serialize; the declared length equals the bytes that follow
    pub fn encode(&self) -> Result<Bytes> {
        let body_len = self.body_len();
        let msg_flags = match self {
            Self::Fail { .. } => ClipboardPduFlags::RESPONSE_FAIL,
            _ => ClipboardPduFlags::RESPONSE_OK,
        };

        let mut dst = BytesMut::with_capacity(ClipboardHeader::SIZE + body_len);
        ClipboardHeader {
            msg_type: CB_FILECONTENTS_RESPONSE,
            msg_flags,
            data_len: data_len(body_len)?,
        }
        .encode(&mut dst);

        dst.put_u32_le(self.stream_id());
        match self {
            Self::Fail { .. } => {}
            Self::Size { size, .. } => {
                dst.put_u32_le((*size & 0xffff_ffff) as u32);
                dst.put_u32_le((*size >> 32) as u32);
            }
            Self::Range { data, .. } => dst.put_slice(data),
        }
        Ok(dst.freeze())
    }

    /// Decode the `{streamId, fileSizeLow[, fileSizeHigh]}` body of a size answer
    pub fn decode_size_body(body: &[u8]) -> Result<(u32, u64)> {
        let mut src = ReadCursor::new(body, Self::NAME);
        let stream_id = src.read_u32()?;
        let low = src.read_u32()?;
        let high = if src.remaining() >= 4 { src.read_u32()? } else { 0 };
        Ok((stream_id, (u64::from(high) << 32) | u64::from(low)))
    }

    /// Split a range answer body into its stream id and payload
    pub fn decode_range_body(body: &[u8]) -> Result<(u32, &[u8])> {
        let mut src = ReadCursor::new(body, Self::NAME);
        let stream_id = src.read_u32()?;
        Ok((stream_id, src.read_remaining()))
    }

    /// Decode the stream id alone (fail answers)
    pub fn decode_stream_id(body: &[u8]) -> Result<u32> {
        ReadCursor::new(body, Self::NAME).read_u32()
    }
}

// =============================================================================
// CLIPRDR_FILEDESCRIPTOR
// =============================================================================

/// One 592-byte CLIPRDR_FILEDESCRIPTOR record
///
/// ```text
/// Offset | Size | Field
/// -------|------|------
/// 0      | 4    | flags
/// 4      | 32   | reserved1
/// 36     | 4    | fileAttributes
/// 40     | 16   | reserved2
/// 56     | 8    | lastWriteTime (low, high)
/// 64     | 8    | fileSizeHigh, fileSizeLow
/// 72     | 520  | cFileName (UTF-16LE, 260 words, NUL terminated)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// Which optional fields are valid
    pub flags: FileDescriptorFlags,
    /// FILE_ATTRIBUTE_* bits
    pub attributes: FileAttributes,
    /// FILETIME ticks (100 ns since 1601-01-01 UTC)
    pub last_write_time: u64,
    /// File size in bytes
    pub file_size: u64,
    /// File name, UTF-8
    pub file_name: String,
}

impl FileDescriptor {
    const NAME: &'static str = "CLIPRDR_FILEDESCRIPTOR";

    /// Encoded size of one record
    pub const SIZE: usize = 4 + 32 + 4 + 16 + 8 + 8 + FILENAME_FIELD_BYTES;

    /// Low 32 bits of `fileSize`
    pub fn file_size_low(&self) -> u32 {
        (self.file_size & 0xffff_ffff) as u32
    }

    /// Whether the peer marked this entry as a directory
    pub fn is_directory(&self) -> bool {
        self.attributes.contains(FileAttributes::DIRECTORY)
    }

    /// Whether the name contains a path separator (entry inside a directory)
    pub fn has_path_separator(&self) -> bool {
        self.file_name.contains(['\\', '/'])
    }

    /// Decode one record
    ///
    /// A name with no terminator inside its field is a hard failure: the
    /// offsets of any following record would be unrecoverable.
    pub fn decode(src: &mut ReadCursor<'_>) -> Result<Self> {
        src.set_context(Self::NAME);
        src.ensure(Self::SIZE)?;

        let flags = FileDescriptorFlags::from_bits_retain(src.read_u32()?);
        src.skip(32)?;
        let attributes = FileAttributes::from_bits_retain(src.read_u32()?);
        src.skip(16)?;
        let write_low = src.read_u32()?;
        let write_high = src.read_u32()?;
        let size_high = src.read_u32()?;
        let size_low = src.read_u32()?;

        let field = src.read_slice(FILENAME_FIELD_BYTES)?;
        let decoded = decode_utf16le_as_utf8(field, FILENAME_FIELD_BYTES);
        if !decoded.terminated {
            return Err(ClipboardError::UnterminatedFilename);
        }

        Ok(Self {
            flags,
            attributes,
            last_write_time: (u64::from(write_high) << 32) | u64::from(write_low),
            file_size: (u64::from(size_high) << 32) | u64::from(size_low),
            file_name: decoded.name,
        })
    }

    /// Append the record; on name overflow the record is still complete
    /// (empty name) and the overflow is returned
    pub fn encode<B: BufMut>(&self, dst: &mut B) -> Result<()> {
        dst.put_u32_le(self.flags.bits());
        dst.put_bytes(0, 32);
        dst.put_u32_le(self.attributes.bits());
        dst.put_bytes(0, 16);
        dst.put_u32_le((self.last_write_time & 0xffff_ffff) as u32);
        dst.put_u32_le((self.last_write_time >> 32) as u32);
        dst.put_u32_le((self.file_size >> 32) as u32);
        dst.put_u32_le(self.file_size_low());
        put_filename_field(dst, &self.file_name)
    }
}

// =============================================================================
// CLIPRDR_FORMAT_DATA_RESPONSE (file list)
// =============================================================================

/// Format data response carrying a CLIPRDR_FILELIST
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileListResponse {
    /// Descriptors in announcement order
    pub descriptors: Vec<FileDescriptor>,
}

impl FileListResponse {
    const NAME: &'static str = "CLIPRDR_FILELIST";

    /// Declared data length for `count` items: the count word plus records
    pub fn data_len_for(count: usize) -> usize {
        FileDescriptor::SIZE * count + 4
    }

    /// Serialize: header, cItems, records, trailing zero word
    ///
    /// Names that overflow their field are logged and sent empty.
    pub fn encode(&self) -> Result<Bytes> {
        let count = self.descriptors.len();
        let body_len = Self::data_len_for(count);

        let mut dst = BytesMut::with_capacity(ClipboardHeader::SIZE + body_len + 4);
        ClipboardHeader {
            msg_type: CB_FORMAT_DATA_RESPONSE,
            msg_flags: ClipboardPduFlags::RESPONSE_OK,
            data_len: data_len(body_len)?,
        }
        .encode(&mut dst);
        dst.put_u32_le(data_len(count)?);

        for (lindex, descriptor) in self.descriptors.iter().enumerate() {
            if let Err(e) = descriptor.encode(&mut dst) {
                error!(
                    "File list entry {} '{}' sent without a name: {}",
                    lindex, descriptor.file_name, e
                );
            }
        }
        dst.put_u32_le(0);
        Ok(dst.freeze())
    }

    /// Decode the body (`cItems` then records) following a type 5 header
    pub fn decode_body(src: &mut ReadCursor<'_>) -> Result<Self> {
        src.set_context(Self::NAME);
        let count = src.read_u32()?;
        if count > FILE_LIST_MAX_ITEMS {
            return Err(ClipboardError::InvalidItemCount {
                count: i64::from(count as i32),
                max: FILE_LIST_MAX_ITEMS,
            });
        }

        let fits = src.remaining() / FileDescriptor::SIZE;
        let mut descriptors = Vec::with_capacity((count as usize).min(fits));
        for _ in 0..count {
            descriptors.push(FileDescriptor::decode(src)?);
        }
        Ok(Self { descriptors })
    }
}
