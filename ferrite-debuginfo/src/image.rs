//! Random access to object file images.
//!
//! All byte-level access to an object file goes through an [`Image`]. It
//! presents a logically contiguous byte stream regardless of the backing:
//! a local file is memory mapped, while a companion fetched from a
//! debuginfo server lives in an owned buffer. Readers address an image via
//! byte offsets; offsets are only meaningful together with the image they
//! were taken from.
//!
//! [`ImageSlice`] pairs an image with an offset and a length, and is the
//! unit handed to the downstream symbol, line and call-frame readers.

use std::fmt;
use std::io;

use thiserror::Error;

use ferrite_common::ByteView;

/// An error opening or fetching an [`Image`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ImageError {
    /// The local file could not be opened or mapped.
    #[error("cannot open image")]
    Io(#[from] io::Error),

    /// The debuginfo server request failed or returned an error status.
    #[error("cannot fetch image from server: {0}")]
    Fetch(String),
}

/// A random-access byte source over an object file.
///
/// Up to three images are held at a time while acquiring debug info: the
/// main object, its debug companion and the alternate debug companion.
/// Each is released when it goes out of scope.
pub struct Image {
    view: ByteView<'static>,
    origin: String,
}

impl Image {
    /// Opens an image from a file in the local filesystem.
    pub fn from_local_file(path: &str) -> Result<Self, ImageError> {
        let view = ByteView::open(path)?;
        Ok(Image {
            view,
            origin: path.to_string(),
        })
    }

    /// Fetches an image from a debuginfo server.
    ///
    /// `server` is an `"address[:port]"` endpoint and `name` a plain
    /// basename with no path components. The entire file is downloaded
    /// into memory; the call blocks until the transfer completes or fails.
    pub fn from_server(name: &str, server: &str) -> Result<Self, ImageError> {
        let url = format!("http://{server}/{name}");
        let response = reqwest::blocking::get(url.as_str())
            .and_then(|response| response.error_for_status())
            .map_err(|err| ImageError::Fetch(err.to_string()))?;
        let bytes = response
            .bytes()
            .map_err(|err| ImageError::Fetch(err.to_string()))?;

        Ok(Image {
            view: ByteView::from_vec(bytes.to_vec()),
            origin: format!("{name} on {server}"),
        })
    }

    /// Creates an image over an owned buffer.
    pub fn from_vec(origin: impl Into<String>, data: Vec<u8>) -> Self {
        Image {
            view: ByteView::from_vec(data),
            origin: origin.into(),
        }
    }

    /// Where this image came from: a filesystem path or `"name on server"`.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// The raw bytes of the whole image.
    pub fn data(&self) -> &[u8] {
        self.view.as_slice()
    }

    /// The size of the image in bytes.
    pub fn size(&self) -> u64 {
        self.view.len() as u64
    }

    /// Returns true iff `[offset, offset + len)` lies wholly inside the
    /// image.
    pub fn is_valid(&self, offset: u64, len: u64) -> bool {
        offset
            .checked_add(len)
            .map_or(false, |end| end <= self.size())
    }

    /// Returns the `len` bytes starting at `offset`, or `None` if the
    /// range leaves the image.
    pub fn get(&self, offset: u64, len: u64) -> Option<&[u8]> {
        if !self.is_valid(offset, len) {
            return None;
        }
        self.data().get(offset as usize..(offset + len) as usize)
    }

    /// Reads a single byte.
    pub fn get_u8(&self, offset: u64) -> Option<u8> {
        self.get(offset, 1).map(|bytes| bytes[0])
    }

    /// Reads a 32-bit integer in the given byte order.
    pub fn get_u32(&self, offset: u64, little_endian: bool) -> Option<u32> {
        let bytes: [u8; 4] = self.get(offset, 4)?.try_into().ok()?;
        Some(if little_endian {
            u32::from_le_bytes(bytes)
        } else {
            u32::from_be_bytes(bytes)
        })
    }

    /// Reads a 64-bit integer in the given byte order.
    pub fn get_u64(&self, offset: u64, little_endian: bool) -> Option<u64> {
        let bytes: [u8; 8] = self.get(offset, 8)?.try_into().ok()?;
        Some(if little_endian {
            u64::from_le_bytes(bytes)
        } else {
            u64::from_be_bytes(bytes)
        })
    }

    /// Returns the NUL-terminated string starting at `offset`, without the
    /// terminator. `None` if the terminator lies outside the image.
    pub fn read_cstr(&self, offset: u64) -> Option<&[u8]> {
        let tail = self.data().get(offset as usize..)?;
        let len = tail.iter().position(|&byte| byte == 0)?;
        Some(&tail[..len])
    }

    /// The length of the NUL-terminated string starting at `offset`.
    pub fn cstr_len(&self, offset: u64) -> Option<u64> {
        self.read_cstr(offset).map(|s| s.len() as u64)
    }

    /// Compares the NUL-terminated string at `offset` against `expected`.
    pub fn cstr_matches(&self, offset: u64, expected: &[u8]) -> bool {
        self.read_cstr(offset) == Some(expected)
    }

    /// The CRC-32 checksum of the entire image, as used by
    /// `.gnu_debuglink` sections to validate a debug companion.
    pub fn gnu_debuglink_crc32(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(self.data());
        hasher.finalize()
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("origin", &self.origin)
            .field("size", &self.size())
            .finish()
    }
}

/// A contiguous region of an [`Image`].
///
/// The "invalid" slice of the on-disk reader is expressed as
/// `Option<ImageSlice>`; a constructed slice always satisfies
/// `offset + size <= image.size()`.
#[derive(Clone, Copy)]
pub struct ImageSlice<'a> {
    image: &'a Image,
    offset: u64,
    size: u64,
}

impl<'a> ImageSlice<'a> {
    /// Creates a slice after checking that it lies inside the image.
    pub fn new(image: &'a Image, offset: u64, size: u64) -> Option<Self> {
        image.is_valid(offset, size).then_some(ImageSlice {
            image,
            offset,
            size,
        })
    }

    /// The image this slice borrows from.
    pub fn image(&self) -> &'a Image {
        self.image
    }

    /// The start offset within the image.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The length of the slice in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The bytes of the slice.
    pub fn data(&self) -> &'a [u8] {
        &self.image.data()[self.offset as usize..(self.offset + self.size) as usize]
    }

    /// Whether this slice borrows from the given image.
    pub fn is_from(&self, image: &Image) -> bool {
        std::ptr::eq(self.image, image)
    }
}

impl fmt::Debug for ImageSlice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageSlice")
            .field("origin", &self.image.origin())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}
