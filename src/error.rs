use std::{borrow::Cow, fmt::Display};

use crate::filter::{ContainerFormat, FilterArch};

/// The error type of the crate.
#[derive(Debug)]
pub enum Error {
    /// Invalid 7z signature found in file header.
    BadSignature([u8; 6]),
    /// Unsupported 7z format version.
    UnsupportedVersion {
        /// Major version number.
        major: u8,
        /// Minor version number.
        minor: u8,
    },
    /// A read ran past the end of the input.
    UnexpectedEof,
    /// The container structure is damaged beyond this operation.
    ArchiveCorrupt(Cow<'static, str>),
    /// A stored digest did not match the recomputed one.
    ChecksumMismatch {
        /// Digest recorded in the container.
        expected: u32,
        /// Digest computed over the actual bytes.
        actual: u32,
        /// Which stream or entry failed.
        location: Cow<'static, str>,
    },
    /// A folder references a coder this build does not know.
    UnsupportedCoder(Vec<u8>),
    /// The filter exists but has no id in the requested container format.
    FilterUnsupportedInFormat {
        /// Requested filter architecture.
        arch: FilterArch,
        /// Container format that cannot carry it.
        format: ContainerFormat,
    },
    /// No symbol matched within the maximum Huffman code length.
    InvalidHuffmanCode,
    /// A match referenced data outside the sliding window.
    InvalidMatch {
        /// Requested back-reference distance.
        distance: usize,
        /// Size of the window it must fit in.
        window_size: usize,
    },
    /// The recovery matrix is singular; the missing blocks cannot be solved.
    Par2Singular,
    /// Fewer recovery blocks are available than blocks are missing.
    Par2InsufficientRecovery {
        /// Recovery blocks required.
        needed: usize,
        /// Recovery blocks available.
        have: usize,
    },
    /// IO error with optional context message.
    Io(std::io::Error, Cow<'static, str>),
    /// A caller-supplied value is outside the supported range.
    InvalidArgument(Cow<'static, str>),
    /// Feature or operation not supported.
    Unsupported(Cow<'static, str>),
    /// Other error with description.
    Other(Cow<'static, str>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        // Errors raised inside a Read/Write adapter travel wrapped in an
        // io::Error; unwrap them so callers see the original kind.
        match value.downcast::<Error>() {
            Ok(inner) => inner,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Self::UnexpectedEof,
            Err(e) => Self::io(e),
        }
    }
}

impl Error {
    #[inline]
    pub(crate) fn other<S: Into<Cow<'static, str>>>(s: S) -> Self {
        Self::Other(s.into())
    }

    #[inline]
    pub(crate) fn corrupt<S: Into<Cow<'static, str>>>(s: S) -> Self {
        Self::ArchiveCorrupt(s.into())
    }

    #[inline]
    pub(crate) fn unsupported<S: Into<Cow<'static, str>>>(s: S) -> Self {
        Self::Unsupported(s.into())
    }

    #[inline]
    pub(crate) fn argument<S: Into<Cow<'static, str>>>(s: S) -> Self {
        Self::InvalidArgument(s.into())
    }

    #[inline]
    pub(crate) fn io(e: std::io::Error) -> Self {
        Self::io_msg(e, "")
    }

    #[inline]
    pub(crate) fn io_msg(e: std::io::Error, msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Io(e, msg.into())
    }

    #[inline]
    pub(crate) fn file_open(e: std::io::Error, filename: impl Into<Cow<'static, str>>) -> Self {
        Self::Io(e, filename.into())
    }

    pub(crate) fn checksum(
        expected: u32,
        actual: u32,
        location: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::ChecksumMismatch {
            expected,
            actual,
            location: location.into(),
        }
    }

    /// Wraps this error so it can cross a `std::io` trait boundary and be
    /// recovered by the `From<std::io::Error>` impl on the other side.
    pub(crate) fn into_io(self) -> std::io::Error {
        match self {
            Self::Io(e, msg) if msg.is_empty() => e,
            other => std::io::Error::other(other),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self, f)
    }
}

impl std::error::Error for Error {}
