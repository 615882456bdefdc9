//! Option types for the coders a folder chain can carry.

use crate::archive::CoderId;

/// An encode-side coder selection: the method plus its options.
#[derive(Debug, Default, Clone)]
pub struct CoderConfiguration {
    /// The coder to run.
    pub method: CoderId,
    /// Coder-specific options.
    pub options: Option<CoderOptions>,
}

impl CoderConfiguration {
    /// Creates a configuration for `method` with default options.
    pub fn new(method: CoderId) -> Self {
        Self {
            method,
            options: None,
        }
    }

    /// Attaches options to this configuration.
    pub fn with_options(mut self, options: CoderOptions) -> Self {
        self.options = Some(options);
        self
    }
}

impl From<CoderId> for CoderConfiguration {
    fn from(value: CoderId) -> Self {
        Self::new(value)
    }
}

/// Options for the Delta filter.
#[derive(Debug, Copy, Clone)]
pub struct DeltaOptions(pub(crate) u32);

impl DeltaOptions {
    /// Creates Delta options with the given distance (clamped to 1..=256).
    pub const fn from_distance(distance: u32) -> Self {
        let distance = if distance == 0 {
            1
        } else if distance > 256 {
            256
        } else {
            distance
        };
        Self(distance)
    }

    /// The configured distance.
    pub const fn distance(&self) -> u32 {
        self.0
    }
}

impl Default for DeltaOptions {
    fn default() -> Self {
        Self(1)
    }
}

/// Options for LZMA compression.
#[derive(Debug, Clone)]
pub struct LzmaOptions(pub(crate) lzma_rust2::LZMA2Options);

impl LzmaOptions {
    /// Creates LZMA options from a compression level (0-9).
    pub fn from_level(level: u32) -> Self {
        Self(lzma_rust2::LZMA2Options::with_preset(level))
    }
}

impl Default for LzmaOptions {
    fn default() -> Self {
        Self::from_level(6)
    }
}

/// Options for LZMA2 compression.
#[derive(Debug, Clone)]
pub struct Lzma2Options(pub(crate) lzma_rust2::LZMA2Options);

impl Lzma2Options {
    /// Creates LZMA2 options from a compression level (0-9).
    pub fn from_level(level: u32) -> Self {
        Self(lzma_rust2::LZMA2Options::with_preset(level))
    }

    /// Sets the dictionary size, clamped to the supported range.
    pub fn set_dictionary_size(&mut self, dict_size: u32) {
        self.0.dict_size = dict_size.clamp(lzma_rust2::DICT_SIZE_MIN, lzma_rust2::DICT_SIZE_MAX);
    }
}

impl Default for Lzma2Options {
    fn default() -> Self {
        Self::from_level(6)
    }
}

/// Coder-specific options carried by a [`CoderConfiguration`].
#[derive(Debug, Clone)]
pub enum CoderOptions {
    /// Delta filter options.
    Delta(DeltaOptions),
    /// LZMA options.
    Lzma(LzmaOptions),
    /// LZMA2 options.
    Lzma2(Lzma2Options),
}

impl From<DeltaOptions> for CoderConfiguration {
    fn from(options: DeltaOptions) -> Self {
        Self::new(CoderId::DELTA).with_options(CoderOptions::Delta(options))
    }
}

impl From<LzmaOptions> for CoderConfiguration {
    fn from(options: LzmaOptions) -> Self {
        Self::new(CoderId::LZMA).with_options(CoderOptions::Lzma(options))
    }
}

impl From<Lzma2Options> for CoderConfiguration {
    fn from(options: Lzma2Options) -> Self {
        Self::new(CoderId::LZMA2).with_options(CoderOptions::Lzma2(options))
    }
}
