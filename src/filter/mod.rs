//! Reversible preprocessing filters and their per-container identities.

pub(crate) mod bcj;
pub(crate) mod bcj2;
pub(crate) mod delta;

pub use bcj::{BcjReader, BcjWriter};
pub use bcj2::Bcj2Reader;
pub use delta::{DeltaReader, DeltaWriter};

use crate::{archive::CoderId, error::Error};

/// Container formats that can carry a filter chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerFormat {
    /// 7z archive folders.
    SevenZ,
    /// XZ stream blocks.
    Xz,
}

/// Branch-rewriter target architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum FilterArch {
    X86,
    Arm,
    ArmThumb,
    Arm64,
    Ppc,
    Ia64,
    Sparc,
}

/// The two Delta flavors that share wire id 0x03; the container format
/// selects which one is meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaVariant {
    /// Stateless per call, indices relative to the buffer (7z).
    SimpleForward,
    /// 256-byte wrap-around history carried across calls (XZ Utils).
    CircularHistory,
}

impl DeltaVariant {
    /// The variant a container format means when it says filter 0x03.
    pub fn for_format(format: ContainerFormat) -> Self {
        match format {
            ContainerFormat::SevenZ => Self::SimpleForward,
            ContainerFormat::Xz => Self::CircularHistory,
        }
    }
}

/// A filter configuration as it appears in a coder chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSpec {
    /// Byte-distance delta, `distance` in 1..=256.
    Delta {
        /// Byte distance between subtracted values.
        distance: u32,
    },
    /// Branch/call/jump rewriter for one architecture.
    Bcj(FilterArch),
}

impl FilterSpec {
    /// The 7z coder method id of this filter.
    pub fn seven_z_id(&self) -> CoderId {
        match self {
            Self::Delta { .. } => CoderId::DELTA,
            Self::Bcj(FilterArch::X86) => CoderId::BCJ_X86,
            Self::Bcj(FilterArch::Arm) => CoderId::BCJ_ARM,
            Self::Bcj(FilterArch::ArmThumb) => CoderId::BCJ_ARM_THUMB,
            Self::Bcj(FilterArch::Arm64) => CoderId::BCJ_ARM64,
            Self::Bcj(FilterArch::Ppc) => CoderId::BCJ_PPC,
            Self::Bcj(FilterArch::Ia64) => CoderId::BCJ_IA64,
            Self::Bcj(FilterArch::Sparc) => CoderId::BCJ_SPARC,
        }
    }

    /// The XZ filter id of this filter, or
    /// [`Error::FilterUnsupportedInFormat`] where none is assigned.
    pub fn xz_id(&self) -> Result<u64, Error> {
        match self {
            Self::Delta { .. } => Ok(0x03),
            Self::Bcj(FilterArch::X86) => Ok(0x04),
            Self::Bcj(FilterArch::Ppc) => Ok(0x05),
            Self::Bcj(FilterArch::Ia64) => Ok(0x06),
            Self::Bcj(FilterArch::Arm) => Ok(0x07),
            Self::Bcj(FilterArch::ArmThumb) => Ok(0x08),
            Self::Bcj(FilterArch::Sparc) => Ok(0x09),
            Self::Bcj(FilterArch::Arm64) => Err(Error::FilterUnsupportedInFormat {
                arch: FilterArch::Arm64,
                format: ContainerFormat::Xz,
            }),
        }
    }

    /// The filter properties blob for either container format.
    pub fn properties(&self) -> Vec<u8> {
        match self {
            Self::Delta { distance } => vec![(distance - 1) as u8],
            Self::Bcj(_) => Vec::new(),
        }
    }

    pub(crate) fn from_xz_id(id: u64, properties: &[u8]) -> Result<Self, Error> {
        match id {
            0x03 => {
                let byte = *properties
                    .first()
                    .ok_or_else(|| Error::corrupt("delta filter without distance property"))?;
                Ok(Self::Delta {
                    distance: byte as u32 + 1,
                })
            }
            0x04 => Ok(Self::Bcj(FilterArch::X86)),
            0x05 => Ok(Self::Bcj(FilterArch::Ppc)),
            0x06 => Ok(Self::Bcj(FilterArch::Ia64)),
            0x07 => Ok(Self::Bcj(FilterArch::Arm)),
            0x08 => Ok(Self::Bcj(FilterArch::ArmThumb)),
            0x09 => Ok(Self::Bcj(FilterArch::Sparc)),
            _ => Err(Error::UnsupportedCoder(vec![id as u8])),
        }
    }
}

/// A filter instance with its private state, bound to a container format's
/// conventions (delta variant selection per the format rules).
pub struct Filter {
    kind: FilterKind,
}

enum FilterKind {
    DeltaSimple { distance: usize },
    DeltaHistory { encode: delta::Delta, decode: delta::Delta },
    Bcj { arch: FilterArch },
}

impl Filter {
    /// Instantiates `spec` for `format`, validating the pairing.
    pub fn new(spec: FilterSpec, format: ContainerFormat) -> Result<Self, Error> {
        let kind = match spec {
            FilterSpec::Delta { distance } => {
                if !(1..=256).contains(&distance) {
                    return Err(Error::argument("delta distance must be in 1..=256"));
                }
                match DeltaVariant::for_format(format) {
                    DeltaVariant::SimpleForward => FilterKind::DeltaSimple {
                        distance: distance as usize,
                    },
                    DeltaVariant::CircularHistory => FilterKind::DeltaHistory {
                        encode: delta::Delta::new(distance as usize),
                        decode: delta::Delta::new(distance as usize),
                    },
                }
            }
            FilterSpec::Bcj(arch) => {
                if format == ContainerFormat::Xz {
                    // Probe the id table so unsupported pairs fail up front.
                    spec.xz_id()?;
                }
                FilterKind::Bcj { arch }
            }
        };
        Ok(Self { kind })
    }

    /// Instantiates a specific delta variant regardless of format rules.
    pub fn delta_variant(distance: u32, variant: DeltaVariant) -> Result<Self, Error> {
        if !(1..=256).contains(&distance) {
            return Err(Error::argument("delta distance must be in 1..=256"));
        }
        let kind = match variant {
            DeltaVariant::SimpleForward => FilterKind::DeltaSimple {
                distance: distance as usize,
            },
            DeltaVariant::CircularHistory => FilterKind::DeltaHistory {
                encode: delta::Delta::new(distance as usize),
                decode: delta::Delta::new(distance as usize),
            },
        };
        Ok(Self { kind })
    }

    /// Applies the forward transform. `stream_pos` is the absolute position
    /// of `data` within the unfiltered stream.
    pub fn encode(&mut self, data: &[u8], stream_pos: u64) -> Vec<u8> {
        let mut out = data.to_vec();
        match &mut self.kind {
            FilterKind::DeltaSimple { distance } => {
                delta::simple_forward_encode(&mut out, *distance);
            }
            FilterKind::DeltaHistory { encode, .. } => encode.encode(&mut out),
            FilterKind::Bcj { arch } => {
                let mut state = bcj::BcjFilter::for_arch(*arch, stream_pos as usize, true);
                state.apply(&mut out);
            }
        }
        out
    }

    /// Applies the inverse transform.
    pub fn decode(&mut self, data: &[u8], stream_pos: u64) -> Vec<u8> {
        let mut out = data.to_vec();
        match &mut self.kind {
            FilterKind::DeltaSimple { distance } => {
                delta::simple_forward_decode(&mut out, *distance);
            }
            FilterKind::DeltaHistory { decode, .. } => decode.decode(&mut out),
            FilterKind::Bcj { arch } => {
                let mut state = bcj::BcjFilter::for_arch(*arch, stream_pos as usize, false);
                state.apply(&mut out);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_selects_delta_variant() {
        assert_eq!(
            DeltaVariant::for_format(ContainerFormat::SevenZ),
            DeltaVariant::SimpleForward
        );
        assert_eq!(
            DeltaVariant::for_format(ContainerFormat::Xz),
            DeltaVariant::CircularHistory
        );
    }

    #[test]
    fn arm64_has_no_xz_id() {
        let err = FilterSpec::Bcj(FilterArch::Arm64).xz_id().unwrap_err();
        assert!(matches!(
            err,
            Error::FilterUnsupportedInFormat {
                arch: FilterArch::Arm64,
                format: ContainerFormat::Xz,
            }
        ));
        assert!(Filter::new(FilterSpec::Bcj(FilterArch::Arm64), ContainerFormat::Xz).is_err());
        assert!(Filter::new(FilterSpec::Bcj(FilterArch::Arm64), ContainerFormat::SevenZ).is_ok());
    }

    #[test]
    fn every_filter_roundtrips_on_random_bytes() {
        let data: Vec<u8> = (0..2048u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        let specs = [
            FilterSpec::Delta { distance: 1 },
            FilterSpec::Delta { distance: 4 },
            FilterSpec::Delta { distance: 256 },
            FilterSpec::Bcj(FilterArch::X86),
            FilterSpec::Bcj(FilterArch::Arm),
            FilterSpec::Bcj(FilterArch::ArmThumb),
            FilterSpec::Bcj(FilterArch::Arm64),
            FilterSpec::Bcj(FilterArch::Ppc),
            FilterSpec::Bcj(FilterArch::Ia64),
            FilterSpec::Bcj(FilterArch::Sparc),
        ];
        for spec in specs {
            for pos in [0u64, 16, 4096] {
                let mut enc = Filter::new(spec, ContainerFormat::SevenZ).unwrap();
                let encoded = enc.encode(&data, pos);
                let mut dec = Filter::new(spec, ContainerFormat::SevenZ).unwrap();
                assert_eq!(dec.decode(&encoded, pos), data, "{spec:?} at {pos}");
            }
        }
    }

    #[test]
    fn empty_input_passes_through() {
        let mut f = Filter::new(FilterSpec::Bcj(FilterArch::X86), ContainerFormat::SevenZ).unwrap();
        assert!(f.encode(&[], 0).is_empty());
        let mut f = Filter::new(FilterSpec::Delta { distance: 3 }, ContainerFormat::Xz).unwrap();
        assert!(f.encode(&[], 0).is_empty());
    }
}
