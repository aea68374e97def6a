//! Register descriptor model
//!
//! A descriptor is static data about one value on a device: where it lives,
//! how its raw words are laid out, and how often it is polled. Descriptors
//! that are not read from the bus carry a [`Derivation`] instead of an address.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ConfigError;

/// Longest register accepted for numeric encodings, in words.
pub const MAX_NUMERIC_WORDS: u16 = 4;

/// Most decimal places a value can be rounded to.
pub const MAX_PRECISION: u32 = 15;

/// Register bank. Addresses are independent between banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bank {
    /// Input registers (FC04)
    #[serde(alias = "input")]
    ReadOnly,
    /// Holding registers (FC03/FC06/FC16)
    #[serde(alias = "holding")]
    ReadWrite,
}

impl fmt::Display for Bank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Bank::ReadOnly => "read-only",
            Bank::ReadWrite => "read-write",
        })
    }
}

/// How the reassembled bits are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    UInt,
    Int,
    Float,
    Ascii,
    Boolean,
}

impl Encoding {
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::UInt => "unsigned integer",
            Encoding::Int => "signed integer",
            Encoding::Float => "float",
            Encoding::Ascii => "ASCII string",
            Encoding::Boolean => "boolean",
        }
    }
}

/// Word and byte order of multi-byte values, relative to big-endian `ABCD`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    /// `ABCD`
    #[default]
    Normal,
    /// `CDAB`
    WordSwapped,
    /// `BADC`
    ByteSwapped,
    /// `DCBA`
    Both,
}

impl WordOrder {
    pub fn swaps_words(&self) -> bool {
        matches!(self, WordOrder::WordSwapped | WordOrder::Both)
    }

    pub fn swaps_bytes(&self) -> bool {
        matches!(self, WordOrder::ByteSwapped | WordOrder::Both)
    }
}

/// Sub-extraction applied to the raw integer before scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitExtraction {
    /// `value & mask`
    Mask(u64),
    /// `(value >> index) & 1`
    Bit(u32),
    /// `(value >> start) & ((1 << len) - 1)`
    Range { start: u32, len: u32 },
    /// Right shift; arithmetic for signed encodings, logical otherwise.
    Shift(u32),
    /// Right rotation within the register width.
    Rotate(u32),
}

/// Polling cadence group.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PollTier {
    Fast,
    #[default]
    Normal,
    Slow,
}

impl PollTier {
    pub const ALL: [PollTier; 3] = [PollTier::Fast, PollTier::Normal, PollTier::Slow];
}

impl fmt::Display for PollTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PollTier::Fast => "fast",
            PollTier::Normal => "normal",
            PollTier::Slow => "slow",
        })
    }
}

/// Condition used by [`Derivation::Split`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Positive,
    Negative,
    NonZero,
    Above(f64),
    Below(f64),
}

impl Predicate {
    pub fn holds(&self, value: f64) -> bool {
        match *self {
            Predicate::Positive => value > 0.0,
            Predicate::Negative => value < 0.0,
            Predicate::NonZero => value != 0.0,
            Predicate::Above(limit) => value > limit,
            Predicate::Below(limit) => value < limit,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sign {
    #[default]
    Keep,
    Absolute,
}

fn default_fallback() -> String {
    "unknown".to_string()
}

/// Rule for a value computed from other registers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Derivation {
    Sum(Vec<String>),
    Split {
        source: String,
        when: Predicate,
        #[serde(default)]
        sign: Sign,
    },
    Formula {
        sources: Vec<String>,
        expression: String,
    },
    /// Keys are decimal or `0x` prefixed hexadecimal integers.
    Map {
        source: String,
        table: BTreeMap<String, String>,
        #[serde(default = "default_fallback")]
        fallback: String,
    },
}

impl Derivation {
    /// Names of the registers this derivation reads.
    pub fn sources(&self) -> Vec<&str> {
        match self {
            Derivation::Sum(sources) | Derivation::Formula { sources, .. } => {
                sources.iter().map(String::as_str).collect()
            }
            Derivation::Split { source, .. } | Derivation::Map { source, .. } => {
                vec![source.as_str()]
            }
        }
    }
}

/// Raw layout and value interpretation of a register.
#[derive(Debug, Clone, PartialEq)]
pub struct Format {
    pub encoding: Encoding,
    pub width_bits: u32,
    pub word_count: u16,
    pub word_order: WordOrder,
    pub scale: f64,
    pub precision: Option<u32>,
    pub bit_extraction: Option<BitExtraction>,
}

impl Format {
    /// Numeric or boolean format; the word count follows from the width.
    pub fn new(encoding: Encoding, width_bits: u32) -> Self {
        Self {
            encoding,
            width_bits,
            word_count: (width_bits / 16) as u16,
            word_order: WordOrder::Normal,
            scale: 1.0,
            precision: None,
            bit_extraction: None,
        }
    }

    /// ASCII string spanning `words` registers, two characters per word.
    pub fn string(words: u16) -> Self {
        Self {
            encoding: Encoding::Ascii,
            width_bits: u32::from(words) * 16,
            word_count: words,
            word_order: WordOrder::Normal,
            scale: 1.0,
            precision: None,
            bit_extraction: None,
        }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_precision(mut self, precision: u32) -> Self {
        self.precision = Some(precision);
        self
    }

    pub fn with_word_order(mut self, word_order: WordOrder) -> Self {
        self.word_order = word_order;
        self
    }

    pub fn with_bits(mut self, extraction: BitExtraction) -> Self {
        self.bit_extraction = Some(extraction);
        self
    }

    /// Whether decoded values stay integers rather than becoming floats.
    pub fn is_integral(&self) -> bool {
        self.scale == 1.0 && self.precision.is_none()
    }

    /// Decimal places applied after scaling.
    ///
    /// Without an explicit precision, integer encodings round to the number of
    /// decimals in `scale` and floats are left untouched.
    pub fn effective_precision(&self) -> Option<u32> {
        match (self.precision, self.encoding) {
            (Some(p), _) => Some(p),
            (None, Encoding::Float) => None,
            (None, _) => Some(scale_decimals(self.scale)),
        }
    }

    /// Precision beyond what an `f64` can carry would round to NaN.
    pub fn validate_precision(&self, name: &str) -> Result<(), ConfigError> {
        match self.precision {
            Some(p) if p > MAX_PRECISION => Err(ConfigError::InvalidFormat {
                name: name.to_string(),
                reason: format!("precision {p} exceeds {MAX_PRECISION} decimal places"),
            }),
            _ => Ok(()),
        }
    }

    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidFormat {
            name: name.to_string(),
            reason,
        };
        if !self.scale.is_finite() || self.scale == 0.0 {
            return Err(invalid(format!("scale {} must be finite and non-zero", self.scale)));
        }
        self.validate_precision(name)?;
        if self.word_count == 0 {
            return Err(invalid("word count must be at least 1".to_string()));
        }
        match self.encoding {
            Encoding::Ascii => {
                if self.bit_extraction.is_some() {
                    return Err(ConfigError::BitExtractionNotAllowed {
                        name: name.to_string(),
                        encoding: self.encoding.name(),
                    });
                }
                return Ok(());
            }
            Encoding::Float => {
                if self.bit_extraction.is_some() {
                    return Err(ConfigError::BitExtractionNotAllowed {
                        name: name.to_string(),
                        encoding: self.encoding.name(),
                    });
                }
                if !matches!(self.width_bits, 32 | 64) {
                    return Err(invalid(format!("float width {} must be 32 or 64", self.width_bits)));
                }
            }
            Encoding::UInt | Encoding::Int | Encoding::Boolean => {
                if !matches!(self.width_bits, 16 | 32 | 64) {
                    return Err(invalid(format!(
                        "integer width {} must be 16, 32 or 64",
                        self.width_bits
                    )));
                }
            }
        }
        if self.word_count > MAX_NUMERIC_WORDS || u32::from(self.word_count) * 16 != self.width_bits {
            return Err(invalid(format!(
                "{} words do not hold a {}-bit value",
                self.word_count, self.width_bits
            )));
        }
        let width = self.width_bits;
        match self.bit_extraction {
            None | Some(BitExtraction::Mask(_)) => {}
            Some(BitExtraction::Bit(index)) if index >= width => {
                return Err(invalid(format!("bit {index} is outside a {width}-bit value")));
            }
            Some(BitExtraction::Range { start, len }) if len == 0 || start + len > width => {
                return Err(invalid(format!(
                    "bit range {start}+{len} is outside a {width}-bit value"
                )));
            }
            Some(BitExtraction::Shift(n) | BitExtraction::Rotate(n)) if n >= width => {
                return Err(invalid(format!("shift of {n} is outside a {width}-bit value")));
            }
            Some(_) => {}
        }
        Ok(())
    }
}

impl Default for Format {
    fn default() -> Self {
        Self::new(Encoding::UInt, 16)
    }
}

/// Number of decimal places needed to represent `scale` exactly, capped at 9.
fn scale_decimals(scale: f64) -> u32 {
    let mut factor = 1.0;
    for decimals in 0..9 {
        let shifted = scale * factor;
        if (shifted - shifted.round()).abs() < 1e-9 * factor {
            return decimals;
        }
        factor *= 10.0;
    }
    9
}

/// Where a register's value comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Direct { address: u16, bank: Bank },
    Derived(Derivation),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterDescriptor {
    pub name: String,
    pub source: Source,
    pub format: Format,
    pub tier: PollTier,
    pub unit: Option<String>,
}

impl RegisterDescriptor {
    pub fn direct(name: impl Into<String>, address: u16, bank: Bank, format: Format) -> Self {
        Self {
            name: name.into(),
            source: Source::Direct { address, bank },
            format,
            tier: PollTier::default(),
            unit: None,
        }
    }

    pub fn derived(name: impl Into<String>, derivation: Derivation) -> Self {
        Self {
            name: name.into(),
            source: Source::Derived(derivation),
            format: Format::new(Encoding::Float, 64),
            tier: PollTier::default(),
            unit: None,
        }
    }

    pub fn with_tier(mut self, tier: PollTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// `(bank, start, end)` of a directly read register, `end` exclusive.
    pub fn address_range(&self) -> Option<(Bank, u32, u32)> {
        match self.source {
            Source::Direct { address, bank } => {
                let start = u32::from(address);
                Some((bank, start, start + u32::from(self.format.word_count)))
            }
            Source::Derived(_) => None,
        }
    }

    pub fn derivation(&self) -> Option<&Derivation> {
        match &self.source {
            Source::Derived(derivation) => Some(derivation),
            Source::Direct { .. } => None,
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(
            self.source,
            Source::Direct {
                bank: Bank::ReadWrite,
                ..
            }
        )
    }

    /// Checks the register in isolation; cross-register rules live in the
    /// planner and the derivation evaluator.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some((_, _, end)) = self.address_range() {
            if end > u32::from(u16::MAX) + 1 {
                return Err(ConfigError::AddressOverflow {
                    name: self.name.clone(),
                });
            }
            self.format.validate(&self.name)?;
        } else {
            self.format.validate_precision(&self.name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_order_flags() {
        assert!(!WordOrder::Normal.swaps_words());
        assert!(WordOrder::WordSwapped.swaps_words());
        assert!(!WordOrder::WordSwapped.swaps_bytes());
        assert!(WordOrder::ByteSwapped.swaps_bytes());
        assert!(WordOrder::Both.swaps_words() && WordOrder::Both.swaps_bytes());
    }

    #[test]
    fn test_scale_decimals() {
        assert_eq!(scale_decimals(1.0), 0);
        assert_eq!(scale_decimals(10.0), 0);
        assert_eq!(scale_decimals(0.1), 1);
        assert_eq!(scale_decimals(0.01), 2);
        assert_eq!(scale_decimals(2.5), 1);
        assert_eq!(scale_decimals(0.001), 3);
    }

    #[test]
    fn test_effective_precision() {
        let plain = Format::new(Encoding::UInt, 16);
        assert!(plain.is_integral());
        assert_eq!(plain.effective_precision(), Some(0));

        let scaled = Format::new(Encoding::Int, 16).with_scale(0.01);
        assert!(!scaled.is_integral());
        assert_eq!(scaled.effective_precision(), Some(2));

        let float = Format::new(Encoding::Float, 32);
        assert_eq!(float.effective_precision(), None);
        assert_eq!(float.with_precision(3).effective_precision(), Some(3));
    }

    #[test]
    fn test_bit_extraction_rejected_on_float_and_string() {
        let float = Format::new(Encoding::Float, 32).with_bits(BitExtraction::Bit(0));
        assert!(matches!(
            float.validate("f"),
            Err(ConfigError::BitExtractionNotAllowed { .. })
        ));

        let text = Format::string(4).with_bits(BitExtraction::Mask(0xff));
        assert!(matches!(
            text.validate("s"),
            Err(ConfigError::BitExtractionNotAllowed { .. })
        ));
    }

    #[test]
    fn test_width_and_word_count_must_agree() {
        let mut format = Format::new(Encoding::UInt, 32);
        assert!(format.validate("x").is_ok());
        format.word_count = 1;
        assert!(format.validate("x").is_err());

        assert!(Format::new(Encoding::Float, 16).validate("x").is_err());
        assert!(Format::new(Encoding::Int, 48).validate("x").is_err());
        assert!(Format::new(Encoding::Int, 64).validate("x").is_ok());
    }

    #[test]
    fn test_bit_positions_checked_against_width() {
        let base = Format::new(Encoding::UInt, 16);
        assert!(base.clone().with_bits(BitExtraction::Bit(15)).validate("x").is_ok());
        assert!(base.clone().with_bits(BitExtraction::Bit(16)).validate("x").is_err());
        assert!(base
            .clone()
            .with_bits(BitExtraction::Range { start: 12, len: 4 })
            .validate("x")
            .is_ok());
        assert!(base
            .clone()
            .with_bits(BitExtraction::Range { start: 12, len: 5 })
            .validate("x")
            .is_err());
        assert!(base
            .clone()
            .with_bits(BitExtraction::Range { start: 0, len: 0 })
            .validate("x")
            .is_err());
        assert!(base.clone().with_bits(BitExtraction::Rotate(16)).validate("x").is_err());
    }

    #[test]
    fn test_zero_scale_rejected() {
        let format = Format::new(Encoding::UInt, 16).with_scale(0.0);
        assert!(format.validate("x").is_err());
    }

    #[test]
    fn test_precision_is_bounded() {
        let format = Format::new(Encoding::Float, 32).with_precision(MAX_PRECISION);
        assert!(format.validate("x").is_ok());
        let format = Format::new(Encoding::UInt, 16).with_precision(400);
        assert!(matches!(format.validate("x"), Err(ConfigError::InvalidFormat { .. })));

        let mut derived = RegisterDescriptor::derived("total", Derivation::Sum(vec!["a".into()]));
        derived.format.precision = Some(16);
        assert!(matches!(derived.validate(), Err(ConfigError::InvalidFormat { .. })));
    }

    #[test]
    fn test_address_range_and_overflow() {
        let reg = RegisterDescriptor::direct("x", 100, Bank::ReadOnly, Format::new(Encoding::UInt, 32));
        assert_eq!(reg.address_range(), Some((Bank::ReadOnly, 100, 102)));
        assert!(reg.validate().is_ok());

        let edge = RegisterDescriptor::direct("y", u16::MAX, Bank::ReadOnly, Format::new(Encoding::UInt, 32));
        assert!(matches!(edge.validate(), Err(ConfigError::AddressOverflow { .. })));
    }

    #[test]
    fn test_derived_register() {
        let reg = RegisterDescriptor::derived("total", Derivation::Sum(vec!["a".into(), "b".into()]));
        assert_eq!(reg.address_range(), None);
        assert!(!reg.is_writable());
        assert_eq!(reg.derivation().map(|d| d.sources()), Some(vec!["a", "b"]));
    }

    #[test]
    fn test_predicates() {
        assert!(Predicate::Positive.holds(1.0));
        assert!(!Predicate::Positive.holds(0.0));
        assert!(Predicate::Negative.holds(-0.5));
        assert!(Predicate::NonZero.holds(-3.0));
        assert!(Predicate::Above(10.0).holds(10.5));
        assert!(!Predicate::Below(10.0).holds(10.0));
    }

    #[test]
    fn test_derivation_from_yaml() {
        let parse = |yaml: &str| -> Derivation {
            serde_yaml::with::singleton_map_recursive::deserialize(
                serde_yaml::Deserializer::from_str(yaml),
            )
            .unwrap()
        };
        let yaml = "split:\n  source: battery_power\n  when: negative\n  sign: absolute\n";
        assert_eq!(
            parse(yaml),
            Derivation::Split {
                source: "battery_power".into(),
                when: Predicate::Negative,
                sign: Sign::Absolute,
            }
        );
        let yaml = "split:\n  source: grid\n  when:\n    above: 2.5\n";
        assert_eq!(
            parse(yaml),
            Derivation::Split {
                source: "grid".into(),
                when: Predicate::Above(2.5),
                sign: Sign::Keep,
            }
        );
    }
}
