//! Error types
//!
//! Configuration errors are fatal for the device they belong to. Everything
//! else is recovered locally and surfaces as a status in the value store.

use crate::register::Bank;

/// Load-time configuration errors. A device with any of these is not scheduled.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("register `{0}` is defined more than once")]
    DuplicateName(String),
    #[error("register `{0}` has both an address and a derivation")]
    AddressAndDerivation(String),
    #[error("register `{0}` has neither an address nor a derivation")]
    NoSource(String),
    #[error("register `{0}` has no bank")]
    MissingBank(String),
    #[error("register `{name}`: {reason}")]
    InvalidFormat { name: String, reason: String },
    #[error("register `{name}`: bit extraction is not valid on {encoding} encoding")]
    BitExtractionNotAllowed { name: String, encoding: &'static str },
    #[error("registers `{first}` and `{second}` overlap in the {bank} bank")]
    Overlap {
        first: String,
        second: String,
        bank: Bank,
    },
    #[error("register `{name}` extends past the end of the address space")]
    AddressOverflow { name: String },
    #[error("derived register `{name}` references unknown register `{source_name}`")]
    UnknownSource { name: String, source_name: String },
    #[error("derivation cycle involving {0:?}")]
    DerivationCycle(Vec<String>),
    #[error("value map key `{key}` of register `{name}` is not an integer")]
    InvalidMapKey { name: String, key: String },
    #[error("`{0}` must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Failures of a single transport round-trip.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("device responded with exception: {0}")]
    Exception(String),
    #[error("transport error: {0}")]
    Protocol(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("expected {expected} words, got {actual}")]
    ShortResponse { expected: usize, actual: usize },
    #[error("the {0} bank is not writable")]
    ReadOnlyBank(Bank),
    #[error("transport has been released")]
    Closed,
}

/// Raw words that could not be turned into a typed value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("expected {expected} words, got {actual}")]
    WordCount { expected: usize, actual: usize },
    #[error("non-ASCII byte 0x{0:02x} in string")]
    NonAscii(u8),
    #[error("float bit pattern is not a finite number")]
    NotFinite,
}

/// A value that cannot be encoded into words for a write.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EncodeError {
    #[error("expected a {expected} value")]
    WrongType { expected: &'static str },
    #[error("value {value} is out of range for the register")]
    OutOfRange { value: f64 },
    #[error("string of {len} bytes does not fit into {capacity} bytes")]
    StringTooLong { len: usize, capacity: usize },
    #[error("string contains non-ASCII characters")]
    NonAscii,
    #[error("current register contents are required for a partial write")]
    MissingCurrent,
}

/// Errors returned to consumers writing a register.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("unknown device `{0}`")]
    UnknownDevice(String),
    #[error("unknown register `{0}`")]
    UnknownRegister(String),
    #[error("register `{0}` is not writable")]
    NotWritable(String),
    #[error("device `{0}` is shutting down")]
    Draining(String),
    #[error("could not encode value for `{name}`")]
    Encode {
        name: String,
        #[source]
        source: EncodeError,
    },
    #[error("reading current contents of `{name}` failed")]
    ReadBack {
        name: String,
        #[source]
        source: TransportError,
    },
    #[error("writing `{name}` failed")]
    Transport {
        name: String,
        #[source]
        source: TransportError,
    },
}
