//! Typed Option Codec
//!
//! Converts tagged host values into the exact binary form a native
//! `options_set` call expects, and back for `options_get`.
//!
//! All validation happens before the native call: a value of the wrong kind,
//! out of range, or naming an unknown constant never reaches the transport.

use std::ffi::CString;
use std::fmt;

use tracing::debug;

use crate::error::BridgeError;
use crate::native::{option_id, NativePtr, NativeSsh, NativeValue, OwnedNativeValue, Socket};
use crate::symbols::{SymbolTable, LOG_VERBOSITY, SESSION_OPTIONS};
use crate::translate::{expect_ok, SessionDiagnostics};

/// An I/O port as the host sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPort {
    fd: Option<Socket>,
    open: bool,
}

impl HostPort {
    /// Open port backed by an OS descriptor
    pub fn file(fd: Socket) -> Self {
        Self { fd: Some(fd), open: true }
    }

    /// Open port with no descriptor (string or soft ports)
    pub fn virtual_port() -> Self {
        Self { fd: None, open: true }
    }

    pub fn closed(self) -> Self {
        Self { open: false, ..self }
    }

    pub fn fd(&self) -> Option<Socket> {
        self.fd
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}

/// A tagged value coming from, or going back to, the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostValue {
    Bool(bool),
    /// Host integers are unbounded; i128 covers every range we check
    Integer(i128),
    String(String),
    Symbol(String),
    Port(HostPort),
    Bytes(Vec<u8>),
}

impl HostValue {
    pub fn symbol(name: impl Into<String>) -> Self {
        HostValue::Symbol(name.into())
    }

    /// Name of the variant, used in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Bool(_) => "boolean",
            HostValue::Integer(_) => "integer",
            HostValue::String(_) => "string",
            HostValue::Symbol(_) => "symbol",
            HostValue::Port(_) => "port",
            HostValue::Bytes(_) => "bytevector",
        }
    }
}

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        HostValue::Bool(v)
    }
}

impl From<&str> for HostValue {
    fn from(v: &str) -> Self {
        HostValue::String(v.to_string())
    }
}

impl From<String> for HostValue {
    fn from(v: String) -> Self {
        HostValue::String(v)
    }
}

impl From<i64> for HostValue {
    fn from(v: i64) -> Self {
        HostValue::Integer(v.into())
    }
}

impl From<u64> for HostValue {
    fn from(v: u64) -> Self {
        HostValue::Integer(v.into())
    }
}

impl From<i128> for HostValue {
    fn from(v: i128) -> Self {
        HostValue::Integer(v)
    }
}

impl From<HostPort> for HostValue {
    fn from(v: HostPort) -> Self {
        HostValue::Port(v)
    }
}

/// How an option's value is encoded for the native setter
#[derive(Debug, Clone, Copy)]
pub enum ValueKind {
    String,
    UInt32,
    UInt64,
    Int32,
    Bool,
    PortFd,
    Constant(&'static SymbolTable),
}

impl PartialEq for ValueKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ValueKind::Constant(a), ValueKind::Constant(b)) => std::ptr::eq(*a, *b),
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::String => f.write_str("string"),
            ValueKind::UInt32 => f.write_str("unsigned 32-bit integer"),
            ValueKind::UInt64 => f.write_str("unsigned 64-bit integer"),
            ValueKind::Int32 => f.write_str("32-bit integer"),
            ValueKind::Bool => f.write_str("boolean"),
            ValueKind::PortFd => f.write_str("open file port"),
            ValueKind::Constant(table) => write!(f, "symbol from {}", table.name()),
        }
    }
}

/// Static record binding an option name to its native id and encoding
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptionDescriptor {
    pub symbol: &'static str,
    pub native_id: i32,
    pub kind: ValueKind,
}

impl OptionDescriptor {
    /// Resolve a session option by its mnemonic
    pub fn lookup(symbol: &str) -> Result<Self, BridgeError> {
        let mapping = SESSION_OPTIONS
            .lookup(symbol)
            .ok_or_else(|| BridgeError::UnknownOption(symbol.to_string()))?;
        Self::from_native_id(mapping.value)
    }

    /// Resolve a session option by native id
    pub fn from_native_id(native_id: i32) -> Result<Self, BridgeError> {
        let kind = value_kind(native_id).ok_or(BridgeError::UnsupportedOption(native_id))?;
        let symbol = SESSION_OPTIONS
            .reverse_lookup(native_id)
            .ok_or(BridgeError::UnsupportedOption(native_id))?;
        Ok(Self {
            symbol,
            native_id,
            kind,
        })
    }
}

/// Dispatch table: native option id -> value encoding
pub fn value_kind(native_id: i32) -> Option<ValueKind> {
    let kind = match native_id {
        option_id::PORT => ValueKind::UInt32,

        option_id::HOST
        | option_id::BINDADDR
        | option_id::USER
        | option_id::COMPRESSION
        | option_id::SSH_DIR
        | option_id::KNOWNHOSTS
        | option_id::IDENTITY
        | option_id::CIPHERS_C_S
        | option_id::CIPHERS_S_C
        | option_id::COMPRESSION_C_S
        | option_id::COMPRESSION_S_C
        | option_id::PROXYCOMMAND => ValueKind::String,

        option_id::LOG_VERBOSITY => ValueKind::Constant(&LOG_VERBOSITY),

        option_id::COMPRESSION_LEVEL => ValueKind::Int32,

        option_id::TIMEOUT | option_id::TIMEOUT_USEC => ValueKind::UInt64,

        option_id::SSH1 | option_id::SSH2 | option_id::STRICTHOSTKEYCHECK => ValueKind::Bool,

        option_id::FD => ValueKind::PortFd,

        _ => return None,
    };
    Some(kind)
}

/// Host value converted to its native form
///
/// Owns any intermediate buffer (the C string) for exactly as long as the
/// encoded value lives.
#[derive(Debug, PartialEq, Eq)]
pub enum EncodedValue {
    Str(CString),
    UInt32(u32),
    UInt64(u64),
    Int32(i32),
    Socket(Socket),
}

impl EncodedValue {
    pub fn as_native(&self) -> NativeValue<'_> {
        match self {
            EncodedValue::Str(s) => NativeValue::Str(s.as_c_str()),
            EncodedValue::UInt32(v) => NativeValue::UInt32(*v),
            EncodedValue::UInt64(v) => NativeValue::UInt64(*v),
            EncodedValue::Int32(v) => NativeValue::Int32(*v),
            EncodedValue::Socket(fd) => NativeValue::Socket(*fd),
        }
    }
}

fn mismatch(option: &OptionDescriptor, value: &HostValue) -> BridgeError {
    BridgeError::TypeMismatch {
        option: option.symbol.to_string(),
        expected: option.kind.to_string(),
        found: value.type_name(),
    }
}

fn in_range<T>(option: &OptionDescriptor, value: i128, min: T, max: T) -> Result<T, BridgeError>
where
    T: TryFrom<i128> + Into<i128> + Copy,
{
    T::try_from(value).map_err(|_| BridgeError::RangeError {
        option: option.symbol.to_string(),
        value,
        min: min.into(),
        max: max.into(),
    })
}

/// Validate and convert `value` for `option`
pub fn encode(option: &OptionDescriptor, value: &HostValue) -> Result<EncodedValue, BridgeError> {
    match (option.kind, value) {
        (ValueKind::String, HostValue::String(s)) => CString::new(s.as_str())
            .map(EncodedValue::Str)
            .map_err(|_| mismatch(option, value)),

        (ValueKind::UInt32, HostValue::Integer(v)) => {
            in_range(option, *v, u32::MIN, u32::MAX).map(EncodedValue::UInt32)
        }

        (ValueKind::UInt64, HostValue::Integer(v)) => {
            in_range(option, *v, u64::MIN, u64::MAX).map(EncodedValue::UInt64)
        }

        (ValueKind::Int32, HostValue::Integer(v)) => {
            in_range(option, *v, i32::MIN, i32::MAX).map(EncodedValue::Int32)
        }

        (ValueKind::Bool, HostValue::Bool(b)) => Ok(EncodedValue::Int32(i32::from(*b))),

        (ValueKind::PortFd, HostValue::Port(port)) => match port.fd() {
            Some(fd) if port.is_open() => Ok(EncodedValue::Socket(fd)),
            _ => Err(mismatch(option, value)),
        },

        (ValueKind::Constant(table), HostValue::Symbol(name)) => table
            .lookup(name)
            .map(|m| EncodedValue::Int32(m.value))
            .ok_or_else(|| BridgeError::UnknownConstant {
                option: option.symbol.to_string(),
                value: name.clone(),
            }),

        _ => Err(mismatch(option, value)),
    }
}

/// Convert a native option value back into a host value
pub fn decode(kind: ValueKind, value: OwnedNativeValue) -> HostValue {
    match (kind, value) {
        (ValueKind::Bool, OwnedNativeValue::Int32(v)) => HostValue::Bool(v != 0),
        (ValueKind::Constant(table), OwnedNativeValue::Int32(v)) => match table.reverse_lookup(v) {
            Some(symbol) => HostValue::symbol(symbol),
            None => HostValue::Integer(v.into()),
        },
        (_, OwnedNativeValue::Str(s)) => HostValue::String(s.to_string_lossy().into_owned()),
        (_, OwnedNativeValue::UInt32(v)) => HostValue::Integer(v.into()),
        (_, OwnedNativeValue::UInt64(v)) => HostValue::Integer(v.into()),
        (_, OwnedNativeValue::Int32(v)) => HostValue::Integer(v.into()),
        (_, OwnedNativeValue::Socket(fd)) => HostValue::Port(HostPort::file(fd)),
    }
}

/// Encode `value` and make exactly one native `options_set` call
pub fn set_option(
    native: &dyn NativeSsh,
    session: NativePtr,
    option: &OptionDescriptor,
    value: &HostValue,
) -> Result<(), BridgeError> {
    let encoded = encode(option, value)?;
    debug!("Setting option {} ({})", option.symbol, option.native_id);
    let status = native.options_set(session, option.native_id, encoded.as_native());
    // `encoded` (and any C string) is dropped here on both outcomes
    drop(encoded);
    expect_ok(status, "session-set!", &SessionDiagnostics::new(native, session))
}

/// Set an option addressed by native id
pub fn set_option_by_id(
    native: &dyn NativeSsh,
    session: NativePtr,
    native_id: i32,
    value: &HostValue,
) -> Result<(), BridgeError> {
    let option = OptionDescriptor::from_native_id(native_id)?;
    set_option(native, session, &option, value)
}

/// Read an option back as a host value
pub fn get_option(
    native: &dyn NativeSsh,
    session: NativePtr,
    option: &OptionDescriptor,
) -> Result<HostValue, BridgeError> {
    match native.options_get(session, option.native_id) {
        Ok(value) => Ok(decode(option.kind, value)),
        Err(code) => Err(BridgeError::Native {
            operation: "session-get",
            code,
            message: format!("Unable to get the value of '{}'", option.symbol),
        }),
    }
}
