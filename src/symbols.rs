//! Symbol <-> native constant tables
//!
//! Static, immutable mappings between the mnemonic symbols a host uses and the
//! integer constants the native transport expects. Tables are small (a couple
//! dozen entries at most), so lookups are a linear scan.

use crate::native::{key_type, log_level, option_id};

/// One symbol/constant pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolMapping {
    pub symbol: &'static str,
    pub value: i32,
}

const fn map(symbol: &'static str, value: i32) -> SymbolMapping {
    SymbolMapping { symbol, value }
}

/// A named, read-only symbol table
#[derive(Debug)]
pub struct SymbolTable {
    name: &'static str,
    entries: &'static [SymbolMapping],
}

impl SymbolTable {
    pub const fn new(name: &'static str, entries: &'static [SymbolMapping]) -> Self {
        Self { name, entries }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Find the mapping for `symbol`
    pub fn lookup(&self, symbol: &str) -> Option<&'static SymbolMapping> {
        self.entries.iter().find(|m| m.symbol == symbol)
    }

    /// Find the symbol for a native constant
    pub fn reverse_lookup(&self, value: i32) -> Option<&'static str> {
        self.entries
            .iter()
            .find(|m| m.value == value)
            .map(|m| m.symbol)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &'static str> {
        self.entries.iter().map(|m| m.symbol)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Session options
pub static SESSION_OPTIONS: SymbolTable = SymbolTable::new("session-options", SESSION_OPTION_ENTRIES);

const SESSION_OPTION_ENTRIES: &[SymbolMapping] = &[
    map("host", option_id::HOST),
    map("port", option_id::PORT),
    map("fd", option_id::FD),
    map("bindaddr", option_id::BINDADDR),
    map("user", option_id::USER),
    map("ssh-dir", option_id::SSH_DIR),
    map("identity", option_id::IDENTITY),
    map("knownhosts", option_id::KNOWNHOSTS),
    map("timeout", option_id::TIMEOUT),
    map("timeout-usec", option_id::TIMEOUT_USEC),
    map("ssh1", option_id::SSH1),
    map("ssh2", option_id::SSH2),
    map("log-verbosity", option_id::LOG_VERBOSITY),
    map("ciphers-c-s", option_id::CIPHERS_C_S),
    map("ciphers-s-c", option_id::CIPHERS_S_C),
    map("compression-c-s", option_id::COMPRESSION_C_S),
    map("compression-s-c", option_id::COMPRESSION_S_C),
    map("proxycommand", option_id::PROXYCOMMAND),
    map("stricthostkeycheck", option_id::STRICTHOSTKEYCHECK),
    map("compression", option_id::COMPRESSION),
    map("compression-level", option_id::COMPRESSION_LEVEL),
];

/// Values accepted by the `log-verbosity` option
pub static LOG_VERBOSITY: SymbolTable = SymbolTable::new("log-verbosity", LOG_VERBOSITY_ENTRIES);

const LOG_VERBOSITY_ENTRIES: &[SymbolMapping] = &[
    map("nolog", log_level::NOLOG),
    map("rare", log_level::RARE),
    map("protocol", log_level::PROTOCOL),
    map("packet", log_level::PACKET),
    map("functions", log_level::FUNCTIONS),
];

/// Key algorithms as reported by the native layer
pub static KEY_TYPES: SymbolTable = SymbolTable::new("key-types", KEY_TYPE_ENTRIES);

const KEY_TYPE_ENTRIES: &[SymbolMapping] = &[
    map("unknown", key_type::UNKNOWN),
    map("dss", key_type::DSS),
    map("rsa", key_type::RSA),
    map("rsa1", key_type::RSA1),
    map("ecdsa", key_type::ECDSA),
    map("ed25519", key_type::ED25519),
];
