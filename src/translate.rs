//! Result/Error Translator
//!
//! Maps native status codes onto one closed result enum per operation
//! family. The vocabularies are separate types, so a connect can never
//! report a known-hosts state and vice versa. Codes that do not map
//! explicitly are treated as errors.

use std::fmt;

use serde::Serialize;

use crate::error::BridgeError;
use crate::native::{server_known, NativePtr, NativeSsh, SSH_AGAIN, SSH_OK};

/// Fallback used when the native layer reports an error without a message
const UNKNOWN_ERROR: &str = "Unknown error (no diagnostic available)";

/// Source of the native diagnostic for the failing call
pub trait Diagnostics {
    fn last_error(&self) -> String;
}

/// Diagnostics of one native session
pub struct SessionDiagnostics<'a> {
    native: &'a dyn NativeSsh,
    session: NativePtr,
}

impl<'a> SessionDiagnostics<'a> {
    pub fn new(native: &'a dyn NativeSsh, session: NativePtr) -> Self {
        Self { native, session }
    }
}

impl Diagnostics for SessionDiagnostics<'_> {
    fn last_error(&self) -> String {
        self.native.get_error(self.session)
    }
}

/// Fixed diagnostic, for calls that have no session to ask
impl Diagnostics for &str {
    fn last_error(&self) -> String {
        self.to_string()
    }
}

/// Non-empty diagnostic text
pub fn diagnostic(ctx: &dyn Diagnostics) -> String {
    let message = ctx.last_error();
    if message.trim().is_empty() {
        UNKNOWN_ERROR.to_string()
    } else {
        message
    }
}

fn native_error(code: i32, operation: &'static str, ctx: &dyn Diagnostics) -> BridgeError {
    BridgeError::Native {
        operation,
        code,
        message: diagnostic(ctx),
    }
}

/// Outcome of `connect`; errors are raised instead
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectResult {
    Ok,
    Again,
}

impl ConnectResult {
    pub fn symbol(&self) -> &'static str {
        match self {
            ConnectResult::Ok => "ok",
            ConnectResult::Again => "again",
        }
    }
}

/// Outcome of `blocking_flush`; never raised
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlushResult {
    Ok,
    Again,
    Error(String),
}

impl FlushResult {
    pub fn symbol(&self) -> &'static str {
        match self {
            FlushResult::Ok => "ok",
            FlushResult::Again => "again",
            FlushResult::Error(_) => "error",
        }
    }
}

/// Trust state of the server key against known_hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerTrust {
    Ok,
    KnownChanged,
    FoundOther,
    NotKnown,
    FileNotFound,
}

impl ServerTrust {
    pub fn symbol(&self) -> &'static str {
        match self {
            ServerTrust::Ok => "ok",
            ServerTrust::KnownChanged => "known-changed",
            ServerTrust::FoundOther => "found-other",
            ServerTrust::NotKnown => "not-known",
            ServerTrust::FileNotFound => "file-not-found",
        }
    }
}

macro_rules! display_symbol {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.symbol())
            }
        })*
    };
}

display_symbol!(ConnectResult, FlushResult, ServerTrust);

pub fn translate_connect(code: i32, ctx: &dyn Diagnostics) -> Result<ConnectResult, BridgeError> {
    match code {
        SSH_OK => Ok(ConnectResult::Ok),
        SSH_AGAIN => Ok(ConnectResult::Again),
        _ => Err(native_error(code, "connect!", ctx)),
    }
}

pub fn translate_flush(code: i32, ctx: &dyn Diagnostics) -> FlushResult {
    match code {
        SSH_OK => FlushResult::Ok,
        SSH_AGAIN => FlushResult::Again,
        _ => FlushResult::Error(diagnostic(ctx)),
    }
}

pub fn translate_server_known(code: i32, ctx: &dyn Diagnostics) -> Result<ServerTrust, BridgeError> {
    match code {
        server_known::KNOWN_OK => Ok(ServerTrust::Ok),
        server_known::KNOWN_CHANGED => Ok(ServerTrust::KnownChanged),
        server_known::FOUND_OTHER => Ok(ServerTrust::FoundOther),
        server_known::NOT_KNOWN => Ok(ServerTrust::NotKnown),
        server_known::FILE_NOT_FOUND => Ok(ServerTrust::FileNotFound),
        _ => Err(native_error(code, "authenticate-server", ctx)),
    }
}

/// Anything but `SSH_OK` raises
pub fn expect_ok(code: i32, operation: &'static str, ctx: &dyn Diagnostics) -> Result<(), BridgeError> {
    if code == SSH_OK {
        Ok(())
    } else {
        Err(native_error(code, operation, ctx))
    }
}
