//! Crate-wide error types.
//!
//! `NmStatus` carries the network-management failure codes from spec.md
//! §7; `LtError` is the catch-all for everything else (codec, transport,
//! persistence). Handlers in [`crate::netmgmt`] return `Result<_, NmStatus>`
//! so the dispatcher can map failures straight onto a wire response.

use thiserror::Error;

/// Network-management level failure reasons (spec.md §7 "Parameter
/// errors" / "Authentication errors" / "Persistence errors" plus the
/// app-level escapes that are not really errors from the stack's point
/// of view).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmStatus {
    InvalidParameter,
    NvLengthMismatch,
    InvalidAddrTableIndex,
    InvalidNvIndex,
    InvalidDomain,
    AuthenticationMismatch,
    EepromWriteFailure,
    CnfgCsError,
    NoResources,
    NotImplemented,
    EndOfEnumeration,
    OwnerDoesNotExist,
    /// Not an error: forward the whole APDU to the application layer.
    AppMessage,
    /// Not an error: suppress any reply (e.g. blackout, query that
    /// doesn't qualify).
    NotQualified,
}

impl NmStatus {
    /// The low 5 bits placed in an `NM_FAIL` response, per spec.md §6
    /// ("failure = (request & 0x1F)") combined with the ECS/EXPANDED
    /// first-payload-byte error enum used by `processExtendedCommand`.
    pub fn ecs_error_code(self) -> u8 {
        match self {
            NmStatus::InvalidParameter => 1,
            NmStatus::NvLengthMismatch => 2,
            NmStatus::InvalidAddrTableIndex => 3,
            NmStatus::InvalidNvIndex => 4,
            NmStatus::InvalidDomain => 5,
            NmStatus::AuthenticationMismatch => 6,
            NmStatus::EepromWriteFailure => 7,
            NmStatus::CnfgCsError => 8,
            NmStatus::NoResources => 9,
            NmStatus::NotImplemented => 10,
            NmStatus::EndOfEnumeration => 11,
            NmStatus::OwnerDoesNotExist => 12,
            NmStatus::AppMessage | NmStatus::NotQualified => 0,
        }
    }
}

/// The single-byte persisted error log (`LtErrorType`, decimal 128-164
/// per spec.md §6). Only the values this crate actually raises are
/// named; the rest of the documented range is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LtErrorLog {
    NoError = 0,
    /// `CNFG_CS_ERROR`: a config-relative write landed without a
    /// checksum recompute and the node had to go unconfigured.
    CnfgCsError = 0x99,
    EepromWriteFailure = 0x98,
    SoftwareError = 0x80,
}

/// Errors below the network-management layer: link I/O, SICB framing,
/// table storage, persistence.
#[derive(Debug, Error)]
pub enum LtError {
    #[error("link queue full")]
    QueueFull,
    #[error("link operation timed out")]
    Timeout,
    #[error("link reset in progress")]
    Reset,
    #[error("comm port initialization failed: {0}")]
    CommPortInitFailure(String),
    #[error("malformed SICB: {0}")]
    Sicb(#[from] crate::link::sicb::SicbError),
    #[error("table error: {0}")]
    Table(#[from] TableError),
    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),
    #[error("network management failure: {0:?}")]
    NetMgmt(NmStatus),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by [`crate::tables::ConfigurationEntity`] implementations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    #[error("index out of range")]
    IndexOutOfRange,
    #[error("length mismatch")]
    LengthMismatch,
    #[error("unrecognized entry type tag")]
    BadTypeTag,
    #[error("table is full")]
    TableFull,
}

impl From<TableError> for NmStatus {
    fn from(e: TableError) -> Self {
        match e {
            TableError::IndexOutOfRange => NmStatus::InvalidAddrTableIndex,
            TableError::LengthMismatch => NmStatus::NvLengthMismatch,
            TableError::BadTypeTag => NmStatus::InvalidParameter,
            TableError::TableFull => NmStatus::NoResources,
        }
    }
}

/// Errors from the persistence backend seam (spec.md §1: "the
/// persistence backend ... the core asks for read/write/commit only").
#[derive(Debug, Error, Clone)]
pub enum PersistError {
    #[error("backend read failed: {0}")]
    Read(String),
    #[error("backend write failed: {0}")]
    Write(String),
    #[error("backend commit failed: {0}")]
    Commit(String),
}
