//! Resource strategies, remote gateways and CSV boundary I/O.

pub mod csv_io;
pub mod gateway;
pub mod memory;
pub mod resources;

pub use csv_io::{
    read_headers, read_rows, read_rows_from, CsvExportWriter, CsvInput, FieldMapping,
    MappingError,
};
pub use gateway::{
    created_id, DeleteOutcome, HttpGateway, LinkOutcome, RemoteGateway, DEFAULT_PAGE_LIMIT,
};
pub use memory::{InMemoryRemote, RemoteCall, StoredRecord};
pub use resources::{
    strategy_for, CompanyStrategy, EntityStrategy, Envelope, FieldKind, FieldSpec, FieldTarget,
    MatchStrategy, NoteStrategy, ResourceStrategy, StrategyError, WritePlan,
};

pub const CRATE_NAME: &str = "rowsync-adapters";
