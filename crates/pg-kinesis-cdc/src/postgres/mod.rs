//! PostgreSQL side of the bridge: connection parameters, the replication
//! protocol client, and the `test_decoding` output parser.

pub mod client;
pub mod decode;
pub mod params;

pub use client::{ReplicationClient, ReplicationFrame, ReplicationStream};
pub use decode::{parse_columns, parse_prelude, DecodeError, Prelude, RowPrelude};
pub use params::ConnectParams;
