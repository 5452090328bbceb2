//! Shared foundation for the ship agent runtime: configuration, error codes,
//! the persisted turn/meta data model, the on-disk layout, and the
//! request-scoped context record threaded through every run.

pub mod config;
pub mod error;
pub mod paths;
pub mod request;
pub mod types;

pub use config::ShipConfig;
pub use error::{CoreError, Result};
pub use paths::{ContextDirs, ShipPaths};
pub use request::RequestContext;
pub use types::{
    ContextMeta, InboundMessage, Kind, Part, Role, Source, SourceRange, TurnMessage, TurnMetadata,
};
