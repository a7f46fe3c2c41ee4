pub mod artifacts;
pub mod database;
pub mod error;
pub mod memory;
pub mod row_helpers;
pub mod schema;
pub mod session;
pub mod sqlite;

pub use artifacts::{ArtifactScope, ArtifactService, InMemoryArtifactService};
pub use database::Database;
pub use error::StoreError;
pub use memory::InMemorySessionService;
pub use session::{GetSessionConfig, Session, SessionService};
pub use sqlite::SqliteSessionService;
