mod error;
mod file;
mod memory;
mod paths;
mod schema;
mod storage;

pub use error::SessionStoreError;
pub use file::FileSessionStorage;
pub use memory::MemorySessionStorage;
pub use paths::{session_file_name, session_root, validate_session_id};
pub use schema::{now_rfc3339, SessionSnapshot, SNAPSHOT_VERSION};
pub use storage::SessionStorage;
