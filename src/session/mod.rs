pub mod file;
pub mod memory;
pub mod trait_def;

pub use file::FileSessionStore;
pub use memory::MemorySessionStore;
pub use trait_def::{SessionError, SessionStore};
