pub mod event;
pub mod page;

pub use event::{Environment, TrackEvent};
pub use page::{PageHandle, PageInfo};
