//! Page cache, page formats, and free-space index.

pub mod page;
pub mod page_index;
pub mod pager;

pub use page_index::PageIndex;
pub use pager::{PageBuf, PageHandle, Pager};
