pub mod ckan_http;
pub mod paged;
pub mod raw;

pub use ckan_http::CkanSqlClient;
pub use paged::{FetchError, PageClient, PageRequest, PagedSource, PagingConfig};
pub use raw::RawRecord;
