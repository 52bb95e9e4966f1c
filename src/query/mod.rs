pub mod error;
pub mod executor;
pub mod operators;
pub mod plan;

pub use error::QueryError;
pub use executor::{PageLimits, QueryPage, WindowPage};
pub use plan::{Filter, QuerySpec, SearchSpec, SortColumn, SortSpec};
