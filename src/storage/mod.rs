pub mod index;
pub mod search;
pub mod sort;
pub mod table;
