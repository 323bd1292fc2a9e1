//! Typed SQL commands, executed through [`crate::framework::DatabaseProcessor`].

pub mod cursor;
pub mod dedup_record;
