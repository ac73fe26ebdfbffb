//! Luma core types: values, strings, tables, and arena storage.

pub mod gc;
pub mod object;
pub mod string;
pub mod table;
pub mod value;
