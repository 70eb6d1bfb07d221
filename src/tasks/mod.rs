//! Background tasks

pub mod flush;
pub mod retention;
