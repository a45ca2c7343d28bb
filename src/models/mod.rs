//! Domain model module declarations.

pub mod job;
pub mod page;
pub mod progress;
pub mod script;
pub mod session;
pub mod test_result;
