pub mod collector;
pub mod payload;
pub mod record;

pub use collector::Collector;
pub use record::ViolationRecord;
