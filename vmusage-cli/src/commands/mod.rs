//! CLI command implementations

pub mod bucket;
pub mod cat;
pub mod compact;
pub mod get_usage;

pub use bucket::bucket;
pub use cat::cat;
pub use compact::compact;
pub use get_usage::get_usage;
