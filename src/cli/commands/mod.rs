//! CLI command implementations

pub mod cat;
pub mod config;
pub mod lock;
pub mod put;
pub mod stat;

pub use cat::execute as cat;
pub use config::execute as config;
pub use lock::execute as lock;
pub use put::execute as put;
pub use stat::execute as stat;
