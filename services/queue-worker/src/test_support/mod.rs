pub mod env;
pub mod logs;
