pub mod cmd;
pub mod controller;

pub use cmd::run;
