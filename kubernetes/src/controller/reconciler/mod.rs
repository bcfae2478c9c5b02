pub mod discovery;
pub mod service_watcher;
