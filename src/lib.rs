pub mod config;
pub mod jail;
pub mod notify;
pub mod server;
pub mod shared;
pub mod utils;

pub use config::JailConfig;
pub use jail::{Address, BanStore, FailureLedger, Jail};
pub use server::JailServer;
