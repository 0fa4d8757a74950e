pub mod bus;
pub mod config;
pub mod db;
pub mod error;
pub mod messages;
pub mod model;
pub mod store;

pub use bus::{Bus, Channel};
pub use config::ServiceConfig;
pub use db::CatalystDb;
pub use error::{CatalystError, ErrorKind, Result};
