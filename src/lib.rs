pub mod auth;
pub mod checkout;
pub mod clients;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod limits;
pub mod maintenance;
pub mod model;
pub mod notify;
pub mod observability;
pub mod policy;
pub mod sql;
pub mod tls;
pub mod wal;
pub mod wire;
