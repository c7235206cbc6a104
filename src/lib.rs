pub mod config;
pub mod controller;
pub mod dashboard;
pub mod error;
pub mod manager;
pub mod model;
pub mod scheduler;
pub mod shutdown;
pub mod store;
