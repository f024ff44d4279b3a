pub mod app;
pub mod config;
pub mod credentials;
pub mod error;
pub mod handlers;
pub mod model_map;
pub mod protocol;
pub mod session;
pub mod translator;
pub mod upstream;
