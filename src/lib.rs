pub mod assets;
pub mod capture;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod pipeline;
pub mod session;
pub mod utils;
