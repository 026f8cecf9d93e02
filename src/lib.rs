pub mod cli;
pub mod daemon;
pub mod errors;
pub mod jobs;
pub mod logbuffer;
pub mod models;
pub mod registry;
pub mod server;
pub mod service;
pub mod storage;
