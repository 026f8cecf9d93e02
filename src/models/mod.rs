pub mod config;
pub mod job;
pub mod runner;
pub mod stream;
pub mod terminal;

pub use config::ServerConfig;
pub use job::{Job, JobState, NewJob, Operation, ResourceRef, Scope, TargetRunner};
pub use runner::{ConfigVar, Runner};
pub use stream::{
    GetJobStreamResponse, RunnerConfigRequest, RunnerConfigResponse, RunnerJobStreamRequest,
    RunnerJobStreamResponse,
};
pub use terminal::{TerminalEvent, TerminalEventKind};
