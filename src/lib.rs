pub mod checkpoint;
pub mod dag;
pub mod errors;
pub mod evidence;
pub mod init;
pub mod marshal_config;
pub mod orchestrator;
pub mod patterns;
pub mod phase;
pub mod poller;
pub mod recovery;
pub mod telemetry;
pub mod tracker;
pub mod ui;
pub mod worker;
