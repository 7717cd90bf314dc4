pub mod app;
pub mod camera;
pub mod config;
pub mod dataset;
pub mod demux;
pub mod frame;
pub mod inference;
pub mod logging;
pub mod mesh;
pub mod protocol;
pub mod realtime;
pub mod record;
pub mod render;
pub mod responder;
pub mod runner;
pub mod throughput;
