// ABOUTME: Port allocation and placeholder resolution
// ABOUTME: Turns a merged model into runtime-ready specs once every host port is known

pub mod placeholder;
pub mod ports;
pub mod resolver;

pub use ports::{PortAllocation, PortPool};
pub use resolver::{
    network_name, resolve, resolve_containers, resolve_images, runtime_name, ResolvedContainer,
    ResolvedEnvironment, ResolvedImage,
};
