//! Adaptive RPC layer: call tracking, deadlines and the UDP server.

pub mod call;
pub mod server;
pub mod timeout_sampler;

pub use call::{CallState, RpcCall, TaskId};
pub use server::{CallEvent, CallMatch, RpcServer, RpcStats};
pub use timeout_sampler::TimeoutSampler;
