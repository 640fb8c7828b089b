//! Generated protobuf definitions for the agent API.
//!
//! This crate provides both client and server implementations of the control
//! protocol between the orchestrator and sandbox VM agents.

#[allow(non_camel_case_types)]
pub mod agent_api_pb {
    tonic::include_proto!("agent_api_pb");
}

pub mod descriptor {
    pub const AGENT_API_FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("agent_api_descriptor");
}
