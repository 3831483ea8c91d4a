//! gRPC surface of the service: the generated bindings live in
//! [`crate::proto`]; this module adapts them onto [`OutputServiceNode`] and
//! maps core errors to status codes.

pub mod server;

pub use server::{OutputServiceGrpc, serve};
