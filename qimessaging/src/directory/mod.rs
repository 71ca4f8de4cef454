//! Service directory and its client.
//!
//! The [`ServiceDirectory`] is the registry every process consults to turn a
//! service name into endpoints. It is itself served as service 1. Processes
//! reach it through a [`ServiceDirectoryClient`], either over a socket or,
//! when they host the directory, in-process.

mod client;
mod service;

pub use client::{ServiceDirectoryClient, ServiceDirectoryEvent};
pub use service::{SERVICE_DIRECTORY_NAME, ServiceDirectory, method};
