//! The generated `agent.v1` protocol types.

#[allow(clippy::all, missing_docs, clippy::missing_docs_in_private_items)]
mod generated {
    include!(concat!(env!("OUT_DIR"), "/agent.v1.rs"));
}

pub use generated::*;
