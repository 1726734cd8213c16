//! Langbase Pipes integration.
//!
//! [`LangbaseClient`] speaks the HTTP API; [`LangbaseGenerator`] maps the
//! pipeline's three text-generation calls onto configured pipes.

mod client;
mod generator;
mod types;

pub use client::LangbaseClient;
pub use generator::{
    GenerateQueriesRequest, LangbaseGenerator, Pass1Request, Pass2Request, TextGenerator,
};
pub use types::*;
