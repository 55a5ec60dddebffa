//! Agent orchestration core for a personal video and audio knowledge
//! assistant.
//!
//! Content from video platforms and podcasts is downloaded, transcribed,
//! analysed and indexed per tenant. Questions are answered by an agent that
//! plans, calls tools over the indexed library and the web, and cites what
//! it used. Models, prompts, tools and service backends are resolved per
//! tenant and user through the [`control_plane`].

pub mod agent;
pub mod app;
pub mod cli;
pub mod config;
pub mod context;
pub mod control_plane;
pub mod crypto;
pub mod db;
pub mod error;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod retrieval;
pub mod search;
pub mod tools;
pub mod watcher;

pub use app::{AppBuilder, AppContext};
pub use error::{Error, ErrorKind, Result};
