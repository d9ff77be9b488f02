pub mod command;
pub mod consumer;
pub mod events;
pub mod manager;
pub mod metadata;
pub mod parse;
pub mod queue;
pub mod supervisor;
