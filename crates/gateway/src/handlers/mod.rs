//! API handlers module

pub mod deliverables;
pub mod documents;
pub mod health;
pub mod projects;
pub mod prompts;
pub mod sections;
pub mod templates;
