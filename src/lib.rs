pub mod agents;
pub mod approval;
pub mod config;
pub mod errors;
pub mod llm;
pub mod orchestrator;
pub mod phase;
pub mod server;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;
