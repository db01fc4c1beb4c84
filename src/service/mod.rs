pub mod app_state;
pub mod bootstrap;
pub mod cache;
pub mod catalog;
pub mod chat_client;
pub mod crypto;
pub mod model_cache;
pub mod redis;
pub mod refresh;
pub mod registry;
pub mod relay;

#[cfg(test)]
pub mod mock_backend;
