pub mod blocks;
pub mod buffer;
pub mod config;
pub mod error;
pub mod http_client;
pub mod model;
pub mod normalizer;
pub mod prettify;
pub mod registry;
pub mod relay;
pub mod server;
pub mod stream;
pub mod telemetry;
pub mod upstream;

#[cfg(test)]
mod test_upstream;
