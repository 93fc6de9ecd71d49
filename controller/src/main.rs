mod actuator;
mod auth;
mod client;
mod controller;
mod error;
mod host;
mod remote;
mod token_store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
