mod admin;
mod app;
mod completion;
mod config;
mod embed;
mod engine;
mod error;
mod fixtures;
mod logging;
mod postgres;
mod proxy;
mod store;
mod types;
mod widget;
mod widget_socket;

#[tokio::main]
async fn main() {
    logging::init_tracing();

    if let Err(err) = app::run().await {
        tracing::error!(error = %err, "widget server stopped");
        std::process::exit(1);
    }
}
