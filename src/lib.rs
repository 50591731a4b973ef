pub mod api;
pub mod config;
pub mod errors;
pub mod lsp;
pub mod server;
pub mod ws;
