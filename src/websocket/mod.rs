//! WebSocket module for exchange stream connections

mod client;

pub use client::WebSocketClient;
