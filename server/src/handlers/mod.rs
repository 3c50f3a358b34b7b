//! HTTP request handlers for the CoachCall server

pub mod health;
pub mod recordings;
pub mod websocket;
