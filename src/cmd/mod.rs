pub mod agent;
pub mod assistants;
pub mod auth;
pub mod chat;
pub mod responses;
