pub mod config;
pub mod error;
pub mod feedback;
pub mod feedback_agent;
pub mod ident;
pub mod listener;
pub mod metrics;
pub mod notification;
pub mod push_agent;
pub mod queue;
pub mod tls;
pub mod token;
pub mod wire;
pub mod window;
