//! Model boundary
//!
//! This module provides:
//! - Typed stage requests (`StageRequest`)
//! - The `ModelClient` trait and an HTTP implementation
//! - `ProposalGateway`: schema validation with bounded retries

mod client;
mod gateway;
mod types;

pub use client::{HttpModelClient, HttpModelConfig, ModelClient};
pub use gateway::{GatewayConfig, GatewayStats, ProposalGateway};
pub use types::StageRequest;
