//! Core infrastructure for inflight.
//!
//! This module contains the fundamental building blocks:
//! - Block and BlockTable for the paged KV cache
//! - BlockPool for reference-counted block allocation
//! - CacheManager for per-request, per-beam block accounting
//! - Request for tracking a single inference request

pub mod block;
pub mod block_pool;
pub mod cache_manager;
pub mod request;
