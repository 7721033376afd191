// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Integration Auth - per-user authentication for webhook integrations
//!
//! Each webhook integration talks to the messaging platform as its own
//! integration user. This crate keeps, for every such user, a dedicated TLS
//! transport and a rotating session/key-manager credential pair, and recovers
//! outbound calls that fail on an expired session.
//!
//! ## Modules
//!
//! - `auth` - Authentication proxy, per-user contexts, remote authenticators
//! - `client` - Call decorator attaching credentials and retrying once on 401
//! - `config` - Environment variables and the JSON configuration document
//! - `state` - Startup construction of the object graph
//! - `tls` - Transport factory (client certificates, timeouts, proxies)

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod state;
pub mod tls;

#[cfg(test)]
mod testutil;
