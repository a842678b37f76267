// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`lodge-core`)
//!
//! HTTP surface that translates external requests into application service
//! calls. Operation channels are upgraded here and handed to the registry.
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`api`] | HTTP/WebSocket (Axum) | REST endpoints under `/1.0` and channel upgrades |

pub mod api;
