// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Batch Archiver Engine
//!
//! This library implements the migration orchestration engine: a durable
//! state machine advanced by six independent, idempotent phase workers
//! (lock-admission, pack/unpack, transfer, monitor, verify, tidy),
//! coordinated through a lease-based per-migration lock and a same-target
//! ordering rule. Workers share no memory; all coordination happens
//! through the persisted migration store.

pub mod backend;
pub mod config;
pub mod lock;
pub mod pack;
pub mod store;
pub mod workers;
