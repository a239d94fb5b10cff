// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod cfg;
pub mod cluster;
pub mod errors;
pub mod export;
pub mod lum;
pub mod models;
pub mod registry;
pub mod scsi;
pub mod target;
