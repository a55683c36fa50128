/*
 * SPDX-FileCopyrightText: 2024-2026 bootpatch contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

pub mod axml;
pub mod container;
pub mod padding;
pub mod payload;
