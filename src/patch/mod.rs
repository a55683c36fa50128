/*
 * SPDX-FileCopyrightText: 2024-2026 bootpatch contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

pub mod install;
pub mod rebrand;
pub mod session;
pub mod shell;
