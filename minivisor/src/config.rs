// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-guest configuration, produced by CLI parsing and read-only for the
//! lifetime of a guest's thread.

use std::path::PathBuf;
use std::sync::Arc;

pub const SIZE_4KB: usize = 0x1000;
pub const SIZE_2MB: usize = 0x20_0000;

/// Longest accepted guest image path, in bytes.
pub const MAX_GUEST_PATH_LEN: usize = 200;
/// Longest accepted shared file path, in bytes. This is also the guest-side
/// convention for the longest filename on the wire.
pub const MAX_SHARED_PATH_LEN: usize = 300;

/// Leaf granularity of the guest's identity-mapped address space.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PageSize {
    Size4k,
    Size2m,
}

/// Everything one guest needs to boot and run.
#[derive(Debug, Clone)]
pub struct GuestConfig {
    pub id: u32,
    pub memory_size: usize,
    pub page_size: PageSize,
    pub image_path: PathBuf,
    /// Shared file names, common to all guests and never mutated after
    /// startup.
    pub shared_files: Arc<Vec<String>>,
}
