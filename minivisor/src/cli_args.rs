// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! CLI argument parsing.
//!
//! Code in this module must not instantiate any VM objects. It is only
//! responsible for marshalling raw CLI strings into typed structs and for
//! the configuration validation the spec requires to happen before any
//! guest starts.

use crate::config::GuestConfig;
use crate::config::MAX_GUEST_PATH_LEN;
use crate::config::MAX_SHARED_PATH_LEN;
use crate::config::PageSize;
use crate::config::SIZE_2MB;
use anyhow::bail;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

/// Minimal multi-guest KVM hypervisor with a paravirtual console and file
/// gateway.
#[derive(Parser)]
pub struct Options {
    /// guest RAM size in MiB (2, 4 or 8)
    #[clap(short = 'm', long = "memory", value_name = "MIB", value_parser = parse_memory)]
    pub memory: usize,

    /// page granularity: 2 for 2 MiB pages, 4 for 4 KiB pages
    #[clap(short = 'p', long = "page", value_name = "SIZE", value_parser = parse_page)]
    pub page: PageSize,

    /// guest binary image, one per guest
    #[clap(
        short = 'g',
        long = "guest",
        value_name = "PATH",
        required = true,
        num_args = 1..
    )]
    pub guests: Vec<PathBuf>,

    /// shared file, readable by every guest
    #[clap(short = 'f', long = "file", value_name = "PATH", num_args = 1..)]
    pub files: Vec<String>,
}

fn parse_memory(s: &str) -> Result<usize, String> {
    match s {
        "2" => Ok(2 << 20),
        "4" => Ok(4 << 20),
        "8" => Ok(8 << 20),
        _ => Err("memory size must be 2, 4 or 8 MiB".to_string()),
    }
}

fn parse_page(s: &str) -> Result<PageSize, String> {
    match s {
        "2" => Ok(PageSize::Size2m),
        "4" => Ok(PageSize::Size4k),
        _ => Err("page size must be 2 (MiB) or 4 (KiB)".to_string()),
    }
}

/// Validates the options and expands them into one config per guest.
pub fn guest_configs(options: &Options) -> anyhow::Result<Vec<GuestConfig>> {
    // The accepted memory sizes are all page-directory aligned, but the
    // address space builder relies on it, so keep the check where the sizes
    // are decided.
    if options.memory % SIZE_2MB != 0 {
        bail!("memory size must be a multiple of 2 MiB");
    }
    for guest in &options.guests {
        if guest.as_os_str().len() > MAX_GUEST_PATH_LEN {
            bail!(
                "guest image path `{}` is longer than {} characters",
                guest.display(),
                MAX_GUEST_PATH_LEN
            );
        }
    }
    for file in &options.files {
        if file.len() > MAX_SHARED_PATH_LEN {
            bail!(
                "shared file path `{}` is longer than {} characters",
                file,
                MAX_SHARED_PATH_LEN
            );
        }
    }

    let shared_files = Arc::new(options.files.clone());
    Ok(options
        .guests
        .iter()
        .enumerate()
        .map(|(id, image_path)| GuestConfig {
            id: id as u32,
            memory_size: options.memory,
            page_size: options.page,
            image_path: image_path.clone(),
            shared_files: shared_files.clone(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::Options;
    use super::guest_configs;
    use crate::config::PageSize;
    use clap::Parser;

    fn parse(args: &[&str]) -> Options {
        Options::try_parse_from(std::iter::once("minivisor").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn parses_two_guests_with_shared_files() {
        let options = parse(&[
            "-m", "4", "-p", "2", "-g", "a.img", "b.img", "-f", "data.txt",
        ]);
        let configs = guest_configs(&options).unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].id, 0);
        assert_eq!(configs[1].id, 1);
        assert_eq!(configs[0].memory_size, 4 << 20);
        assert_eq!(configs[0].page_size, PageSize::Size2m);
        assert_eq!(*configs[1].shared_files, vec!["data.txt".to_string()]);
    }

    #[test]
    fn page_values_map_to_granularity() {
        assert_eq!(
            parse(&["-m", "2", "-p", "4", "-g", "a.img"]).page,
            PageSize::Size4k
        );
        assert_eq!(
            parse(&["-m", "2", "-p", "2", "-g", "a.img"]).page,
            PageSize::Size2m
        );
    }

    #[test]
    fn rejects_bad_memory_and_page_sizes() {
        assert!(
            Options::try_parse_from(["minivisor", "-m", "3", "-p", "2", "-g", "a.img"]).is_err()
        );
        assert!(
            Options::try_parse_from(["minivisor", "-m", "2", "-p", "1", "-g", "a.img"]).is_err()
        );
    }

    #[test]
    fn rejects_missing_guest() {
        assert!(Options::try_parse_from(["minivisor", "-m", "2", "-p", "2"]).is_err());
    }

    #[test]
    fn rejects_memory_not_page_directory_aligned() {
        // The parser cannot produce such a size; the check still guards
        // anything that constructs Options directly.
        let options = Options {
            memory: 3 << 20,
            page: PageSize::Size2m,
            guests: vec!["a.img".into()],
            files: vec![],
        };
        assert!(guest_configs(&options).is_err());
    }

    #[test]
    fn rejects_over_long_paths() {
        let long = "g".repeat(201);
        let options = parse(&["-m", "2", "-p", "2", "-g", &long]);
        assert!(guest_configs(&options).is_err());

        let long = "f".repeat(301);
        let options = parse(&["-m", "2", "-p", "2", "-g", "a.img", "-f", &long]);
        assert!(guest_configs(&options).is_err());
    }
}
