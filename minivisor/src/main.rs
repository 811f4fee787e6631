// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Minimal multi-guest KVM hypervisor with a paravirtual console and file
//! gateway. One thread per guest, joined before exit; a failed guest never
//! affects its siblings.

mod cli_args;
mod config;
mod fileproto;
mod loader;
mod tracing_init;
mod vfs;
mod worker;
mod x86;

use anyhow::Context as _;
use clap::Parser;
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    tracing_init::enable_tracing()?;

    let options = cli_args::Options::parse();
    let configs = cli_args::guest_configs(&options)?;

    let kvm = Arc::new(kvm::Kvm::new().context("is the kvm module loaded?")?);
    let claims = Arc::new(vfs::WriteClaims::new());

    let mut guests = Vec::new();
    for config in configs {
        let kvm = kvm.clone();
        let claims = claims.clone();
        let thread = std::thread::Builder::new()
            .name(format!("guest-{}", config.id))
            .spawn(move || {
                let id = config.id;
                tracing::info!(
                    guest = id,
                    image = %config.image_path.display(),
                    "starting guest"
                );
                match worker::run_guest(&kvm, &config, claims) {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::error!(guest = id, "guest failed: {:#}", err);
                        false
                    }
                }
            })
            .context("failed to spawn guest thread")?;
        guests.push(thread);
    }

    let mut clean = true;
    for guest in guests {
        clean &= guest.join().unwrap_or(false);
    }
    tracing::info!("all guests finished");
    if !clean {
        std::process::exit(1);
    }
    Ok(())
}
