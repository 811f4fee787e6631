// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-guest pipeline: VM bring-up, image load, and the exit dispatch
//! loop. Everything here is local to one guest; the only cross-guest state
//! is the shared write-claim registry threaded into the file system.

use crate::config::GuestConfig;
use crate::fileproto::FilePort;
use crate::loader;
use crate::vfs::GuestFs;
use crate::vfs::WriteClaims;
use crate::x86;
use anyhow::Context as _;
use anyhow::bail;
use std::io::Read as _;
use std::io::Write as _;
use std::sync::Arc;

/// Character console: OUT prints to host stdout, IN blocks on host stdin.
pub const CONSOLE_PORT: u16 = 0x00e9;
/// The paravirtual file protocol.
pub const FILE_PORT: u16 = 0x0278;

/// Runs one guest to completion.
pub fn run_guest(
    kvm: &kvm::Kvm,
    config: &GuestConfig,
    claims: Arc<WriteClaims>,
) -> anyhow::Result<()> {
    let mut vm = kvm
        .new_vm(config.memory_size)
        .context("failed to create the VM")?;

    let mut sregs = vm.get_sregs().context("failed to read initial sregs")?;
    x86::build_page_tables(vm.memory_mut(), config.page_size);
    x86::enter_long_mode(&mut sregs);
    vm.set_sregs(&sregs).context("failed to set sregs")?;

    let regs = kvm::kvm_regs {
        rip: 0,
        rsp: config.memory_size as u64,
        rflags: 2,
        ..Default::default()
    };
    vm.set_regs(&regs).context("failed to set registers")?;

    let loaded = loader::load_image(&config.image_path, vm.memory_mut())?;
    tracing::info!(guest = config.id, bytes = loaded, "guest image loaded");

    let fs = GuestFs::new(config.id, &config.shared_files, claims);
    let mut file_port = FilePort::new(config.id, fs);

    loop {
        match vm.run().context("failed to run the vCPU")? {
            kvm::Exit::IoOut {
                port: CONSOLE_PORT,
                data,
            } => {
                let mut stdout = std::io::stdout().lock();
                // A broken stdout only loses console bytes.
                let _ = stdout.write_all(data).and_then(|()| stdout.flush());
            }
            kvm::Exit::IoIn {
                port: CONSOLE_PORT,
                data,
            } => {
                let mut stdin = std::io::stdin().lock();
                for slot in data.iter_mut() {
                    let mut byte = [0u8; 1];
                    // Closed stdin delivers NUL rather than blocking the
                    // guest on an error loop.
                    *slot = match stdin.read(&mut byte) {
                        Ok(1) => byte[0],
                        _ => 0,
                    };
                }
            }
            kvm::Exit::IoOut {
                port: FILE_PORT,
                data,
            } => {
                for &byte in data.iter() {
                    file_port.guest_write(byte);
                }
            }
            kvm::Exit::IoIn {
                port: FILE_PORT,
                data,
            } => {
                for slot in data.iter_mut() {
                    *slot = file_port.guest_read();
                }
            }
            kvm::Exit::IoOut { port, .. } | kvm::Exit::IoIn { port, .. } => {
                tracing::debug!(guest = config.id, port, "access to an unhandled I/O port");
            }
            kvm::Exit::Hlt => {
                tracing::info!(guest = config.id, "guest halted");
                return Ok(());
            }
            kvm::Exit::Shutdown => bail!("guest requested shutdown"),
            kvm::Exit::InternalError { error } => {
                bail!("internal error {error:#x}")
            }
            kvm::Exit::Other { reason } => bail!("unhandled exit reason {reason}"),
        }
    }
}
