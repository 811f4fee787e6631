// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Minimal safe wrapper over the Linux KVM device, covering exactly what a
//! single-vCPU flat-binary guest needs: VM and vCPU creation, one guest
//! memory slot at guest physical 0, register state access, and decode of
//! the exits the run loop dispatches on.

#![cfg(target_os = "linux")]
// UNSAFETY: Calling KVM APIs and IOCTLs and dealing with the raw pointers
// necessary for doing so.
#![expect(unsafe_code)]

pub use kvm_bindings::*;
use std::fs::File;
use std::io;
use std::marker::PhantomData;
use std::os::unix::prelude::*;
use thiserror::Error;

mod ioctl {
    use kvm_bindings::*;
    use nix::ioctl_read;
    use nix::ioctl_write_int_bad;
    use nix::ioctl_write_ptr;
    use nix::request_code_none;
    const KVMIO: u8 = 0xae;
    ioctl_write_int_bad!(kvm_create_vm, request_code_none!(KVMIO, 0x1));
    ioctl_write_int_bad!(kvm_get_vcpu_mmap_size, request_code_none!(KVMIO, 0x04));
    ioctl_write_int_bad!(kvm_create_vcpu, request_code_none!(KVMIO, 0x41));
    ioctl_write_ptr!(
        kvm_set_user_memory_region,
        KVMIO,
        0x46,
        kvm_userspace_memory_region
    );
    ioctl_write_int_bad!(kvm_run, request_code_none!(KVMIO, 0x80));
    ioctl_write_ptr!(kvm_set_regs, KVMIO, 0x82, kvm_regs);
    ioctl_read!(kvm_get_sregs, KVMIO, 0x83, kvm_sregs);
    ioctl_write_ptr!(kvm_set_sregs, KVMIO, 0x84, kvm_sregs);
}

/// Failures from the KVM device, one variant per setup or run stage so a
/// failed guest reports exactly where bring-up stopped.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to open /dev/kvm")]
    OpenKvm(#[source] io::Error),
    #[error("GetVCpuMmapSize")]
    GetVCpuMmapSize(#[source] nix::Error),
    #[error("CreateVm")]
    CreateVm(#[source] nix::Error),
    #[error("failed to map guest memory")]
    MapGuestMemory(#[source] io::Error),
    #[error("SetMemoryRegion")]
    SetMemoryRegion(#[source] nix::Error),
    #[error("CreateVCpu")]
    CreateVCpu(#[source] nix::Error),
    #[error("MmapVCpu")]
    MmapVCpu(#[source] io::Error),
    #[error("GetSRegs")]
    GetSRegs(#[source] nix::Error),
    #[error("SetSRegs")]
    SetSRegs(#[source] nix::Error),
    #[error("SetRegs")]
    SetRegs(#[source] nix::Error),
    #[error("Run")]
    Run(#[source] nix::Error),
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// An open file to `/dev/kvm`.
#[derive(Debug)]
pub struct Kvm(File);

impl Kvm {
    /// Opens `/dev/kvm`.
    pub fn new() -> Result<Self> {
        let kvm = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/kvm")
            .map_err(Error::OpenKvm)?;

        Ok(Self(kvm))
    }

    fn vcpu_mmap_size(&self) -> Result<usize> {
        // SAFETY: Calling IOCTL as documented, with no special requirements.
        let size = unsafe {
            ioctl::kvm_get_vcpu_mmap_size(self.0.as_raw_fd(), 0).map_err(Error::GetVCpuMmapSize)?
        };
        Ok(size as usize)
    }

    /// Creates a VM with one vCPU and `memory_size` bytes of zeroed guest
    /// memory registered at guest physical address 0.
    ///
    /// Every resource is owned by the returned [`Vm`]; a failure at any
    /// stage releases whatever was already allocated.
    pub fn new_vm(&self, memory_size: usize) -> Result<Vm> {
        // SAFETY: Calling IOCTL as documented, with no special requirements.
        let vm = unsafe {
            let fd = ioctl::kvm_create_vm(self.0.as_raw_fd(), 0).map_err(Error::CreateVm)?;
            File::from_raw_fd(fd)
        };

        let memory = Mapping::anonymous(memory_size).map_err(Error::MapGuestMemory)?;

        let region = kvm_userspace_memory_region {
            slot: 0,
            flags: 0,
            guest_phys_addr: 0,
            memory_size: memory_size as u64,
            userspace_addr: memory.ptr as u64,
        };
        // SAFETY: the region points at the mapping owned above, which lives
        // as long as the VM fd it is registered with.
        unsafe {
            ioctl::kvm_set_user_memory_region(vm.as_raw_fd(), &region)
                .map_err(Error::SetMemoryRegion)?;
        }

        // SAFETY: Calling IOCTL as documented, with no special requirements.
        let vcpu = unsafe {
            let fd = ioctl::kvm_create_vcpu(vm.as_raw_fd(), 0).map_err(Error::CreateVCpu)?;
            File::from_raw_fd(fd)
        };

        // The run structure size is reported by the platform, not assumed.
        let run =
            Mapping::of_fd(self.vcpu_mmap_size()?, vcpu.as_raw_fd()).map_err(Error::MmapVCpu)?;

        Ok(Vm {
            vm,
            vcpu,
            memory,
            run,
            _phantom: PhantomData,
        })
    }
}

impl AsFd for Kvm {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// A shared anonymous or fd-backed mapping, unmapped on drop.
#[derive(Debug)]
struct Mapping {
    ptr: *mut libc::c_void,
    len: usize,
}

// SAFETY: the mapping is just memory; access is mediated by the exclusive
// ownership rules of `Vm`.
unsafe impl Send for Mapping {}

impl Mapping {
    fn anonymous(len: usize) -> io::Result<Self> {
        // SAFETY: mmap with a null hint and no fd is always valid to call.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    fn of_fd(len: usize, fd: RawFd) -> io::Result<Self> {
        // SAFETY: mmap with a null hint is valid, and the caller's fd is open.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: unmapping a mapping this object owns.
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

/// One virtual machine with a single vCPU.
///
/// Owns the VM fd, the vCPU fd, the guest memory mapping and the mapped run
/// structure. All four are released when the value drops, on every exit
/// path.
#[derive(Debug)]
pub struct Vm {
    vm: File,
    vcpu: File,
    memory: Mapping,
    run: Mapping,
    _phantom: PhantomData<kvm_run>,
}

/// A decoded VM exit. I/O exits borrow the data window of the mapped run
/// structure, so the bytes a guest wrote are read in place and the bytes a
/// guest reads are written in place.
#[derive(Debug)]
pub enum Exit<'a> {
    IoIn { port: u16, data: &'a mut [u8] },
    IoOut { port: u16, data: &'a [u8] },
    Hlt,
    Shutdown,
    InternalError { error: u32 },
    Other { reason: u32 },
}

impl Vm {
    /// The guest physical memory, starting at guest physical address 0.
    pub fn memory_mut(&mut self) -> &mut [u8] {
        // SAFETY: the mapping is exclusively owned and the vCPU is not
        // running while the caller holds `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.memory.ptr.cast::<u8>(), self.memory.len) }
    }

    pub fn memory_size(&self) -> usize {
        self.memory.len
    }

    fn run_data(&mut self) -> &mut kvm_run {
        // SAFETY: there are no other references to this data right now
        // since this thread exclusively owns the vCPU, and the vCPU is not
        // running (so the kernel is not mutating the structure either).
        unsafe { &mut *self.run.ptr.cast::<kvm_run>() }
    }

    fn run_data_slice(&mut self) -> &mut [u8] {
        // SAFETY: see `run_data`.
        unsafe { std::slice::from_raw_parts_mut(self.run.ptr.cast::<u8>(), self.run.len) }
    }

    pub fn get_sregs(&self) -> Result<kvm_sregs> {
        let mut sregs = Default::default();
        // SAFETY: Calling IOCTL as documented, with no special requirements.
        unsafe {
            ioctl::kvm_get_sregs(self.vcpu.as_raw_fd(), &mut sregs).map_err(Error::GetSRegs)?;
        }
        Ok(sregs)
    }

    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<()> {
        // SAFETY: Calling IOCTL as documented, with no special requirements.
        unsafe {
            ioctl::kvm_set_sregs(self.vcpu.as_raw_fd(), sregs).map_err(Error::SetSRegs)?;
        }
        Ok(())
    }

    pub fn set_regs(&self, regs: &kvm_regs) -> Result<()> {
        // SAFETY: Calling IOCTL as documented, with no special requirements.
        unsafe {
            ioctl::kvm_set_regs(self.vcpu.as_raw_fd(), regs).map_err(Error::SetRegs)?;
        }
        Ok(())
    }

    /// Runs the vCPU until the next exit and decodes it.
    pub fn run(&mut self) -> Result<Exit<'_>> {
        loop {
            // SAFETY: Calling IOCTL as documented, with no special requirements.
            match unsafe { ioctl::kvm_run(self.vcpu.as_raw_fd(), 0) } {
                Ok(_) => break,
                Err(nix::errno::Errno::EINTR | nix::errno::Errno::EAGAIN) => {}
                Err(err) => return Err(Error::Run(err)),
            }
        }

        let exit = match self.run_data().exit_reason {
            KVM_EXIT_IO => {
                // SAFETY: this is the active union field.
                let io = unsafe { self.run_data().__bindgen_anon_1.io };

                let offset = io.data_offset as usize;
                let data = &mut self.run_data_slice()
                    [offset..offset + io.size as usize * io.count as usize];
                if io.direction == KVM_EXIT_IO_IN as u8 {
                    Exit::IoIn {
                        port: io.port,
                        data,
                    }
                } else {
                    Exit::IoOut {
                        port: io.port,
                        data,
                    }
                }
            }
            KVM_EXIT_HLT => Exit::Hlt,
            KVM_EXIT_SHUTDOWN => Exit::Shutdown,
            KVM_EXIT_INTERNAL_ERROR => {
                // SAFETY: this is the active union field.
                let internal = unsafe { &self.run_data().__bindgen_anon_1.internal };
                Exit::InternalError {
                    error: internal.suberror,
                }
            }
            reason => Exit::Other { reason },
        };
        Ok(exit)
    }
}

impl AsFd for Vm {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.vm.as_fd()
    }
}
