// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The virtual file system behind the file port.
//!
//! Each guest owns a private catalog of open files plus a private tracking
//! copy of the shared-name list; nothing here is shared across guests
//! except the process-wide write-claim registry. Guest-visible descriptors
//! are small non-negative integers, assigned monotonically from 0 and never
//! reused within a guest's lifetime.
//!
//! A shared name is readable by every guest until some guest claims it for
//! writing. Writes never touch the shared host path: a write-mode file is
//! backed by a guest-localized path (`name.local<id>`), so concurrent
//! guests writing under the same logical name never collide on disk.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::hash_map::Entry;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read as _;
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Arc;

/// The wire failure sentinel.
pub const EOF: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// Process-wide registry of shared names claimed for writing.
///
/// The per-guest availability flags alone cannot mutually exclude two
/// guests racing to claim the same name, so the claim is arbitrated here,
/// atomically under one lock. A claim lasts for the process lifetime.
#[derive(Debug, Default)]
pub struct WriteClaims(Mutex<HashMap<String, u32>>);

impl WriteClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `name` for `guest`. Returns false if another guest already
    /// holds the claim.
    fn claim(&self, name: &str, guest: u32) -> bool {
        match self.0.lock().entry(name.to_string()) {
            Entry::Occupied(entry) => *entry.get() == guest,
            Entry::Vacant(entry) => {
                entry.insert(guest);
                true
            }
        }
    }
}

#[derive(Debug)]
struct SharedEntry {
    name: String,
    /// Still available for a fresh open by this guest. Cleared once this
    /// guest claims the name for writing.
    can_read: bool,
}

/// One open file. Exactly one capability is set while the node is in the
/// catalog; a node that loses its last capability is removed.
#[derive(Debug)]
struct LocalFile {
    name: String,
    host: Option<File>,
    can_read: bool,
    can_write: bool,
}

impl LocalFile {
    fn dead(&self) -> bool {
        !self.can_read && !self.can_write
    }
}

#[derive(Debug)]
pub struct GuestFs {
    guest_id: u32,
    next_fd: i32,
    files: BTreeMap<i32, LocalFile>,
    shared: Vec<SharedEntry>,
    /// Localized names a write-mode open of this guest has produced. A
    /// read-mode open of a non-shared name requires a prior local write.
    produced: HashSet<String>,
    claims: Arc<WriteClaims>,
}

impl GuestFs {
    pub fn new(guest_id: u32, shared_names: &[String], claims: Arc<WriteClaims>) -> Self {
        Self {
            guest_id,
            next_fd: 0,
            files: BTreeMap::new(),
            shared: shared_names
                .iter()
                .map(|name| SharedEntry {
                    name: name.clone(),
                    can_read: true,
                })
                .collect(),
            produced: HashSet::new(),
            claims,
        }
    }

    fn localize(&self, name: &str) -> String {
        format!("{}.local{}", name, self.guest_id)
    }

    fn alloc_fd(&mut self) -> i32 {
        let fd = self.next_fd;
        self.next_fd += 1;
        fd
    }

    fn insert_node(&mut self, name: String, host: File, mode: OpenMode) -> i32 {
        let fd = self.alloc_fd();
        self.files.insert(
            fd,
            LocalFile {
                name,
                host: Some(host),
                can_read: mode == OpenMode::Read,
                can_write: mode == OpenMode::Write,
            },
        );
        fd
    }

    fn open_host(&mut self, name: String, mode: OpenMode) -> i32 {
        let result = match mode {
            OpenMode::Read => OpenOptions::new().read(true).open(&name),
            OpenMode::Write => OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o777)
                .open(&name),
        };
        match result {
            Ok(host) => {
                if mode == OpenMode::Write {
                    self.produced.insert(name.clone());
                }
                self.insert_node(name, host, mode)
            }
            Err(err) => {
                tracing::debug!(guest = self.guest_id, name = %name, error = %err, "host open failed");
                EOF
            }
        }
    }

    /// Opens `name` and returns a fresh guest descriptor, or -1.
    pub fn open(&mut self, name: &str, mode: OpenMode) -> i32 {
        if let Some(index) = self.shared.iter().position(|entry| entry.name == name) {
            if self.shared[index].can_read {
                match mode {
                    OpenMode::Read => {
                        // Shared reads go at the shared host path directly.
                        return self.open_host(name.to_string(), OpenMode::Read);
                    }
                    OpenMode::Write => {
                        if !self.claims.claim(name, self.guest_id) {
                            tracing::warn!(
                                guest = self.guest_id,
                                name,
                                "shared file already claimed for writing"
                            );
                            return EOF;
                        }
                        self.shared[index].can_read = false;
                        // Invalidate this guest's outstanding read handles
                        // to the shared name; dropping the nodes closes the
                        // host descriptors.
                        self.files.retain(|_, file| file.name != name);
                        let local = self.localize(name);
                        return self.open_host(local, OpenMode::Write);
                    }
                }
            }
            // This guest already claimed the name; it now refers to the
            // localized copy for either mode.
            return self.open_host(self.localize(name), mode);
        }

        let local = self.localize(name);
        match mode {
            OpenMode::Write => self.open_host(local, OpenMode::Write),
            OpenMode::Read => {
                if self.produced.contains(&local) {
                    self.open_host(local, OpenMode::Read)
                } else {
                    EOF
                }
            }
        }
    }

    /// Closes a descriptor. A write handle is commit-once: closing it
    /// retires the node outright. A read close drops the read capability,
    /// and the node is removed once no capability remains.
    pub fn close(&mut self, fd: i32) -> i32 {
        let Some(file) = self.files.get_mut(&fd) else {
            return EOF;
        };
        if file.host.is_none() {
            return EOF;
        }
        file.host = None;
        file.can_read = false;
        file.can_write = false;
        if file.dead() {
            self.files.remove(&fd);
        }
        0
    }

    /// Reads one byte. EOF and I/O errors are not distinguished.
    pub fn read(&mut self, fd: i32) -> i32 {
        let Some(file) = self.files.get_mut(&fd) else {
            return EOF;
        };
        if !file.can_read {
            return EOF;
        }
        let Some(host) = file.host.as_mut() else {
            return EOF;
        };
        let mut buffer = [0u8; 1];
        match host.read(&mut buffer) {
            Ok(1) => buffer[0] as i32,
            _ => EOF,
        }
    }

    /// Writes one byte, echoing it back on success.
    pub fn write(&mut self, fd: i32, byte: u8) -> i32 {
        let Some(file) = self.files.get_mut(&fd) else {
            return EOF;
        };
        if !file.can_write {
            return EOF;
        }
        let Some(host) = file.host.as_mut() else {
            return EOF;
        };
        match host.write(&[byte]) {
            Ok(1) => byte as i32,
            _ => EOF,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_with(guest_id: u32, shared: &[String]) -> (GuestFs, Arc<WriteClaims>) {
        let claims = Arc::new(WriteClaims::new());
        (GuestFs::new(guest_id, shared, claims.clone()), claims)
    }

    #[test]
    fn descriptors_are_monotonic_and_never_reused() {
        let dir = tempfile::tempdir().unwrap();
        let name = |n: &str| dir.path().join(n).to_str().unwrap().to_string();
        let (mut fs, _) = fs_with(0, &[]);

        let a = fs.open(&name("a"), OpenMode::Write);
        let b = fs.open(&name("b"), OpenMode::Write);
        assert_eq!((a, b), (0, 1));
        assert_eq!(fs.close(a), 0);
        let c = fs.open(&name("c"), OpenMode::Write);
        assert_eq!(c, 2);
    }

    #[test]
    fn write_close_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().join("out.txt").to_str().unwrap().to_string();
        let (mut fs, _) = fs_with(3, &[]);

        let fd = fs.open(&name, OpenMode::Write);
        assert!(fd >= 0);
        assert_eq!(fs.write(fd, b'A'), i32::from(b'A'));
        assert_eq!(fs.close(fd), 0);

        // The backing file is localized by guest id.
        let backing = format!("{name}.local3");
        assert_eq!(std::fs::read(&backing).unwrap(), b"A");

        let fd = fs.open(&name, OpenMode::Read);
        assert!(fd >= 0);
        assert_eq!(fs.read(fd), i32::from(b'A'));
        assert_eq!(fs.read(fd), EOF);
        assert_eq!(fs.close(fd), 0);
    }

    #[test]
    fn close_is_idempotent_and_safe_on_unknown_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().join("x").to_str().unwrap().to_string();
        let (mut fs, _) = fs_with(0, &[]);

        assert_eq!(fs.close(7), EOF);
        let fd = fs.open(&name, OpenMode::Write);
        assert_eq!(fs.close(fd), 0);
        assert_eq!(fs.close(fd), EOF);
        assert_eq!(fs.read(fd), EOF);
        assert_eq!(fs.write(fd, b'x'), EOF);
    }

    #[test]
    fn read_mode_local_requires_prior_write() {
        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().join("never-written").to_str().unwrap().to_string();
        let (mut fs, _) = fs_with(0, &[]);
        assert_eq!(fs.open(&name, OpenMode::Read), EOF);
    }

    #[test]
    fn shared_file_reads_to_eof() {
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join("shared.txt").to_str().unwrap().to_string();
        std::fs::write(&shared, b"hi").unwrap();
        let (mut fs, _) = fs_with(0, &[shared.clone()]);

        let fd = fs.open(&shared, OpenMode::Read);
        assert!(fd >= 0);
        assert_eq!(fs.read(fd), i32::from(b'h'));
        assert_eq!(fs.read(fd), i32::from(b'i'));
        assert_eq!(fs.read(fd), EOF);
        assert_eq!(fs.close(fd), 0);
    }

    #[test]
    fn write_claim_is_exclusive_across_guests() {
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join("shared.txt").to_str().unwrap().to_string();
        std::fs::write(&shared, b"data").unwrap();

        let claims = Arc::new(WriteClaims::new());
        let names = vec![shared.clone()];
        let mut guest0 = GuestFs::new(0, &names, claims.clone());
        let mut guest1 = GuestFs::new(1, &names, claims.clone());

        assert!(guest0.open(&shared, OpenMode::Write) >= 0);
        assert_eq!(guest1.open(&shared, OpenMode::Write), EOF);
        // The loser can still read the shared path.
        assert!(guest1.open(&shared, OpenMode::Read) >= 0);
    }

    #[test]
    fn claiming_for_write_invalidates_own_read_handles() {
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join("shared.txt").to_str().unwrap().to_string();
        std::fs::write(&shared, b"data").unwrap();
        let (mut fs, _) = fs_with(0, &[shared.clone()]);

        let read_fd = fs.open(&shared, OpenMode::Read);
        assert!(read_fd >= 0);
        let write_fd = fs.open(&shared, OpenMode::Write);
        assert!(write_fd >= 0);
        assert_ne!(read_fd, write_fd);

        // The old read handle is gone; the write handle still works.
        assert_eq!(fs.read(read_fd), EOF);
        assert_eq!(fs.close(read_fd), EOF);
        assert_eq!(fs.write(write_fd, b'!'), i32::from(b'!'));
        assert_eq!(fs.close(write_fd), 0);
    }

    #[test]
    fn claimed_shared_name_refers_to_the_localized_copy() {
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join("shared.txt").to_str().unwrap().to_string();
        std::fs::write(&shared, b"original").unwrap();
        let (mut fs, _) = fs_with(2, &[shared.clone()]);

        let fd = fs.open(&shared, OpenMode::Write);
        assert_eq!(fs.write(fd, b'X'), i32::from(b'X'));
        assert_eq!(fs.close(fd), 0);

        // Re-opening by the shared name now reads the guest's own copy,
        // not the shared host file.
        let fd = fs.open(&shared, OpenMode::Read);
        assert_eq!(fs.read(fd), i32::from(b'X'));
        assert_eq!(fs.read(fd), EOF);
        // The shared host path is untouched.
        assert_eq!(std::fs::read(&shared).unwrap(), b"original");
    }

    #[test]
    fn mode_mismatch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().join("w").to_str().unwrap().to_string();
        let (mut fs, _) = fs_with(0, &[]);

        let fd = fs.open(&name, OpenMode::Write);
        assert_eq!(fs.read(fd), EOF);

        assert_eq!(fs.write(fd, b'a'), i32::from(b'a'));
        assert_eq!(fs.close(fd), 0);
        let fd = fs.open(&name, OpenMode::Read);
        assert_eq!(fs.write(fd, b'b'), EOF);
    }
}
