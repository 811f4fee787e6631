// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The file-port protocol state machine.
//!
//! Each hardware exit carries exactly one byte in one direction, so the
//! request/response protocol is decoded incrementally: every guest write
//! consumes one byte, every guest read produces one. Requests start with an
//! opcode byte, filenames are NUL-terminated, and descriptors travel as
//! four bytes, most significant first.
//!
//! A protocol violation never terminates the guest: it is logged and the
//! machine resets to idle, losing synchronization until the guest issues
//! the next opcode byte.

use crate::config::MAX_SHARED_PATH_LEN;
use crate::vfs::GuestFs;
use crate::vfs::OpenMode;

const OP_OPEN_R: u8 = 0x1;
const OP_OPEN_W: u8 = 0x2;
const OP_CLOSE: u8 = 0x3;
const OP_READ: u8 = 0x4;
const OP_WRITE: u8 = 0x5;

/// Longest filename accepted on the wire. The protocol carries no length
/// prefix, only a terminator, so the accumulated name is capped to bound
/// memory against a misbehaving guest.
const MAX_FILENAME_LEN: usize = MAX_SHARED_PATH_LEN;

#[derive(Debug, Clone, Copy)]
enum FdOp {
    Close,
    Read,
    Write,
}

/// Operation and phase, folded into one tagged state. Each variant names
/// the data it still needs or still owes.
#[derive(Debug)]
enum State {
    Idle,
    /// Accumulating a NUL-terminated filename for an open.
    Filename { mode: OpenMode, name: Vec<u8> },
    /// Assembling a big-endian descriptor from the guest.
    FdIn { op: FdOp, fd: u32, remaining: u8 },
    /// Emitting an open result descriptor, most significant byte first.
    FdOut { fd: i32, remaining: u8 },
    /// Waiting for the data byte of a write.
    Data { fd: i32 },
    /// One buffered result byte for the guest to read.
    Result { byte: u8 },
}

pub struct FilePort {
    guest_id: u32,
    fs: GuestFs,
    state: State,
}

impl FilePort {
    pub fn new(guest_id: u32, fs: GuestFs) -> Self {
        Self {
            guest_id,
            fs,
            state: State::Idle,
        }
    }

    fn protocol_error(&mut self, what: &str) {
        tracing::warn!(guest = self.guest_id, what, "file protocol error");
        self.state = State::Idle;
    }

    /// Handles one byte written by the guest.
    pub fn guest_write(&mut self, byte: u8) {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => match byte {
                OP_OPEN_R => {
                    self.state = State::Filename {
                        mode: OpenMode::Read,
                        name: Vec::new(),
                    };
                }
                OP_OPEN_W => {
                    self.state = State::Filename {
                        mode: OpenMode::Write,
                        name: Vec::new(),
                    };
                }
                OP_CLOSE => {
                    self.state = State::FdIn {
                        op: FdOp::Close,
                        fd: 0,
                        remaining: 4,
                    };
                }
                OP_READ => {
                    self.state = State::FdIn {
                        op: FdOp::Read,
                        fd: 0,
                        remaining: 4,
                    };
                }
                OP_WRITE => {
                    self.state = State::FdIn {
                        op: FdOp::Write,
                        fd: 0,
                        remaining: 4,
                    };
                }
                _ => self.protocol_error("undefined opcode"),
            },
            State::Filename { mode, mut name } => {
                if byte == 0 {
                    if name.is_empty() {
                        self.protocol_error("empty filename");
                    } else {
                        let name = String::from_utf8_lossy(&name).into_owned();
                        let fd = self.fs.open(&name, mode);
                        self.state = State::FdOut { fd, remaining: 4 };
                    }
                } else if name.len() >= MAX_FILENAME_LEN {
                    self.protocol_error("filename too long");
                } else {
                    name.push(byte);
                    self.state = State::Filename { mode, name };
                }
            }
            State::FdIn {
                op,
                mut fd,
                mut remaining,
            } => {
                remaining -= 1;
                fd |= u32::from(byte) << (u32::from(remaining) * 8);
                if remaining > 0 {
                    self.state = State::FdIn { op, fd, remaining };
                } else {
                    let fd = fd as i32;
                    self.state = match op {
                        FdOp::Close => State::Result {
                            byte: self.fs.close(fd) as u8,
                        },
                        FdOp::Read => State::Result {
                            byte: self.fs.read(fd) as u8,
                        },
                        FdOp::Write => State::Data { fd },
                    };
                }
            }
            State::Data { fd } => {
                self.state = State::Result {
                    byte: self.fs.write(fd, byte) as u8,
                };
            }
            State::FdOut { .. } | State::Result { .. } => {
                self.protocol_error("write while a response is pending");
            }
        }
    }

    /// Produces one byte for the guest to read.
    pub fn guest_read(&mut self) -> u8 {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::FdOut { fd, remaining } => {
                let remaining = remaining - 1;
                let byte = ((fd as u32) >> (u32::from(remaining) * 8)) as u8;
                if remaining > 0 {
                    self.state = State::FdOut { fd, remaining };
                }
                byte
            }
            State::Result { byte } => byte,
            _ => {
                self.protocol_error("read with no response pending");
                0xff
            }
        }
    }
}
