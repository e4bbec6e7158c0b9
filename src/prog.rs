//! The program image and the seam to the kernel load call.
//!
//! This module packs everything `bpf(BPF_PROG_LOAD, ...)` wants: the
//! serialized instruction array, the program-type tag, the license string
//! and the running kernel version. The syscall itself lives behind
//! [`ProgLoader`](trait.ProgLoader.html) so the workspace stays free of
//! direct kernel dependencies; the embedding process implements the trait
//! and owns the returned fd.

use crate::context::ProgType;
use crate::insn::Insn;
use byteorder::{ByteOrder, LittleEndian};
use num::traits::ToPrimitive;
use std::fmt;

/// License advertised to the kernel; several helpers are GPL-only.
pub const LICENSE: &str = "GPL";

/// Verbosity requested from the in-kernel verifier log.
pub const LOG_LEVEL: u32 = 100;

/// A linked program ready for loading.
#[derive(Clone, PartialEq, Debug)]
pub struct Program {
    pub prog_type: ProgType,
    pub insns: Vec<Insn>,
}

impl Program {
    pub fn new(prog_type: ProgType, insns: Vec<Insn>) -> Program {
        Program { prog_type, insns }
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Serialize into the packed little-endian byte image the kernel reads.
    pub fn image(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.insns.len() * Insn::BYTES];
        for (i, insn) in self.insns.iter().enumerate() {
            insn.write_to(&mut buf[i * Insn::BYTES..(i + 1) * Insn::BYTES]);
        }
        buf
    }

    pub fn load_request(&self, kern_version: KernelVersion) -> LoadRequest {
        LoadRequest {
            prog_type: self.prog_type.to_u32().unwrap_or(0),
            insn_cnt: self.insns.len() as u32,
            image: self.image(),
            license: LICENSE,
            log_level: LOG_LEVEL,
            kern_version: kern_version.pack(),
        }
    }
}

/// A running kernel version triple, packed the way the load call wants it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct KernelVersion {
    pub major: u16,
    pub minor: u8,
    pub patch: u8,
}

impl KernelVersion {
    pub fn new(major: u16, minor: u8, patch: u8) -> KernelVersion {
        KernelVersion {
            major,
            minor,
            patch,
        }
    }

    pub fn pack(self) -> u32 {
        ((self.major as u32) << 16) | ((self.minor as u32) << 8) | self.patch as u32
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Everything the load call consumes, already serialized.
#[derive(Clone, PartialEq, Debug)]
pub struct LoadRequest {
    pub prog_type: u32,
    pub insn_cnt: u32,
    pub image: Vec<u8>,
    pub license: &'static str,
    pub log_level: u32,
    pub kern_version: u32,
}

impl LoadRequest {
    /// The fixed-layout prefix of `union bpf_attr` for PROG_LOAD, with the
    /// caller's buffer addresses patched in. Field order and widths follow
    /// the kernel ABI: prog_type, insn_cnt, insns*, license*, log_level,
    /// log_size, log_buf*, kern_version.
    pub fn attr_bytes(&self, insns_ptr: u64, license_ptr: u64, log_buf: u64, log_size: u32) -> [u8; 48] {
        let mut attr = [0u8; 48];
        LittleEndian::write_u32(&mut attr[0..4], self.prog_type);
        LittleEndian::write_u32(&mut attr[4..8], self.insn_cnt);
        LittleEndian::write_u64(&mut attr[8..16], insns_ptr);
        LittleEndian::write_u64(&mut attr[16..24], license_ptr);
        LittleEndian::write_u32(&mut attr[24..28], self.log_level);
        LittleEndian::write_u32(&mut attr[28..32], log_size);
        LittleEndian::write_u64(&mut attr[32..40], log_buf);
        LittleEndian::write_u32(&mut attr[40..44], self.kern_version);
        attr
    }
}

/// The verifier said no. Carries the errno from the load call and the
/// verifier log verbatim; the log is the only way to find out why.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("failed to load bpf prog (errno {errno})\n{log}")]
pub struct LoadError {
    pub errno: i32,
    pub log: String,
}

/// The kernel-syscall side of loading, implemented by the embedder.
pub trait ProgLoader {
    /// Submit the request; on success return the program fd. Implementations
    /// surface the verifier log through [`LoadError`](struct.LoadError.html).
    fn prog_load(&mut self, req: &LoadRequest) -> Result<i32, LoadError>;
}
