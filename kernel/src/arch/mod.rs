//! Architecture support. x86-64 is the only implemented target.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
