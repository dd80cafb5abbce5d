use bincode::config::{FixintEncoding, WithOtherIntEncoding};
use bincode::{DefaultOptions, Options};
use nix::sys::stat::mode_t;

use crate::FileType;

pub trait Apply: Sized {
    fn apply<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        f(&mut self);
        self
    }
}

impl<T> Apply for T {}

pub fn index_first_null(data: impl AsRef<[u8]>) -> Option<usize> {
    data.as_ref().iter().enumerate().find_map(
        |(index, char)| {
            if *char == 0 {
                Some(index)
            } else {
                None
            }
        },
    )
}

/// the bincode options used for every kernel struct: fixed-width integers and
/// no length prefixes, matching the C layout the kernel actually writes.
pub fn get_bincode_config() -> WithOtherIntEncoding<DefaultOptions, FixintEncoding> {
    DefaultOptions::new().with_fixint_encoding()
}

pub fn mode_from_kind_and_perm(kind: FileType, perm: u16) -> u32 {
    (mode_t::from(kind) | perm as mode_t) as u32
}

pub fn perm_from_mode_and_kind(mode: u32) -> u16 {
    (mode & !(libc::S_IFMT as u32)) as u16
}
