//! Savestate primitives shared by the IPC core and its devices.
//!
//! Snapshots are a flat, ordered byte stream: every component writes its fields in a fixed order
//! and reads them back in the same order. Named markers are interleaved between components so a
//! stream produced by an incompatible build fails loudly at the first divergence instead of
//! silently misinterpreting bytes.

#![forbid(unsafe_code)]

mod error;
mod io;

pub use crate::error::{Result, SnapshotError};
pub use crate::io::{ReadLeExt, WriteLeExt, MAX_STRING_BYTES};

use std::io::{Read, Write};

/// Write a section marker.
pub fn write_marker<W: Write + ?Sized>(w: &mut W, name: &str) -> Result<()> {
    w.write_string_u32(name)
}

/// Read a section marker and check that it matches `name`.
pub fn expect_marker<R: Read + ?Sized>(r: &mut R, name: &'static str) -> Result<()> {
    let found = r.read_string_u32()?;
    if found != name {
        return Err(SnapshotError::MarkerMismatch {
            expected: name,
            found,
        });
    }
    Ok(())
}
