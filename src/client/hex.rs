use core::fmt::{self, Write};

/// Renders bytes as lower-case hex without allocating. Ids and digests show
/// up in log fields through this.
#[derive(Clone, Copy)]
pub struct Hex<'a>(&'a [u8]);

impl fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const DIGITS: &[u8; 16] = b"0123456789abcdef";
        self.0.iter().try_for_each(|byte| {
            f.write_char(DIGITS[usize::from(byte >> 4)] as char)?;
            f.write_char(DIGITS[usize::from(byte & 0x0f)] as char)
        })
    }
}

impl fmt::Debug for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

pub trait HexDisplayExt {
    fn hex(&self) -> Hex<'_>;
}

impl<T: ?Sized + AsRef<[u8]>> HexDisplayExt for T {
    fn hex(&self) -> Hex<'_> {
        Hex(self.as_ref())
    }
}
