/*
 * SPDX-FileCopyrightText: 2024-2026 bootpatch contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use num_traits::ToPrimitive;

/// Common function for reading a structure from a reader.
pub trait FromReader<R: Read>: Sized {
    type Error;

    fn from_reader(reader: R) -> Result<Self, Self::Error>;
}

/// Extensions for readers to read and discard data (eg. for skipping over
/// signature blocks).
pub trait ReadDiscardExt {
    fn read_discard(&mut self, size: u64) -> io::Result<u64>;

    fn read_discard_exact(&mut self, size: u64) -> io::Result<()> {
        let n = self.read_discard(size)?;
        if n != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Expected to read {size} bytes, but reached EOF after {n} bytes"),
            ));
        }
        Ok(())
    }
}

impl<R: Read> ReadDiscardExt for R {
    fn read_discard(&mut self, size: u64) -> io::Result<u64> {
        io::copy(&mut self.take(size), &mut io::sink())
    }
}

/// Extensions for readers to read fixed-size buffers.
pub trait ReadFixedSizeExt {
    /// Read fixed-size array.
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]>;

    /// Read fixed-sized [`Vec`].
    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>>;
}

impl<R: Read> ReadFixedSizeExt for R {
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Extensions for file-like types to query the total size. No guarantees are
/// made about the state of the underlying file position afterwards.
pub trait FileLen {
    fn file_len(&self) -> io::Result<u64>;
}

/// Capability for random-access reads at specific offsets, independent of any
/// file position. This is the only thing container routing needs from its byte
/// source, which lets nested archives be parsed over zero-copy slices.
pub trait ReadAt: FileLen {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let n = self.read_at(buf, offset)?;
        if n != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "Expected to read {} bytes at {offset}, but reached EOF after {n} bytes",
                    buf.len(),
                ),
            ));
        }
        Ok(())
    }
}

macro_rules! read_at_blanket_impl {
    ($type:ty) => {
        impl<R: ?Sized + FileLen> FileLen for $type {
            fn file_len(&self) -> io::Result<u64> {
                (**self).file_len()
            }
        }
    };
    ($type:ty, at) => {
        impl<R: ?Sized + ReadAt> ReadAt for $type {
            fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
                (**self).read_at(buf, offset)
            }
        }
    };
}

read_at_blanket_impl!(&R);
read_at_blanket_impl!(&R, at);
read_at_blanket_impl!(Arc<R>);
read_at_blanket_impl!(Arc<R>, at);
read_at_blanket_impl!(Box<R>);
read_at_blanket_impl!(Box<R>, at);

impl FileLen for File {
    fn file_len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

/// Regular files support position-independent reads.
impl ReadAt for File {
    /// Read data from offset. The kernel's file position will *not* be changed.
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        FileExt::read_at(self, buf, offset)
    }

    /// Read data from offset. The kernel's file position *will* be changed.
    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        FileExt::seek_read(self, buf, offset)
    }
}

/// A fixed base+bound slice of a [`ReadAt`] source. Reads past the bound are
/// truncated, like reading past EOF on a regular file.
pub struct SectionReaderAt<R> {
    inner: R,
    start: u64,
    size: u64,
}

impl<R: ReadAt> SectionReaderAt<R> {
    pub fn new(inner: R, start: u64, size: u64) -> Self {
        Self { inner, start, size }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R> FileLen for SectionReaderAt<R> {
    fn file_len(&self) -> io::Result<u64> {
        Ok(self.size)
    }
}

impl<R: ReadAt> ReadAt for SectionReaderAt<R> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let to_read = self.size.saturating_sub(offset).min(buf.len() as u64) as usize;

        self.inner.read_at(&mut buf[..to_read], self.start + offset)
    }
}

/// Adapter implementing the standard [`Read`] and [`Seek`] traits on top of
/// [`ReadAt`]. The position is unique to each instance, even when the
/// underlying source is shared.
pub struct UserPosFile<F> {
    file: F,
    offset: u64,
}

impl<F> UserPosFile<F> {
    pub fn new(file: F) -> Self {
        Self { file, offset: 0 }
    }

    pub fn into_inner(self) -> F {
        self.file
    }
}

impl<F: ReadAt> Read for UserPosFile<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.file.read_at(buf, self.offset)?;
        self.offset += n as u64;
        Ok(n)
    }
}

impl<F: FileLen> Seek for UserPosFile<F> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let invalid = || {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "Offset would be before the start of the file",
            )
        };

        self.offset = match pos {
            SeekFrom::Start(o) => o,
            SeekFrom::End(o) => {
                let size = self.file.file_len()?;
                size.to_i64()
                    .and_then(|s| s.checked_add(o))
                    .and_then(|s| s.to_u64())
                    .ok_or_else(invalid)?
            }
            SeekFrom::Current(o) => self
                .offset
                .to_i64()
                .and_then(|s| s.checked_add(o))
                .and_then(|s| s.to_u64())
                .ok_or_else(invalid)?,
        };

        Ok(self.offset)
    }
}

/// A reader wrapper that implements [`Seek`], but only for reporting the
/// current stream position.
pub struct CountingReader<R> {
    inner: R,
    offset: u64,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, offset: 0 }
    }

    pub fn finish(self) -> (R, u64) {
        (self.inner, self.offset)
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.offset += n as u64;
        Ok(n)
    }
}

impl<R: Read> Seek for CountingReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        if pos == SeekFrom::Current(0) {
            Ok(self.offset)
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Can only report current offset",
            ))
        }
    }
}

/// Returns an I/O error with the [`io::ErrorKind::Interrupted`] type if
/// `cancel_signal` is true. This should be called frequently in I/O loops for
/// cancellation to be responsive.
#[inline]
pub fn check_cancel(cancel_signal: &AtomicBool) -> io::Result<()> {
    if cancel_signal.load(Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "Received cancel signal",
        ));
    }

    Ok(())
}

/// Copy exactly `size` bytes from `reader` to `writer`, invoking `inspect`
/// after every buffer read iteration. If either side reaches EOF before `size`
/// bytes are copied, an error is returned.
pub fn copy_n_inspect(
    mut reader: impl Read,
    mut writer: impl Write,
    mut size: u64,
    mut inspect: impl FnMut(&[u8]),
    cancel_signal: &AtomicBool,
) -> io::Result<()> {
    let mut buf = [0u8; 16384];

    while size > 0 {
        check_cancel(cancel_signal)?;

        let to_read = size.min(buf.len() as u64) as usize;
        reader.read_exact(&mut buf[..to_read])?;

        inspect(&buf[..to_read]);

        writer.write_all(&buf[..to_read])?;

        size -= to_read as u64;
    }

    Ok(())
}

/// Copy exactly `size` bytes from `reader` to `writer`.
pub fn copy_n(
    reader: impl Read,
    writer: impl Write,
    size: u64,
    cancel_signal: &AtomicBool,
) -> io::Result<()> {
    copy_n_inspect(reader, writer, size, |_| {}, cancel_signal)
}

/// Copy data from `reader` to `writer` until `reader` reaches EOF, invoking
/// `inspect` after every buffer read iteration.
pub fn copy_inspect(
    mut reader: impl Read,
    mut writer: impl Write,
    mut inspect: impl FnMut(&[u8]),
    cancel_signal: &AtomicBool,
) -> io::Result<u64> {
    let mut buf = [0u8; 16384];
    let mut copied = 0;

    loop {
        check_cancel(cancel_signal)?;

        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }

        inspect(&buf[..n]);

        writer.write_all(&buf[..n])?;

        copied += n as u64;
    }

    Ok(copied)
}

/// Copy data from `reader` to `writer` until `reader` reaches EOF.
pub fn copy(reader: impl Read, writer: impl Write, cancel_signal: &AtomicBool) -> io::Result<u64> {
    copy_inspect(reader, writer, |_| {}, cancel_signal)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    struct BufAt(Vec<u8>);

    impl FileLen for BufAt {
        fn file_len(&self) -> io::Result<u64> {
            Ok(self.0.len() as u64)
        }
    }

    impl ReadAt for BufAt {
        fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
            let offset = (offset as usize).min(self.0.len());
            let n = buf.len().min(self.0.len() - offset);
            buf[..n].copy_from_slice(&self.0[offset..offset + n]);
            Ok(n)
        }
    }

    #[test]
    fn read_discard() {
        let mut reader = Cursor::new(b"foobar");
        reader.read_discard_exact(3).unwrap();

        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ba");

        let n = reader.read_discard(2).unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn counting_reader() {
        let mut reader = CountingReader::new(Cursor::new(b"foobar"));

        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(reader.stream_position().unwrap(), 4);

        let (_, size) = reader.finish();
        assert_eq!(size, 4);
    }

    #[test]
    fn section_reader_at() {
        let source = BufAt(b"fooinnerbar".to_vec());
        let section = SectionReaderAt::new(&source, 3, 5);

        let mut buf = [0u8; 5];
        section.read_exact_at(&mut buf[..3], 0).unwrap();
        section.read_exact_at(&mut buf[3..], 3).unwrap();
        assert_eq!(&buf, b"inner");

        let n = section.read_at(&mut buf, 5).unwrap();
        assert_eq!(n, 0);

        // Nested slices compose.
        let nested = SectionReaderAt::new(&section, 1, 3);
        let mut buf = [0u8; 3];
        nested.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"nne");
    }

    #[test]
    fn user_pos_file() {
        let source = BufAt(b"foobar".to_vec());
        let mut file = UserPosFile::new(&source);

        let mut buf = [0u8; 3];
        file.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"foo");

        let pos = file.seek(SeekFrom::End(-3)).unwrap();
        assert_eq!(pos, 3);

        file.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"bar");
    }

    #[test]
    fn copy_functions() {
        let cancel_signal = AtomicBool::new(false);
        let mut reader = Cursor::new(b"foobar");
        let mut writer = Cursor::new([0u8; 6]);

        copy_n(&mut reader, &mut writer, 6, &cancel_signal).unwrap();
        assert_eq!(writer.get_ref(), b"foobar");

        reader.seek(SeekFrom::Start(3)).unwrap();
        writer.rewind().unwrap();
        let err = copy_n(&mut reader, &mut writer, 6, &cancel_signal).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        reader.rewind().unwrap();
        writer.rewind().unwrap();
        cancel_signal.store(true, Ordering::SeqCst);
        let err = copy(&mut reader, &mut writer, &cancel_signal).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }
}
