use std::io;
use std::os::fd::RawFd;

use convi::ExpectFrom;

/// `pwrite` until the whole `buf` is written
pub fn pwrite_all(fd: RawFd, mut offset: u64, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let written = nix::sys::uio::pwrite(fd, buf, i64::expect_from(offset))?;
        if written == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        buf = &buf[written..];
        offset += u64::expect_from(written);
    }
    Ok(())
}

/// `pread` until `buf` is full
pub fn pread_exact(fd: RawFd, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let read = nix::sys::uio::pread(fd, buf, i64::expect_from(offset))?;
        if read == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf = &mut buf[read..];
        offset += u64::expect_from(read);
    }
    Ok(())
}

/// `pread` as much as possible, returning number of bytes read (short only at EOF)
pub fn pread_full(fd: RawFd, mut offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let read = nix::sys::uio::pread(fd, &mut buf[total..], i64::expect_from(offset))?;
        if read == 0 {
            break;
        }
        total += read;
        offset += u64::expect_from(read);
    }
    Ok(total)
}

pub fn fsync(fd: RawFd) -> io::Result<()> {
    nix::unistd::fsync(fd)?;
    Ok(())
}

pub fn ftruncate(fd: RawFd, len: u64) -> io::Result<()> {
    nix::unistd::ftruncate(fd, i64::expect_from(len))?;
    Ok(())
}

/// Overwrite `len` bytes at `offset` with zeros
pub fn write_zeros(fd: RawFd, mut offset: u64, len: u64) -> io::Result<()> {
    const ZEROS: [u8; 64 * 1024] = [0; 64 * 1024];
    let end = offset + len;
    while offset < end {
        let n = usize::expect_from((end - offset).min(u64::expect_from(ZEROS.len())));
        pwrite_all(fd, offset, &ZEROS[..n])?;
        offset += u64::expect_from(n);
    }
    Ok(())
}
