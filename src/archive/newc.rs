//! cpio "newc" (SVR4, no CRC) encoding, the format the kernel unpacks at boot.
//!
//! Each entry is a 110 byte ASCII header (`070701` then 13 hex fields),
//! the NUL terminated name, padding to 4 bytes, the data, padding to 4
//! bytes. The archive ends with an entry named `TRAILER!!!`.

use std::io::{self, Read, Write};

pub const MAGIC: &str = "070701";
pub const TRAILER: &str = "TRAILER!!!";
const HEADER_LEN: usize = 110;

/// Header fields of one entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    pub ino: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub mtime: u32,
    pub filesize: u32,
    pub rdevmajor: u32,
    pub rdevminor: u32,
}

fn pad(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

/// Streams newc entries into `W`.
pub struct NewcWriter<W: Write> {
    out: W,
    written: u64,
}

impl<W: Write> NewcWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, written: 0 }
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    fn put(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.out.write_all(bytes)?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    fn put_zeros(&mut self, n: usize) -> io::Result<()> {
        self.put(&[0u8; 4][..n])
    }

    /// Write the header and name. The name must not carry a leading `/`.
    pub fn write_header(&mut self, name: &str, header: &Header) -> io::Result<()> {
        let name = name.trim_start_matches('/');
        let namesize = name.len() + 1;
        let encoded = format!(
            "{}\
             {:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}\
             {:08X}{:08X}{:08X}{:08X}{:08X}{:08X}",
            MAGIC,
            header.ino,
            header.mode,
            header.uid,
            header.gid,
            header.nlink,
            header.mtime,
            header.filesize,
            0u32, // devmajor
            0u32, // devminor
            header.rdevmajor,
            header.rdevminor,
            namesize,
            0u32, // check
        );
        debug_assert_eq!(encoded.len(), HEADER_LEN);
        self.put(encoded.as_bytes())?;
        self.put(name.as_bytes())?;
        self.put(&[0])?;
        self.put_zeros(pad(HEADER_LEN + namesize))
    }

    /// Write an entry whose data is held in memory.
    pub fn write_entry(&mut self, name: &str, header: Header, data: &[u8]) -> io::Result<()> {
        let header = Header {
            filesize: u32::try_from(data.len())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "entry larger than 4 GiB"))?,
            ..header
        };
        self.write_header(name, &header)?;
        self.put(data)?;
        self.put_zeros(pad(data.len()))
    }

    /// Write an entry whose data is streamed from `reader`. Exactly
    /// `header.filesize` bytes must come out of it.
    pub fn write_entry_from<R: Read>(&mut self, name: &str, header: Header, reader: R) -> io::Result<()> {
        self.write_header(name, &header)?;
        let expected = u64::from(header.filesize);
        let copied = io::copy(&mut reader.take(expected), &mut self.out)?;
        self.written += copied;
        if copied != expected {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("expected {} bytes, read {}", expected, copied),
            ));
        }
        self.put_zeros(pad(copied as usize))
    }

    /// Write the trailer and hand back the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.write_entry(
            TRAILER,
            Header {
                nlink: 1,
                ..Header::default()
            },
            &[],
        )?;
        self.out.flush()?;
        Ok(self.out)
    }
}
