//! Compression methods for cell payloads.
//!
//! Each stored payload is tagged with a 1-byte method: gzip (1), zlib (2)
//! or no compression (3). The top bit (`0x80`) of the on-disk method byte is
//! not a codec; it marks a payload that spilled to a sibling file.
//!
//! Encoders stream into any [`Write`] sink (in practice the section buffer,
//! which never fails) and decoders wrap the bounded entry reader. Both are
//! built per operation and retired by drop.

use std::fmt;
use std::io::{self, Read, Write};

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};

use crate::{Error, Result};

/// Marks an entry whose payload lives in a sibling file.
pub const EXTERNAL_BIT: u8 = 0x80;

/// Compression method used for cell payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Compression {
    Gzip = 1,
    #[default]
    Zlib = 2,
    None = 3,
}

impl Compression {
    /// Decodes a method byte. The caller must clear [`EXTERNAL_BIT`] first.
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(Compression::Gzip),
            2 => Ok(Compression::Zlib),
            3 => Ok(Compression::None),
            _ => Err(Error::UnsupportedCompression(tag)),
        }
    }

    /// The on-disk method byte for this codec.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Compresses `data` into `sink` as a single stream.
    pub(crate) fn compress_into<W: Write>(self, data: &[u8], sink: W) -> io::Result<()> {
        match self {
            Compression::Gzip => {
                let mut enc = GzEncoder::new(sink, flate2::Compression::default());
                enc.write_all(data)?;
                enc.finish()?;
            }
            Compression::Zlib => {
                let mut enc = ZlibEncoder::new(sink, flate2::Compression::default());
                enc.write_all(data)?;
                enc.finish()?;
            }
            Compression::None => {
                let mut sink = sink;
                sink.write_all(data)?;
            }
        }
        Ok(())
    }

    /// Wraps a compressed stream in the decoder for this method.
    pub(crate) fn decoder<R: Read>(self, src: R) -> Decoder<R> {
        match self {
            Compression::Gzip => Decoder::Gzip(GzDecoder::new(src)),
            Compression::Zlib => Decoder::Zlib(ZlibDecoder::new(src)),
            Compression::None => Decoder::Raw(src),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Compression::Gzip => "gzip",
            Compression::Zlib => "zlib",
            Compression::None => "none",
        })
    }
}

/// Streaming decompressor over a compressed source.
pub(crate) enum Decoder<R: Read> {
    Gzip(GzDecoder<R>),
    Zlib(ZlibDecoder<R>),
    Raw(R),
}

impl<R: Read> Read for Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Decoder::Gzip(r) => r.read(buf),
            Decoder::Zlib(r) => r.read(buf),
            Decoder::Raw(r) => r.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(method: Compression, data: &[u8]) -> Vec<u8> {
        let mut compressed = Vec::new();
        method.compress_into(data, &mut compressed).unwrap();

        let mut out = Vec::new();
        method
            .decoder(compressed.as_slice())
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn all_methods_round_trip() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        for method in [Compression::Gzip, Compression::Zlib, Compression::None] {
            assert_eq!(round_trip(method, &data), data, "method {method}");
        }
    }

    #[test]
    fn identity_method_copies_verbatim() {
        let data = [0x01, 0x02, 0x03];
        let mut out = Vec::new();
        Compression::None.compress_into(&data, &mut out).unwrap();

        assert_eq!(out, data);
    }

    #[test]
    fn from_tag_rejects_unknown_methods() {
        assert!(matches!(
            Compression::from_tag(0),
            Err(Error::UnsupportedCompression(0))
        ));
        assert!(matches!(
            Compression::from_tag(4),
            Err(Error::UnsupportedCompression(4))
        ));
        // The external bit is not a codec by itself.
        assert!(matches!(
            Compression::from_tag(EXTERNAL_BIT | 2),
            Err(Error::UnsupportedCompression(0x82))
        ));
    }

    #[test]
    fn tag_round_trips() {
        for method in [Compression::Gzip, Compression::Zlib, Compression::None] {
            assert_eq!(Compression::from_tag(method.tag()).unwrap(), method);
        }
    }
}
