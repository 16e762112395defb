// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

use std::io::{self, Cursor, Read};

use flate2::read::GzDecoder;
use xz2::read::XzDecoder;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const XZ_MAGIC: [u8; 6] = [0xfd, b'7', b'z', b'X', b'Z', 0x00];

/// A reader chained back together after the magic-byte probe
type Rewound<R> = io::Chain<Cursor<Vec<u8>>, R>;

/// Byte stream wrapper yielding decompressed content.
///
/// Plain input is passed through untouched, which lets uncompressed
/// tar members ride the same path as gzip and xz ones.
pub enum Decompress<R: Read> {
    Plain(Rewound<R>),
    Gzip(GzDecoder<Rewound<R>>),
    Xz(XzDecoder<Rewound<R>>),
}

/// Wrap `reader`, autodetecting the compression from its leading magic
/// bytes. The wrapped reader owns `reader`; dropping it closes the
/// underlying stream.
pub fn decompress<R: Read>(mut reader: R) -> io::Result<Decompress<R>> {
    let mut magic = [0u8; 6];
    let probed = read_up_to(&mut reader, &mut magic)?;
    let rewound = Cursor::new(magic[..probed].to_vec()).chain(reader);

    Ok(if probed >= 2 && magic[..2] == GZIP_MAGIC {
        Decompress::Gzip(GzDecoder::new(rewound))
    } else if probed == 6 && magic == XZ_MAGIC {
        Decompress::Xz(XzDecoder::new(rewound))
    } else {
        Decompress::Plain(rewound)
    })
}

impl<R: Read> Read for Decompress<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Decompress::Plain(reader) => reader.read(buf),
            Decompress::Gzip(reader) => reader.read(buf),
            Decompress::Xz(reader) => reader.read(buf),
        }
    }
}

/// Fill as much of `buf` as the stream can provide before EOF
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use flate2::{write::GzEncoder, Compression};
    use xz2::write::XzEncoder;

    use super::*;

    const PAYLOAD: &[u8] = b"autodetection probe payload";

    #[test]
    fn gzip_roundtrip() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(PAYLOAD).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut out = Vec::new();
        decompress(Cursor::new(compressed))
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, PAYLOAD);
    }

    #[test]
    fn xz_roundtrip() {
        let mut encoder = XzEncoder::new(Vec::new(), 6);
        encoder.write_all(PAYLOAD).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut out = Vec::new();
        decompress(Cursor::new(compressed))
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, PAYLOAD);
    }

    #[test]
    fn plain_passthrough() {
        let mut out = Vec::new();
        decompress(Cursor::new(PAYLOAD.to_vec()))
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, PAYLOAD);
    }

    #[test]
    fn short_input_passthrough() {
        let mut out = Vec::new();
        decompress(Cursor::new(vec![0x1f]))
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, [0x1f]);
    }
}
