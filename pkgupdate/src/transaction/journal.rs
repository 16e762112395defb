// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

//! The on-disk transaction journal.
//!
//! An append-only file of framed records. Each record carries the frame
//! checksum twice, before and after the payload; a record is valid only
//! when both frames match and the payload is fully present, so a
//! truncated tail reads as "not written" and is discarded on recovery.
//! Every write is followed by a data sync before the engine performs
//! the action the record describes.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use log::{debug, warn};
use thiserror::Error;

use crate::package::Phase;
use crate::Installation;

// Frame marker folded with the payload length. Also, endians, etc.
const MAGIC: u16 = 0x2a7c;

fn magic(len: u32) -> u16 {
    MAGIC ^ (len & 0xffff) as u16 ^ ((len >> 16) & 0xffff) as u16
}

/// One journaled unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Start,
    Finish,
    Unpacked { package: String, staging: PathBuf },
    Checked { package: String },
    Moved { package: String },
    Scripts { package: String, phase: Phase, exit_code: i32 },
    Cleaned { package: String },
}

impl Record {
    fn type_tag(&self) -> u8 {
        match self {
            Record::Start => 0,
            Record::Finish => 1,
            Record::Unpacked { .. } => 2,
            Record::Checked { .. } => 3,
            Record::Moved { .. } => 4,
            Record::Scripts { .. } => 5,
            Record::Cleaned { .. } => 6,
        }
    }

    fn params(&self) -> Vec<Vec<u8>> {
        match self {
            Record::Start | Record::Finish => vec![],
            Record::Unpacked { package, staging } => vec![
                package.clone().into_bytes(),
                staging.to_string_lossy().into_owned().into_bytes(),
            ],
            Record::Checked { package } | Record::Moved { package } | Record::Cleaned { package } => {
                vec![package.clone().into_bytes()]
            }
            Record::Scripts {
                package,
                phase,
                exit_code,
            } => vec![
                package.clone().into_bytes(),
                phase.to_string().into_bytes(),
                exit_code.to_le_bytes().to_vec(),
            ],
        }
    }

    fn from_wire(tag: u8, params: Vec<Vec<u8>>) -> Result<Self, Error> {
        let mut params = params.into_iter();

        Ok(match tag {
            0 => Record::Start,
            1 => Record::Finish,
            2 => Record::Unpacked {
                package: take_text(&mut params, "package")?,
                staging: PathBuf::from(take_text(&mut params, "staging")?),
            },
            3 => Record::Checked {
                package: take_text(&mut params, "package")?,
            },
            4 => Record::Moved {
                package: take_text(&mut params, "package")?,
            },
            5 => {
                let package = take_text(&mut params, "package")?;
                let phase = take_text(&mut params, "phase")?
                    .parse()
                    .map_err(|_| Error::MissingParameter("phase"))?;
                let exit_code = params
                    .next()
                    .and_then(|bytes| bytes.try_into().ok())
                    .map(i32::from_le_bytes)
                    .ok_or(Error::MissingParameter("exit_code"))?;
                Record::Scripts {
                    package,
                    phase,
                    exit_code,
                }
            }
            6 => Record::Cleaned {
                package: take_text(&mut params, "package")?,
            },
            other => return Err(Error::UnknownType(other)),
        })
    }

    fn encode(&self) -> Vec<u8> {
        let params = self.params();
        let total_size: u32 = params.iter().map(|p| 4 + p.len() as u32).sum();
        let frame = magic(total_size);

        let mut wire = Vec::with_capacity(10 + total_size as usize);
        wire.push(self.type_tag());
        wire.push(params.len() as u8);
        wire.extend_from_slice(&frame.to_le_bytes());
        wire.extend_from_slice(&total_size.to_le_bytes());
        for param in &params {
            wire.extend_from_slice(&(param.len() as u32).to_le_bytes());
            wire.extend_from_slice(param);
        }
        wire.extend_from_slice(&frame.to_le_bytes());
        wire
    }

    /// Decode one record. `Ok(None)` means clean EOF; any framing
    /// violation is an error the caller treats as the corruption point.
    fn decode(reader: &mut impl Read) -> Result<Option<Self>, Error> {
        let mut header = [0u8; 8];
        match read_exact_or_eof(reader, &mut header)? {
            ReadOutcome::Eof => return Ok(None),
            ReadOutcome::Partial => return Err(Error::TruncatedRecord),
            ReadOutcome::Full => {}
        }

        let tag = header[0];
        let param_count = header[1];
        let frame = u16::from_le_bytes([header[2], header[3]]);
        let total_size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if frame != magic(total_size) {
            return Err(Error::BrokenMagic("header"));
        }

        let mut payload = vec![0u8; total_size as usize + 2];
        match read_exact_or_eof(reader, &mut payload)? {
            ReadOutcome::Full => {}
            _ => return Err(Error::TruncatedRecord),
        }

        let tail = u16::from_le_bytes([payload[total_size as usize], payload[total_size as usize + 1]]);
        if tail != frame {
            return Err(Error::BrokenMagic("tail"));
        }

        let mut params = Vec::with_capacity(param_count as usize);
        let mut at = 0usize;
        for _ in 0..param_count {
            if at + 4 > total_size as usize {
                return Err(Error::TruncatedRecord);
            }
            let len =
                u32::from_le_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
                    as usize;
            at += 4;
            if at + len > total_size as usize {
                return Err(Error::TruncatedRecord);
            }
            params.push(payload[at..at + len].to_vec());
            at += len;
        }
        if at != total_size as usize {
            return Err(Error::TruncatedRecord);
        }

        Some(Record::from_wire(tag, params)).transpose()
    }
}

fn take_text(
    params: &mut std::vec::IntoIter<Vec<u8>>,
    field: &'static str,
) -> Result<String, Error> {
    params
        .next()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .ok_or(Error::MissingParameter(field))
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<ReadOutcome, Error> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Partial
                })
            }
            Ok(n) => filled += n,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(Error::Io(error)),
        }
    }
    Ok(ReadOutcome::Full)
}

/// An open journal, append-only with synchronous data integrity
#[derive(Debug)]
pub struct Journal {
    file: File,
    path: PathBuf,
}

impl Journal {
    /// Begin a fresh journal. An existing journal means an unfinished
    /// transaction and is refused.
    pub fn fresh(installation: &Installation) -> Result<Self, Error> {
        debug!("Opening journal");
        let path = installation.journal_path();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .append(true)
            .create_new(true)
            .custom_flags(nix::libc::O_DSYNC)
            .open(&path)
            .map_err(|error| match error.kind() {
                io::ErrorKind::AlreadyExists => Error::UnfinishedJournal,
                _ => Error::Io(error),
            })?;

        let mut journal = Self { file, path };
        journal.write(&Record::Start)?;
        Ok(journal)
    }

    /// Check if there is some journal (without opening it)
    pub fn exists(installation: &Installation) -> bool {
        installation.journal_path().exists()
    }

    /// Open an existing journal and read its valid prefix. Everything
    /// from the first framing failure on is truncated away. Returns
    /// `None` when no journal exists.
    pub fn recover(installation: &Installation) -> Result<Option<(Self, Vec<Record>)>, Error> {
        let path = installation.journal_path();

        let mut file = match OpenOptions::new()
            .read(true)
            .write(true)
            .append(true)
            .custom_flags(nix::libc::O_DSYNC)
            .open(&path)
        {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(Error::Io(error)),
        };

        let mut records = Vec::new();
        let mut valid_end: u64 = 0;

        file.seek(SeekFrom::Start(0))?;
        loop {
            match Record::decode(&mut file) {
                Ok(Some(record)) => {
                    records.push(record);
                    valid_end = file.stream_position()?;
                }
                Ok(None) => break,
                Err(error) => {
                    warn!("Broken journal record: {error}");
                    break;
                }
            }
        }

        // Erase the possibly broken tail
        file.set_len(valid_end)?;
        file.seek(SeekFrom::End(0))?;

        Ok(Some((Self { file, path }, records)))
    }

    /// Append a record and sync it to stable storage before the caller
    /// acts on it
    pub fn write(&mut self, record: &Record) -> Result<(), Error> {
        self.file.write_all(&record.encode())?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Close the journal, appending `FINISH`. The file is removed
    /// unless `keep` is set.
    pub fn finish(mut self, keep: bool) -> Result<(), Error> {
        debug!("Closing journal");
        self.write(&Record::Finish)?;
        drop(self.file);
        if !keep {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    /// Abandon the journal entirely, removing the file
    pub fn discard(self) -> Result<(), Error> {
        drop(self.file);
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unfinished journal exists")]
    UnfinishedJournal,
    #[error("Broken magic at the {0}")]
    BrokenMagic(&'static str),
    #[error("Incomplete journal record")]
    TruncatedRecord,
    #[error("unknown record type: {0}")]
    UnknownType(u8),
    #[error("missing record parameter: {0}")]
    MissingParameter(&'static str),
    #[error("io")]
    Io(#[from] io::Error),
}
