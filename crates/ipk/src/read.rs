// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use log::warn;
use md5::Md5;
use nix::unistd::Uid;
use sha2::{Digest, Sha256};
use tar::{Archive, Entry, EntryType};

use crate::decompress::{decompress, Decompress};
use crate::{Error, HashAlgo, Inner};

/// Ensure a leading `./`, rejecting absolute paths and `..` traversal
pub fn sanitize_name(name: &str) -> Result<String, Error> {
    if name.starts_with('/') {
        return Err(Error::UnsafePath(name.to_string()));
    }

    let mut clean = String::with_capacity(name.len() + 2);
    if !name.starts_with("./") {
        clean.push_str("./");
    }
    clean.push_str(name);

    if clean.split('/').any(|segment| segment == "..") {
        return Err(Error::UnsafePath(name.to_string()));
    }

    Ok(clean)
}

/// Extract both sub-archives of the package at `path` into
/// `dest/control/` and `dest/data/`, creating `dest` if absent.
///
/// Permissions, mtimes and symbolic links are preserved; ownership is
/// preserved when running as root. Device and FIFO members are warned
/// about and skipped.
pub fn unpack(path: &Path, dest: &Path) -> Result<(), Error> {
    for inner in [Inner::Control, Inner::Data] {
        let target = dest.join(inner.dir_name());
        std::fs::create_dir_all(&target)?;

        let mut archive = read_inner(path, inner)?;
        unpack_into(&mut archive, &target)?;
    }
    Ok(())
}

/// Size in bytes of a single member of a named sub-archive
pub fn file_size(path: &Path, inner: Inner, name: &str) -> Result<u64, Error> {
    with_member(path, inner, name, |entry| Ok(entry.size()))
}

/// A member of a sub-archive, as reported by [`list`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Sanitized name, always starting with `./`
    pub name: String,
    pub kind: MemberKind,
    pub size: u64,
    pub mode: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Regular,
    Directory,
    Symlink,
    Other,
}

/// Enumerate the members of a named sub-archive without extracting it
pub fn list(path: &Path, inner: Inner) -> Result<Vec<Member>, Error> {
    let mut archive = read_inner(path, inner)?;
    let mut members = Vec::new();

    for entry in archive.entries()? {
        let entry = entry?;
        let header = entry.header();
        members.push(Member {
            name: sanitize_name(&entry_name(&entry))?,
            kind: match header.entry_type() {
                EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => MemberKind::Regular,
                EntryType::Directory => MemberKind::Directory,
                EntryType::Symlink => MemberKind::Symlink,
                _ => MemberKind::Other,
            },
            size: entry.size(),
            mode: header.mode()?,
        });
    }

    Ok(members)
}

/// Read a single member of a named sub-archive into memory
pub fn extract_to_memory(path: &Path, inner: Inner, name: &str) -> Result<Vec<u8>, Error> {
    with_member(path, inner, name, |entry| {
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buf)?;
        Ok(buf)
    })
}

/// Digest of a single member of a named sub-archive
pub fn hash_file(path: &Path, inner: Inner, name: &str, algo: HashAlgo) -> Result<Vec<u8>, Error> {
    let data = extract_to_memory(path, inner, name)?;
    Ok(match algo {
        HashAlgo::Md5 => Md5::digest(&data).to_vec(),
        HashAlgo::Sha256 => Sha256::digest(&data).to_vec(),
    })
}

type InnerArchive = Archive<Decompress<io::Cursor<Vec<u8>>>>;

/// Locate a sub-archive inside the outer archive and open it for reading.
///
/// The sub-archive is materialized in memory; packages on this class of
/// device are small and the outer archive cannot be seeked twice.
fn read_inner(path: &Path, inner: Inner) -> Result<InnerArchive, Error> {
    let file = File::open(path)?;
    let mut outer = Archive::new(decompress(file)?);

    for entry in outer.entries()? {
        let mut entry = entry?;
        let clean = sanitize_name(&entry_name(&entry))?;
        if !inner.matches(&clean) {
            continue;
        }

        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buf)?;
        return Ok(Archive::new(decompress(io::Cursor::new(buf))?));
    }

    Err(Error::MissingInner(inner.stem()))
}

fn with_member<T>(
    path: &Path,
    inner: Inner,
    name: &str,
    op: impl FnOnce(&mut Entry<'_, Decompress<io::Cursor<Vec<u8>>>>) -> Result<T, Error>,
) -> Result<T, Error> {
    let want = sanitize_name(name)?;
    let mut archive = read_inner(path, inner)?;

    for entry in archive.entries()? {
        let mut entry = entry?;
        if sanitize_name(&entry_name(&entry))? == want {
            return op(&mut entry);
        }
    }

    Err(Error::MissingMember(name.to_string()))
}

fn unpack_into<R: Read>(archive: &mut Archive<R>, dest: &Path) -> Result<(), Error> {
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_unpack_xattrs(true);
    archive.set_preserve_ownerships(Uid::effective().is_root());

    for entry in archive.entries()? {
        let mut entry = entry?;
        let clean = sanitize_name(&entry_name(&entry))?;

        match entry.header().entry_type() {
            EntryType::Block | EntryType::Char => {
                warn!("Skipping device node: {clean}");
                continue;
            }
            EntryType::Fifo => {
                warn!("Skipping FIFO (named pipe): {clean}");
                continue;
            }
            _ => {}
        }

        if !entry.unpack_in(dest)? {
            return Err(Error::UnsafePath(clean));
        }
    }

    Ok(())
}

fn entry_name<R: Read>(entry: &Entry<'_, R>) -> String {
    String::from_utf8_lossy(&entry.path_bytes()).into_owned()
}

#[cfg(test)]
mod test {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tar::{Builder, Header};

    use super::*;

    const TOOL_BODY: &[u8] = b"#!/bin/sh\necho tool\n";
    const CONF_BODY: &[u8] = b"option=1\n";
    const CONTROL_BODY: &[u8] = b"Package: tool\nVersion: 1.0\nArchitecture: all\n";

    fn file_entry(builder: &mut Builder<Vec<u8>>, name: &str, mode: u32, body: &[u8]) {
        let mut header = Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(mode);
        header.set_uid(0);
        header.set_gid(0);
        header.set_cksum();
        builder.append_data(&mut header, name, body).unwrap();
    }

    fn gz_tar(build: impl FnOnce(&mut Builder<Vec<u8>>)) -> Vec<u8> {
        let mut builder = Builder::new(Vec::new());
        build(&mut builder);
        let plain = builder.into_inner().unwrap();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&plain).unwrap();
        encoder.finish().unwrap()
    }

    fn build_package() -> tempfile::NamedTempFile {
        let control = gz_tar(|builder| {
            file_entry(builder, "./control", 0o644, CONTROL_BODY);
            file_entry(builder, "./conffiles", 0o644, b"/etc/tool.conf\n");
        });
        let data = gz_tar(|builder| {
            file_entry(builder, "./usr/bin/tool", 0o755, TOOL_BODY);
            file_entry(builder, "./etc/tool.conf", 0o644, CONF_BODY);

            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            header.set_uid(0);
            header.set_gid(0);
            header.set_cksum();
            builder
                .append_link(&mut header, "./usr/bin/tool-alias", "tool")
                .unwrap();
        });

        let outer = gz_tar(|builder| {
            file_entry(builder, "./debian-binary", 0o644, b"2.0\n");
            file_entry(builder, "./control.tar.gz", 0o644, &control);
            file_entry(builder, "./data.tar.gz", 0o644, &data);
        });

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&outer).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn unpack_package() {
        let package = build_package();
        let dest = tempfile::tempdir().unwrap();

        unpack(package.path(), dest.path()).unwrap();

        let tool = dest.path().join("data/usr/bin/tool");
        assert_eq!(std::fs::read(&tool).unwrap(), TOOL_BODY);
        let mode = std::fs::metadata(&tool).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        let alias = dest.path().join("data/usr/bin/tool-alias");
        assert_eq!(std::fs::read_link(alias).unwrap().to_str(), Some("tool"));

        let control = dest.path().join("control/control");
        assert_eq!(std::fs::read(control).unwrap(), CONTROL_BODY);
    }

    #[test]
    fn member_access() {
        let package = build_package();

        assert_eq!(
            file_size(package.path(), Inner::Data, "usr/bin/tool").unwrap(),
            TOOL_BODY.len() as u64
        );
        assert_eq!(
            extract_to_memory(package.path(), Inner::Control, "./control").unwrap(),
            CONTROL_BODY
        );
        assert!(matches!(
            extract_to_memory(package.path(), Inner::Data, "missing"),
            Err(Error::MissingMember(_))
        ));
    }

    #[test]
    fn hash_matches_memory_extraction() {
        let package = build_package();

        let extracted = extract_to_memory(package.path(), Inner::Data, "etc/tool.conf").unwrap();
        let digest = hash_file(package.path(), Inner::Data, "etc/tool.conf", HashAlgo::Sha256).unwrap();
        assert_eq!(digest, Sha256::digest(&extracted).to_vec());

        let md5 = hash_file(package.path(), Inner::Data, "etc/tool.conf", HashAlgo::Md5).unwrap();
        assert_eq!(md5, Md5::digest(CONF_BODY).to_vec());
    }

    #[test]
    fn list_data_members() {
        let package = build_package();

        let members = list(package.path(), Inner::Data).unwrap();
        let tool = members.iter().find(|m| m.name == "./usr/bin/tool").unwrap();
        assert_eq!(tool.kind, MemberKind::Regular);
        assert_eq!(tool.size, TOOL_BODY.len() as u64);
        assert_eq!(tool.mode & 0o777, 0o755);

        let alias = members.iter().find(|m| m.name == "./usr/bin/tool-alias").unwrap();
        assert_eq!(alias.kind, MemberKind::Symlink);
    }

    #[test]
    fn sanitization() {
        assert_eq!(sanitize_name("usr/bin/tool").unwrap(), "./usr/bin/tool");
        assert_eq!(sanitize_name("./usr/bin/tool").unwrap(), "./usr/bin/tool");
        assert!(matches!(
            sanitize_name("/etc/passwd"),
            Err(Error::UnsafePath(_))
        ));
        assert!(matches!(
            sanitize_name("../escape"),
            Err(Error::UnsafePath(_))
        ));
        assert!(matches!(
            sanitize_name("nested/../../escape"),
            Err(Error::UnsafePath(_))
        ));
    }
}
