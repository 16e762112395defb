// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

//! URI retrieval with integrity guarantees.
//!
//! A [`Uri`] pairs a canonical URI string with an output sink and a
//! verification policy. Local schemes (`file`, `data`) materialize
//! lazily in [`Uri::finish`]; remote schemes are registered with a
//! [`Downloader`] that drives all transfers on one cooperative event
//! loop. A child URI copies its parent's policy by value at
//! construction; PEM and pubkey lists share their nodes by reference
//! count, so later parent mutations never propagate.

use std::cell::RefCell;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::OnceLock;

use base64::prelude::{Engine, BASE64_STANDARD};
use log::{debug, trace};
use thiserror::Error;
use url::Url;

pub use self::downloader::{DownloadOpts, Downloader};

pub mod downloader;
pub mod signature;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Scheme {
    #[strum(serialize = "http")]
    Http,
    #[strum(serialize = "https")]
    Https,
    #[strum(serialize = "file")]
    File,
    #[strum(serialize = "data")]
    Data,
}

impl Scheme {
    fn parse(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Https),
            "file" => Some(Scheme::File),
            "data" => Some(Scheme::Data),
            _ => None,
        }
    }

    /// Local URIs need no downloader
    pub fn is_local(&self) -> bool {
        matches!(self, Scheme::File | Scheme::Data)
    }
}

/// Successfully retrieved content
#[derive(Debug, Clone)]
pub enum Content {
    /// Memory-sink content
    Buffer(Vec<u8>),
    /// Content landed in this file
    File(PathBuf),
}

impl Content {
    pub fn into_buffer(self) -> Option<Vec<u8>> {
        match self {
            Content::Buffer(bytes) => Some(bytes),
            Content::File(_) => None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Content::Buffer(_) => None,
            Content::File(path) => Some(path),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("URI has invalid format: {0}")]
    InvalidUri(String),
    #[error("URI contains invalid or unsupported scheme: {0}")]
    UnknownScheme(String),
    #[error("Download wasn't finished or even started")]
    UnfinishedDownload,
    #[error("Download failed: {0}")]
    DownloadFailed(String),
    #[error("Unable to open local file for reading: {0}")]
    FileInput(String),
    #[error("Unable to open output file for writing: {0}")]
    OutputOpen(String),
    #[error("Unable to write data to output: {0}")]
    OutputWrite(String),
    #[error("signature URI failure ({uri}): {source}")]
    Signature { uri: String, source: Box<Error> },
    #[error("signature verification failure: {0}")]
    VerifyFailed(signature::Error),
    #[error("URI to be used for local resources is not local one (file or data): {0}")]
    NonlocalConfigUri(String),
}

/// The fetch unit: canonical URI string, output sink and verification
/// policy, with policy inherited from an optional parent.
#[derive(Debug, Clone)]
pub struct Uri(Rc<RefCell<UriInner>>);

#[derive(Debug)]
struct UriInner {
    canonical: String,
    scheme: Scheme,
    output: Output,
    policy: Policy,
    sig_uri: Option<Uri>,
    transfer: Transfer,
    finished: Option<Result<Content, Error>>,
}

#[derive(Debug, Clone)]
pub(crate) struct Policy {
    pub ssl_verify: bool,
    pub ocsp: bool,
    pub ca_pin: bool,
    pub pems: Vec<Rc<PemEntry>>,
    pub pubkeys: Vec<Rc<KeyEntry>>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            ssl_verify: true,
            ocsp: true,
            ca_pin: false,
            pems: Vec::new(),
            pubkeys: Vec::new(),
        }
    }
}

/// A configured CA or CRL source, resolved once per node
#[derive(Debug)]
pub(crate) struct PemEntry {
    uri: Uri,
    resolved: RefCell<Option<Vec<reqwest::Certificate>>>,
}

impl PemEntry {
    pub fn certificates(&self) -> Vec<reqwest::Certificate> {
        if self.resolved.borrow().is_none() {
            let certificates = match self.uri.finish().and_then(|content| content_bytes(&content)) {
                Ok(bytes) => reqwest::Certificate::from_pem_bundle(&bytes).unwrap_or_else(|error| {
                    debug!("Unable to parse PEM {}: {error}", self.uri.canonical());
                    Vec::new()
                }),
                Err(error) => {
                    debug!("Unable to get CA/CRL {}: {error}", self.uri.canonical());
                    Vec::new()
                }
            };
            *self.resolved.borrow_mut() = Some(certificates);
        }
        self.resolved.borrow().clone().unwrap_or_default()
    }
}

/// A configured public-key source, resolved once per node
#[derive(Debug)]
pub(crate) struct KeyEntry {
    uri: Uri,
    resolved: RefCell<Option<Option<signature::PublicKey>>>,
}

impl KeyEntry {
    fn key(&self) -> Option<signature::PublicKey> {
        if self.resolved.borrow().is_none() {
            let key = match self.uri.finish().and_then(|content| content_bytes(&content)) {
                Ok(bytes) => match signature::PublicKey::parse(&bytes) {
                    Ok(key) => Some(key),
                    Err(error) => {
                        debug!("Unable to parse pubkey {}: {error}", self.uri.canonical());
                        None
                    }
                },
                Err(error) => {
                    debug!("Unable to get pubkey {}: {error}", self.uri.canonical());
                    None
                }
            };
            *self.resolved.borrow_mut() = Some(key);
        }
        self.resolved.borrow().clone().flatten()
    }
}

#[derive(Debug, Clone)]
enum Transfer {
    Idle,
    Registered,
    Done(Result<(), String>),
}

#[derive(Debug)]
pub(crate) enum Output {
    /// No sink chosen yet; becomes a buffer on first use
    Unset,
    Buffer(Vec<u8>),
    File { path: PathBuf, file: std::fs::File },
    Temp(tempfile::NamedTempFile),
    /// Placeholder while a transfer owns the sink
    Taken,
}

impl Output {
    pub(crate) fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self {
            Output::Unset => {
                *self = Output::Buffer(chunk.to_vec());
                Ok(())
            }
            Output::Buffer(bytes) => {
                bytes.extend_from_slice(chunk);
                Ok(())
            }
            Output::File { file, .. } => file.write_all(chunk),
            Output::Temp(temp) => temp.as_file_mut().write_all(chunk),
            Output::Taken => unreachable!("output taken"),
        }
    }

    /// Reset the sink between transfer retries
    pub(crate) fn rewind(&mut self) -> io::Result<()> {
        match self {
            Output::Unset | Output::Taken => Ok(()),
            Output::Buffer(bytes) => {
                bytes.clear();
                Ok(())
            }
            Output::File { file, .. } => {
                use std::io::Seek;
                file.seek(io::SeekFrom::Start(0))?;
                file.set_len(0)
            }
            Output::Temp(temp) => {
                use std::io::Seek;
                temp.as_file_mut().seek(io::SeekFrom::Start(0))?;
                temp.as_file().set_len(0)
            }
        }
    }
}

impl Uri {
    /// Construct a URI, optionally inheriting scheme and policy from a
    /// parent. See [`canonicalize`] for resolution rules.
    pub fn new(uri: &str, parent: Option<&Uri>) -> Result<Self, Error> {
        let (canonical, scheme) = canonicalize(uri, parent)?;
        trace!(
            "URI new ({uri}) ({}): {canonical}",
            parent.map(Uri::canonical).unwrap_or_else(|| "none".into())
        );

        let policy = parent
            .map(|parent| parent.0.borrow().policy.clone())
            .unwrap_or_default();

        Ok(Self(Rc::new(RefCell::new(UriInner {
            canonical,
            scheme,
            output: Output::Unset,
            policy,
            sig_uri: None,
            transfer: Transfer::Idle,
            finished: None,
        }))))
    }

    pub fn canonical(&self) -> String {
        self.0.borrow().canonical.clone()
    }

    pub fn scheme(&self) -> Scheme {
        self.0.borrow().scheme
    }

    pub fn is_local(&self) -> bool {
        self.scheme().is_local()
    }

    /// Unix path of a `file` URI. Calling this on any other scheme is a
    /// programmer error.
    pub fn file_path(&self) -> PathBuf {
        let inner = self.0.borrow();
        assert!(
            matches!(inner.scheme, Scheme::File),
            "called file_path on URI of scheme: {}",
            inner.scheme
        );
        Url::parse(&inner.canonical)
            .ok()
            .and_then(|url| url.to_file_path().ok())
            .unwrap_or_else(|| panic!("URI to Unix path conversion failed for: {}", inner.canonical))
    }

    /// Send retrieved content to `path`. Exactly one output may be
    /// configured, before registration.
    pub fn set_output_file(&self, path: impl Into<PathBuf>) -> Result<(), Error> {
        self.0.borrow().output_guard();

        let path = path.into();
        let file = std::fs::File::create(&path).map_err(|e| Error::OutputOpen(e.to_string()))?;

        self.0.borrow_mut().output = Output::File { path, file };
        Ok(())
    }

    /// Send retrieved content to a fresh temporary file created from a
    /// `mkstemp`-style template (`/tmp/pkgXXXXXX`).
    pub fn set_output_tempfile(&self, template: &str) -> Result<(), Error> {
        self.0.borrow().output_guard();

        let path = Path::new(template);
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let prefix = name.trim_end_matches('X').to_string();
        let random = (name.len() - prefix.len()).max(6);
        let dir = match path.parent() {
            Some(parent) if parent != Path::new("") => parent.to_path_buf(),
            _ => std::env::temp_dir(),
        };

        let temp = tempfile::Builder::new()
            .prefix(&prefix)
            .rand_bytes(random)
            .tempfile_in(dir)
            .map_err(|e| Error::OutputOpen(e.to_string()))?;

        self.0.borrow_mut().output = Output::Temp(temp);
        Ok(())
    }

    pub fn set_ssl_verify(&self, verify: bool) {
        let mut inner = self.0.borrow_mut();
        inner.config_guard();
        trace!("URI ssl verify ({}): {verify}", inner.canonical);
        inner.policy.ssl_verify = verify;
    }

    pub fn set_ocsp(&self, enabled: bool) {
        let mut inner = self.0.borrow_mut();
        inner.config_guard();
        trace!("URI OCSP ({}): {enabled}", inner.canonical);
        inner.policy.ocsp = enabled;
    }

    pub fn set_ca_pin(&self, enabled: bool) {
        let mut inner = self.0.borrow_mut();
        inner.config_guard();
        trace!("URI CA pin ({}): {enabled}", inner.canonical);
        inner.policy.ca_pin = enabled;
    }

    /// Add a local URI to CA or CRL material trusted for this transfer
    pub fn add_pem(&self, pem_uri: &str) -> Result<(), Error> {
        self.0.borrow().config_guard();

        let uri = Uri::new(pem_uri, None)?;
        if !uri.is_local() {
            return Err(Error::NonlocalConfigUri(uri.canonical()));
        }

        let mut inner = self.0.borrow_mut();
        trace!("URI added PEM ({}): {}", inner.canonical, uri.canonical());
        inner.policy.pems.push(Rc::new(PemEntry {
            uri,
            resolved: RefCell::new(None),
        }));
        Ok(())
    }

    pub fn clear_pems(&self) {
        let mut inner = self.0.borrow_mut();
        inner.config_guard();
        inner.policy.pems.clear();
    }

    /// Add a local URI to a public key trusted to sign this content.
    /// Configuring any pubkey implies fetching a signature URI.
    pub fn add_pubkey(&self, key_uri: &str) -> Result<(), Error> {
        self.0.borrow().config_guard();

        let uri = Uri::new(key_uri, None)?;
        if !uri.is_local() {
            return Err(Error::NonlocalConfigUri(uri.canonical()));
        }

        let mut inner = self.0.borrow_mut();
        trace!("URI added pubkey ({}): {}", inner.canonical, uri.canonical());
        inner.policy.pubkeys.push(Rc::new(KeyEntry {
            uri,
            resolved: RefCell::new(None),
        }));
        Ok(())
    }

    pub fn clear_pubkeys(&self) {
        let mut inner = self.0.borrow_mut();
        inner.config_guard();
        inner.policy.pubkeys.clear();
    }

    /// Set the signature URI explicitly; `None` derives `<uri>.sig`.
    ///
    /// The signature URI snapshots this URI's policy now; subsequent
    /// configuration changes do not propagate, so call this last.
    pub fn set_sig(&self, sig_uri: Option<&str>) -> Result<(), Error> {
        self.0.borrow().config_guard();

        let sig_str = match sig_uri {
            Some(sig) => sig.to_string(),
            None => format!("{}.sig", self.0.borrow().canonical),
        };
        let sig = Uri::new(&sig_str, Some(self))?;
        // No pubkeys on the signature itself, that way lies recursion
        sig.clear_pubkeys();
        trace!("URI signature set ({}): {}", self.canonical(), sig.canonical());

        self.0.borrow_mut().sig_uri = Some(sig);
        Ok(())
    }

    fn ensure_default_sig(&self) {
        let needed = {
            let inner = self.0.borrow();
            !inner.policy.pubkeys.is_empty() && inner.sig_uri.is_none()
        };
        if needed {
            self.set_sig(None)
                .expect("URI creation passed so signature creation should not cause error");
        }
    }

    fn ensure_output(&self) {
        let mut inner = self.0.borrow_mut();
        if matches!(inner.output, Output::Unset) {
            inner.output = Output::Buffer(Vec::new());
        }
    }

    /// Attach this URI (and, transitively, its signature URI) to the
    /// downloader. Local URIs are accepted and ignored.
    pub fn register(&self, downloader: &mut Downloader) -> Result<(), Error> {
        {
            let inner = self.0.borrow();
            assert!(
                matches!(inner.transfer, Transfer::Idle) && inner.finished.is_none(),
                "({}) URI can be registered only once",
                inner.canonical
            );
        }
        if self.is_local() {
            return Ok(());
        }

        self.ensure_output();
        self.ensure_default_sig();

        let client = {
            let inner = self.0.borrow();
            downloader
                .client_for(&inner.policy)
                .map_err(Error::DownloadFailed)?
        };

        // Register the signature first so its failure leaves this URI untouched
        let sig = {
            let inner = self.0.borrow();
            (!inner.policy.pubkeys.is_empty())
                .then(|| inner.sig_uri.clone())
                .flatten()
        };
        if let Some(sig) = sig {
            if let Err(source) = sig.register(downloader) {
                return Err(Error::Signature {
                    uri: sig.canonical(),
                    source: Box::new(source),
                });
            }
        }

        downloader.enqueue(self.clone(), client);
        self.0.borrow_mut().transfer = Transfer::Registered;
        Ok(())
    }

    /// Ensure the URI is retrieved and hand back its content.
    ///
    /// Local URIs materialize here; remote ones must have completed a
    /// downloader run. The outcome is terminal: repeated calls return
    /// the same result without refetching, and failed verification
    /// removes a partially written output file.
    pub fn finish(&self) -> Result<Content, Error> {
        if let Some(outcome) = &self.0.borrow().finished {
            return outcome.clone();
        }

        let outcome = self.finish_inner();
        self.0.borrow_mut().finished = Some(outcome.clone());
        outcome
    }

    fn finish_inner(&self) -> Result<Content, Error> {
        trace!("URI finish: {}", self.canonical());

        if self.is_local() {
            self.ensure_output();
            self.ensure_default_sig();

            let bytes = match self.scheme() {
                Scheme::File => {
                    std::fs::read(self.file_path()).map_err(|e| Error::FileInput(e.to_string()))?
                }
                Scheme::Data => decode_data(&self.canonical())?,
                _ => unreachable!("local scheme"),
            };

            let mut output = self.take_output();
            let written = output.write(&bytes);
            self.put_output(output);
            written.map_err(|e| Error::OutputWrite(e.to_string()))?;
        } else {
            let state = self.0.borrow().transfer.clone();
            match state {
                Transfer::Idle | Transfer::Registered => return Err(Error::UnfinishedDownload),
                Transfer::Done(Err(message)) => return Err(Error::DownloadFailed(message)),
                Transfer::Done(Ok(())) => {}
            }
        }

        self.verify_signature()?;
        self.materialize()
    }

    fn verify_signature(&self) -> Result<(), Error> {
        let (sig, keys) = {
            let inner = self.0.borrow();
            if inner.policy.pubkeys.is_empty() {
                return Ok(());
            }
            let sig = inner
                .sig_uri
                .clone()
                .expect("signature URI set when pubkeys are configured");
            (sig, inner.policy.pubkeys.clone())
        };

        let sig_bytes = match sig.finish().and_then(|content| content_bytes(&content)) {
            Ok(bytes) => bytes,
            Err(source) => {
                self.discard_output();
                return Err(Error::Signature {
                    uri: sig.canonical(),
                    source: Box::new(source),
                });
            }
        };

        let keys: Vec<_> = keys.iter().filter_map(|entry| entry.key()).collect();
        let data = self.output_bytes()?;

        if let Err(error) = signature::verify(&data, &sig_bytes, &keys) {
            debug!("URI ({}) verify failed: {error}", self.canonical());
            self.discard_output();
            return Err(Error::VerifyFailed(error));
        }

        Ok(())
    }

    /// Read back whatever the sink holds, for verification
    fn output_bytes(&self) -> Result<Vec<u8>, Error> {
        let inner = self.0.borrow();
        match &inner.output {
            Output::Buffer(bytes) => Ok(bytes.clone()),
            Output::File { path, .. } => {
                std::fs::read(path).map_err(|e| Error::OutputWrite(e.to_string()))
            }
            Output::Temp(temp) => {
                std::fs::read(temp.path()).map_err(|e| Error::OutputWrite(e.to_string()))
            }
            Output::Unset | Output::Taken => unreachable!("output present after retrieval"),
        }
    }

    fn materialize(&self) -> Result<Content, Error> {
        let mut inner = self.0.borrow_mut();
        match std::mem::replace(&mut inner.output, Output::Taken) {
            Output::Buffer(bytes) => Ok(Content::Buffer(bytes)),
            Output::File { path, file } => {
                drop(file);
                Ok(Content::File(path))
            }
            Output::Temp(temp) => {
                let (_, path) = temp.keep().map_err(|e| Error::OutputWrite(e.to_string()))?;
                Ok(Content::File(path))
            }
            Output::Unset | Output::Taken => unreachable!("output present after retrieval"),
        }
    }

    /// Drop a partially written output after a failed verification
    fn discard_output(&self) {
        let mut inner = self.0.borrow_mut();
        match std::mem::replace(&mut inner.output, Output::Taken) {
            Output::File { path, file } => {
                drop(file);
                let _ = std::fs::remove_file(path);
            }
            // NamedTempFile removes itself on drop
            _ => {}
        }
    }

    pub(crate) fn take_output(&self) -> Output {
        std::mem::replace(&mut self.0.borrow_mut().output, Output::Taken)
    }

    pub(crate) fn put_output(&self, output: Output) {
        self.0.borrow_mut().output = output;
    }

    pub(crate) fn mark_done(&self, result: Result<(), String>) {
        self.0.borrow_mut().transfer = Transfer::Done(result);
    }
}

impl UriInner {
    fn config_guard(&self) {
        assert!(
            matches!(self.transfer, Transfer::Idle) && self.finished.is_none(),
            "({}) URI configuration can't be changed after register and finish",
            self.canonical
        );
    }

    fn output_guard(&self) {
        assert!(
            matches!(self.output, Output::Unset) && self.finished.is_none(),
            "({}) URI output can't be changed",
            self.canonical
        );
    }
}

fn content_bytes(content: &Content) -> Result<Vec<u8>, Error> {
    match content {
        Content::Buffer(bytes) => Ok(bytes.clone()),
        Content::File(path) => std::fs::read(path).map_err(|e| Error::FileInput(e.to_string())),
    }
}

/// Resolve and normalize a URI reference.
///
/// An explicit scheme makes the reference absolute; a schemeless
/// reference resolves against a parent of the same scheme, or against
/// the current working directory (captured once) for the `file`
/// default. Dot segments are removed before the string is stored.
fn canonicalize(input: &str, parent: Option<&Uri>) -> Result<(String, Scheme), Error> {
    match split_scheme(input) {
        Some((scheme_str, rest)) => {
            let scheme = Scheme::parse(scheme_str)
                .ok_or_else(|| Error::UnknownScheme(input.to_string()))?;
            match scheme {
                Scheme::Data => Ok((format!("data:{rest}"), scheme)),
                Scheme::File => {
                    let url =
                        Url::parse(input).map_err(|_| Error::InvalidUri(input.to_string()))?;
                    Ok((url.to_string(), scheme))
                }
                Scheme::Http | Scheme::Https if rest.starts_with("//") => {
                    let url =
                        Url::parse(input).map_err(|_| Error::InvalidUri(input.to_string()))?;
                    Ok((url.to_string(), scheme))
                }
                // Authority-less form stays scheme-relative
                Scheme::Http | Scheme::Https => {
                    Ok((format!("{scheme}:{}", remove_dot_segments(rest)), scheme))
                }
            }
        }
        None => {
            let (base, scheme) = match parent {
                Some(parent) => (parent.canonical(), parent.scheme()),
                None => (cwd_base()?, Scheme::File),
            };
            match scheme {
                Scheme::Data => Ok((format!("data:{}", remove_dot_segments(input)), scheme)),
                _ => {
                    let url = Url::parse(&base)
                        .and_then(|base| base.join(input))
                        .map_err(|_| Error::InvalidUri(input.to_string()))?;
                    Ok((url.to_string(), scheme))
                }
            }
        }
    }
}

/// Split `scheme:rest`, accepting only RFC 3986 scheme syntax
fn split_scheme(input: &str) -> Option<(&str, &str)> {
    let colon = input.find(':')?;
    let (scheme, rest) = input.split_at(colon);

    let mut chars = scheme.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) {
        return None;
    }

    Some((scheme, &rest[1..]))
}

/// RFC 3986 §5.2.4 dot-segment removal
fn remove_dot_segments(path: &str) -> String {
    let mut input = path.to_string();
    let mut output = String::new();

    while !input.is_empty() {
        if input.starts_with("../") {
            input.drain(..3);
        } else if input.starts_with("./") {
            input.drain(..2);
        } else if input.starts_with("/./") {
            input.replace_range(..3, "/");
        } else if input == "/." {
            input = "/".to_string();
        } else if input.starts_with("/../") {
            input.replace_range(..4, "/");
            pop_segment(&mut output);
        } else if input == "/.." {
            input = "/".to_string();
            pop_segment(&mut output);
        } else if input == "." || input == ".." {
            input.clear();
        } else {
            let start = usize::from(input.starts_with('/'));
            let end = input[start..]
                .find('/')
                .map(|i| i + start)
                .unwrap_or(input.len());
            output.push_str(&input[..end]);
            input.drain(..end);
        }
    }

    output
}

fn pop_segment(output: &mut String) {
    match output.rfind('/') {
        Some(index) => output.truncate(index),
        None => output.clear(),
    }
}

/// File-scheme base for relative references, taken once per process
fn cwd_base() -> Result<String, Error> {
    static CWD: OnceLock<Option<String>> = OnceLock::new();
    CWD.get_or_init(|| {
        let cwd = std::env::current_dir().ok()?;
        Url::from_directory_path(cwd).ok().map(String::from)
    })
    .clone()
    .ok_or_else(|| Error::InvalidUri("current working directory".to_string()))
}

/// Decode the payload of a `data:` URI. Comma-separated parameters
/// before the payload are scanned for `base64`; unknown parameters are
/// ignored for compatibility.
fn decode_data(canonical: &str) -> Result<Vec<u8>, Error> {
    let mut rest = canonical.strip_prefix("data:").expect("data scheme");

    let mut is_base64 = false;
    while let Some(index) = rest.find(',') {
        if rest[..index].starts_with("base64") {
            is_base64 = true;
        }
        rest = &rest[index + 1..];
    }

    if is_base64 {
        BASE64_STANDARD
            .decode(rest.as_bytes())
            .map_err(|_| Error::InvalidUri(canonical.to_string()))
    } else {
        Ok(rest.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn file_uri(path: &Path) -> String {
        Url::from_file_path(path).unwrap().to_string()
    }

    #[test]
    fn data_uri_buffer() {
        let uri = Uri::new("data:,HelloWorld!", None).unwrap();
        let content = uri.finish().unwrap().into_buffer().unwrap();
        assert_eq!(content, b"HelloWorld!");
        assert_eq!(content.len(), 11);
    }

    #[test]
    fn data_uri_base64() {
        let uri = Uri::new("data:base64,SGVsbG9Xb3JsZCE=", None).unwrap();
        assert_eq!(uri.finish().unwrap().into_buffer().unwrap(), b"HelloWorld!");
    }

    #[test]
    fn parent_inheritance() {
        let parent = Uri::new("file:///dev/null", None).unwrap();
        let child = Uri::new("./test", Some(&parent)).unwrap();
        assert_eq!(child.canonical(), "file:///dev/test");
        assert_eq!(child.scheme(), Scheme::File);
    }

    #[test]
    fn scheme_mismatch_ignores_parent() {
        let parent = Uri::new("file:///dev/null", None).unwrap();
        let child = Uri::new("http:./test", Some(&parent)).unwrap();
        assert_eq!(child.canonical(), "http:test");
        assert_eq!(child.scheme(), Scheme::Http);
    }

    #[test]
    fn canonicalization_is_idempotent() {
        for raw in [
            "data:,HelloWorld!",
            "http://example.com/a/../b",
            "http:./test",
            "file:///dev/test",
        ] {
            let first = Uri::new(raw, None).unwrap().canonical();
            let second = Uri::new(&first, None).unwrap().canonical();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn unknown_scheme() {
        assert!(matches!(
            Uri::new("gopher://example.com", None),
            Err(Error::UnknownScheme(_))
        ));
    }

    #[test]
    fn file_read_to_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input");
        std::fs::write(&path, b"file payload").unwrap();

        let uri = Uri::new(&file_uri(&path), None).unwrap();
        assert_eq!(uri.finish().unwrap().into_buffer().unwrap(), b"file payload");
    }

    #[test]
    fn file_read_to_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::write(&src, b"copied").unwrap();

        let uri = Uri::new(&file_uri(&src), None).unwrap();
        uri.set_output_file(&dst).unwrap();

        let content = uri.finish().unwrap();
        assert_eq!(content.path(), Some(dst.as_path()));
        assert_eq!(std::fs::read(&dst).unwrap(), b"copied");
    }

    #[test]
    fn missing_file_is_input_error() {
        let uri = Uri::new("file:///nonexistent/surely/not", None).unwrap();
        assert!(matches!(uri.finish(), Err(Error::FileInput(_))));
    }

    #[test]
    fn policy_copied_by_value() {
        let parent = Uri::new("https://example.com/repo/", None).unwrap();
        parent.set_ssl_verify(false);

        let child = Uri::new("packages", Some(&parent)).unwrap();
        parent.set_ssl_verify(true);

        assert!(!child.0.borrow().policy.ssl_verify);
        assert!(parent.0.borrow().policy.ssl_verify);
    }

    #[test]
    fn key_lists_shared_until_construction() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("key.pub");
        std::fs::write(&key_path, b"comment\nAAAA\n").unwrap();

        let parent = Uri::new("https://example.com/repo/", None).unwrap();
        parent.add_pubkey(&file_uri(&key_path)).unwrap();

        let child = Uri::new("packages", Some(&parent)).unwrap();
        parent.add_pubkey(&file_uri(&key_path)).unwrap();

        assert_eq!(child.0.borrow().policy.pubkeys.len(), 1);
        assert_eq!(parent.0.borrow().policy.pubkeys.len(), 2);
        // The first node is the same refcounted entry
        assert!(Rc::ptr_eq(
            &child.0.borrow().policy.pubkeys[0],
            &parent.0.borrow().policy.pubkeys[0]
        ));
    }

    #[test]
    fn nonlocal_config_uri_rejected() {
        let uri = Uri::new("https://example.com/pkg", None).unwrap();
        assert!(matches!(
            uri.add_pubkey("https://example.com/key.pub"),
            Err(Error::NonlocalConfigUri(_))
        ));
        assert!(matches!(
            uri.add_pem("http://example.com/bundle.pem"),
            Err(Error::NonlocalConfigUri(_))
        ));
    }

    #[test]
    fn default_signature_is_derived() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("key.pub");
        std::fs::write(&key_path, b"comment\nAAAA\n").unwrap();

        let uri = Uri::new("https://example.com/pkg", None).unwrap();
        uri.add_pubkey(&file_uri(&key_path)).unwrap();
        uri.ensure_default_sig();

        let sig = uri.0.borrow().sig_uri.clone().unwrap();
        assert_eq!(sig.canonical(), "https://example.com/pkg.sig");
        assert!(sig.0.borrow().policy.pubkeys.is_empty());
    }

    #[test]
    fn verified_local_fetch() {
        use super::signature::test::{public_key_envelope, signature_envelope, test_key};

        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("index");
        let key = test_key();
        let fingerprint = [7u8; 8];

        std::fs::write(&data_path, b"index contents").unwrap();
        std::fs::write(
            dir.path().join("index.sig"),
            signature_envelope(&key, &fingerprint, b"index contents"),
        )
        .unwrap();
        let key_path = dir.path().join("repo.pub");
        std::fs::write(&key_path, public_key_envelope(&key, &fingerprint)).unwrap();

        let uri = Uri::new(&file_uri(&data_path), None).unwrap();
        uri.add_pubkey(&file_uri(&key_path)).unwrap();

        assert_eq!(uri.finish().unwrap().into_buffer().unwrap(), b"index contents");
    }

    #[test]
    fn failed_verification_removes_tempfile_and_is_terminal() {
        use super::signature::test::{public_key_envelope, signature_envelope, test_key};

        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("index");
        let key = test_key();
        let fingerprint = [7u8; 8];

        std::fs::write(&data_path, b"tampered contents").unwrap();
        std::fs::write(
            dir.path().join("index.sig"),
            signature_envelope(&key, &fingerprint, b"original contents"),
        )
        .unwrap();
        let key_path = dir.path().join("repo.pub");
        std::fs::write(&key_path, public_key_envelope(&key, &fingerprint)).unwrap();

        let uri = Uri::new(&file_uri(&data_path), None).unwrap();
        uri.add_pubkey(&file_uri(&key_path)).unwrap();
        uri.set_output_tempfile(&format!("{}/outXXXXXX", dir.path().display()))
            .unwrap();

        assert!(matches!(uri.finish(), Err(Error::VerifyFailed(_))));
        // Partial output removed, error cached without refetching
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("out"))
            .collect();
        assert!(leftovers.is_empty());
        assert!(matches!(uri.finish(), Err(Error::VerifyFailed(_))));
    }

    #[test]
    fn missing_signature_is_reported_as_signature_failure() {
        use super::signature::test::{public_key_envelope, test_key};

        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("index");
        std::fs::write(&data_path, b"contents").unwrap();
        let key_path = dir.path().join("repo.pub");
        std::fs::write(&key_path, public_key_envelope(&test_key(), &[7u8; 8])).unwrap();

        let uri = Uri::new(&file_uri(&data_path), None).unwrap();
        uri.add_pubkey(&file_uri(&key_path)).unwrap();

        assert!(matches!(uri.finish(), Err(Error::Signature { .. })));
    }

    #[test]
    #[should_panic(expected = "URI output can't be changed")]
    fn output_cannot_be_reconfigured() {
        let dir = tempfile::tempdir().unwrap();
        let uri = Uri::new("data:,x", None).unwrap();
        uri.set_output_file(dir.path().join("a")).unwrap();
        let _ = uri.set_output_file(dir.path().join("b"));
    }

    #[test]
    fn dot_segment_removal() {
        assert_eq!(remove_dot_segments("./test"), "test");
        assert_eq!(remove_dot_segments("a/b/../c"), "a/c");
        assert_eq!(remove_dot_segments("/a/./b/."), "/a/b/");
        assert_eq!(remove_dot_segments("../up"), "up");
    }
}
