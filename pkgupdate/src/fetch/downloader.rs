// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

//! Multi-transfer scheduler for remote URIs.
//!
//! One downloader drives all registered transfers on the process
//! reactor, at most `parallel` in flight. The run stops at the first
//! failing transfer and reports it; later in-flight transfers may or
//! may not have completed, and untouched ones stay unfinished.

use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, trace};

use crate::environment;
use crate::fetch::{Policy, Uri};
use crate::runtime;

#[derive(Debug, Clone)]
pub struct DownloadOpts {
    /// Internal retries before a transfer is marked failed
    pub retries: u32,
    /// Whole-transfer deadline
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub follow_redirects: bool,
    pub user_agent: String,
}

impl Default for DownloadOpts {
    fn default() -> Self {
        Self {
            retries: 3,
            timeout: Duration::from_secs(3600),
            connect_timeout: Duration::from_secs(60),
            follow_redirects: true,
            user_agent: format!("{}/{}", environment::NAME, environment::VERSION),
        }
    }
}

pub struct Downloader {
    parallel: usize,
    opts: DownloadOpts,
    queue: Vec<(Uri, reqwest::Client)>,
}

impl Downloader {
    /// Construct a scheduler with an upper bound on concurrent transfers
    pub fn new(parallel: usize) -> Self {
        Self::with_opts(parallel, DownloadOpts::default())
    }

    pub fn with_opts(parallel: usize, opts: DownloadOpts) -> Self {
        trace!("Downloader allocation");
        Self {
            parallel: parallel.max(1),
            opts,
            queue: Vec::new(),
        }
    }

    /// Build a client honoring the URI's TLS policy
    pub(crate) fn client_for(&self, policy: &Policy) -> Result<reqwest::Client, String> {
        let mut builder = reqwest::Client::builder()
            .user_agent(&self.opts.user_agent)
            .timeout(self.opts.timeout)
            .connect_timeout(self.opts.connect_timeout)
            .redirect(if self.opts.follow_redirects {
                reqwest::redirect::Policy::limited(10)
            } else {
                reqwest::redirect::Policy::none()
            });

        if policy.ssl_verify {
            if policy.ca_pin {
                // Certificate pinning: nothing from the system store
                builder = builder.tls_built_in_root_certs(false);
            }
            for pem in &policy.pems {
                for certificate in pem.certificates() {
                    builder = builder.add_root_certificate(certificate);
                }
            }
        } else {
            builder = builder.danger_accept_invalid_certs(true);
        }

        builder.build().map_err(|error| error.to_string())
    }

    pub(crate) fn enqueue(&mut self, uri: Uri, client: reqwest::Client) {
        self.queue.push((uri, client));
    }

    /// Drive all registered transfers until they are terminal or one
    /// fails; the first failing URI is returned so the caller can query
    /// its error through `finish`.
    pub fn run(&mut self) -> Option<Uri> {
        trace!("Downloader run");
        let queue = std::mem::take(&mut self.queue);
        if queue.is_empty() {
            return None;
        }

        let retries = self.opts.retries;
        runtime::block_on(async {
            let mut transfers = futures_util::stream::iter(
                queue
                    .into_iter()
                    .map(|(uri, client)| transfer(uri, client, retries)),
            )
            .buffer_unordered(self.parallel);

            while let Some(outcome) = transfers.next().await {
                if let Err(failed) = outcome {
                    // Stop on first failure; remaining transfers are dropped
                    // and their URIs stay unfinished
                    return Some(failed);
                }
            }
            None
        })
    }
}

/// Run one transfer to completion, retrying internally
async fn transfer(uri: Uri, client: reqwest::Client, retries: u32) -> Result<(), Uri> {
    let url = uri.canonical();
    let mut output = uri.take_output();

    let mut last_error = String::new();
    let mut success = false;

    for attempt in 0..=retries {
        if attempt > 0 {
            debug!("Retrying download ({url}), attempt {}", attempt + 1);
            if let Err(error) = output.rewind() {
                last_error = error.to_string();
                break;
            }
        }

        match fetch_once(&client, &url, &mut output).await {
            Ok(()) => {
                debug!("Download successful ({url})");
                success = true;
                break;
            }
            Err(error) => {
                debug!("Download failed ({url}): {error}");
                last_error = error;
            }
        }
    }

    uri.put_output(output);
    if success {
        uri.mark_done(Ok(()));
        Ok(())
    } else {
        uri.mark_done(Err(last_error));
        Err(uri)
    }
}

async fn fetch_once(
    client: &reqwest::Client,
    url: &str,
    output: &mut crate::fetch::Output,
) -> Result<(), String> {
    let response = client
        .get(url)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|error| error.to_string())?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|error| error.to_string())?;
        output
            .write(&chunk)
            .map_err(|error| format!("Data write failed: {error}"))?;
    }

    Ok(())
}
