//! Resumable downloader

use futures::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{StatusCode, Url};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{ClientError, TransferClient};

/// Outcome of one request in a download
enum Stretch {
    /// The server had nothing left to send
    Finished,
    /// The connection broke; `progressed` tells whether any bytes arrived
    Broken { message: String, progressed: bool },
}

/// Streams a file into a sink, resuming with a `Range` request whenever the
/// transfer breaks.
///
/// Bytes are written and flushed before the offset moves, so the offset
/// always names the first byte the sink is missing.
pub struct Downloader<'a> {
    client: &'a TransferClient,
    offset: u64,
}

impl<'a> Downloader<'a> {
    pub(crate) fn new(client: &'a TransferClient) -> Self {
        Self { client, offset: 0 }
    }

    /// Resume after `offset` bytes the sink already holds
    pub fn starting_at(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Bytes written to the sink so far, counting any resumed prefix
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Download `location` (a URL or a server path) into `sink`.
    ///
    /// Returns the total size once the server has sent the last byte.
    pub async fn download<W>(&mut self, location: &str, sink: &mut W) -> Result<u64, ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        let client = self.client;
        let config = client.config();
        let url = client.resolve(location)?;
        let mut failures: u32 = 0;

        loop {
            let (message, progressed) = match self.fetch(&url, sink).await? {
                Stretch::Finished => {
                    tracing::info!(url = %url, byte_size = self.offset, "Download complete");
                    return Ok(self.offset);
                }
                Stretch::Broken { message, progressed } => (message, progressed),
            };

            if progressed {
                failures = 0;
            }
            failures += 1;

            if failures > config.max_retries {
                return Err(ClientError::Transport {
                    attempts: failures,
                    message,
                });
            }

            tracing::warn!(
                offset = self.offset,
                failures,
                error = %message,
                "Download interrupted, resuming"
            );
            tokio::time::sleep(config.retry_delay).await;
        }
    }

    async fn fetch<W>(&mut self, url: &Url, sink: &mut W) -> Result<Stretch, ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut request = self.client.http.get(url.clone());
        if self.offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", self.offset));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return Ok(Stretch::Broken {
                    message: e.to_string(),
                    progressed: false,
                })
            }
        };

        match response.status() {
            StatusCode::OK if self.offset > 0 => {
                return Err(ClientError::Protocol(
                    "server ignored the range request".to_string(),
                ));
            }
            StatusCode::OK => {}
            StatusCode::PARTIAL_CONTENT => {
                let start = content_range_start(&response);
                if start != Some(self.offset) {
                    return Err(ClientError::Protocol(format!(
                        "server resumed at {:?}, expected {}",
                        start, self.offset
                    )));
                }
            }
            StatusCode::RANGE_NOT_SATISFIABLE
                if self.offset > 0 && content_range_total(&response) == Some(self.offset) =>
            {
                // The sink already holds the whole file
                return Ok(Stretch::Finished);
            }
            s if s.is_server_error() => {
                return Ok(Stretch::Broken {
                    message: format!("server returned {}", s),
                    progressed: false,
                });
            }
            _ => return Err(ClientError::rejected(response).await),
        }

        let mut stream = response.bytes_stream();
        let mut progressed = false;

        while let Some(item) = stream.next().await {
            let bytes = match item {
                Ok(bytes) => bytes,
                Err(e) => {
                    return Ok(Stretch::Broken {
                        message: e.to_string(),
                        progressed,
                    })
                }
            };

            sink.write_all(&bytes).await?;
            sink.flush().await?;
            self.offset += bytes.len() as u64;
            progressed = true;
        }

        Ok(Stretch::Finished)
    }
}

fn content_range(response: &reqwest::Response) -> Option<&str> {
    response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("bytes "))
}

/// `N` out of `bytes N-M/T`
fn content_range_start(response: &reqwest::Response) -> Option<u64> {
    let (range, _) = content_range(response)?.split_once('/')?;
    range.split_once('-')?.0.parse().ok()
}

/// `T` out of `bytes */T` or `bytes N-M/T`
fn content_range_total(response: &reqwest::Response) -> Option<u64> {
    content_range(response)?.split_once('/')?.1.parse().ok()
}
