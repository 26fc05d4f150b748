//! Chunked uploader

use bytes::Bytes;
use reqwest::header::{HeaderValue, LOCATION};
use reqwest::multipart::{Form, Part};
use reqwest::{StatusCode, Url};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{ClientError, TransferClient};
use crate::upload::{
    CHUNK_SIZE, EXPIRY_FIELD, FILE_FIELD, FILE_NAME_FIELD, UPLOAD_COMPLETE, UPLOAD_OFFSET,
};

/// What the server made of one chunk
enum ChunkReply {
    /// More chunks expected at this location
    Continue(Url),
    /// Upload finished; the file can be downloaded here
    Done(Url),
}

/// Why a single attempt failed
enum AttemptError {
    /// Worth sending the same chunk again
    Retry(String),
    Fatal(ClientError),
}

/// Sends one input stream as a sequence of chunks.
///
/// The offset only advances once the server has confirmed a chunk, so a
/// failed chunk is always resent from the same position.
pub struct Uploader<'a> {
    client: &'a TransferClient,
    location: Option<Url>,
    offset: u64,
    expiry_date: Option<String>,
    file_name: Option<String>,
}

impl<'a> Uploader<'a> {
    pub(crate) fn new(client: &'a TransferClient) -> Self {
        Self {
            client,
            location: None,
            offset: 0,
            expiry_date: None,
            file_name: None,
        }
    }

    /// Expiry date to request (`YYYY-MM-DD`)
    pub fn with_expiry_date(mut self, date: impl Into<String>) -> Self {
        self.expiry_date = Some(date.into());
        self
    }

    /// Opaque display name stored next to the file
    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    /// Bytes the server has confirmed so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Continuation location of an unfinished upload
    pub fn location(&self) -> Option<&Url> {
        self.location.as_ref()
    }

    /// Upload everything `reader` yields and return the download URL
    pub async fn upload<R>(&mut self, mut reader: R) -> Result<Url, ClientError>
    where
        R: AsyncRead + Unpin,
    {
        let chunk_size = self.client.config().chunk_size;
        let mut current = read_chunk(&mut reader, chunk_size).await?;

        loop {
            // Read one chunk ahead so an input that is an exact multiple of
            // the chunk size still flags its last chunk as final
            let next = if current.len() < chunk_size {
                Bytes::new()
            } else {
                read_chunk(&mut reader, chunk_size).await?
            };
            let last = next.is_empty();

            match self.send_chunk(current, last).await? {
                ChunkReply::Done(url) => {
                    tracing::info!(url = %url, byte_size = self.offset, "Upload complete");
                    return Ok(url);
                }
                ChunkReply::Continue(location) => {
                    if last {
                        return Err(ClientError::Protocol(
                            "server did not complete the upload after the final chunk".to_string(),
                        ));
                    }
                    self.location = Some(location);
                }
            }

            current = next;
        }
    }

    async fn send_chunk(&mut self, data: Bytes, last: bool) -> Result<ChunkReply, ClientError> {
        let client = self.client;
        let config = client.config();
        let len = data.len() as u64;
        let mut attempt: u32 = 0;

        loop {
            let is_retry = attempt > 0;

            match self.attempt(data.clone(), last, is_retry).await {
                Ok(reply) => {
                    self.offset += len;
                    tracing::debug!(offset = self.offset, last, "Chunk accepted");
                    return Ok(reply);
                }
                Err(AttemptError::Retry(message)) if attempt < config.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        offset = self.offset,
                        attempt,
                        max_retries = config.max_retries,
                        error = %message,
                        "Chunk failed, retrying"
                    );
                    tokio::time::sleep(config.retry_delay).await;
                }
                Err(AttemptError::Retry(message)) => {
                    return Err(ClientError::Transport {
                        attempts: attempt + 1,
                        message,
                    });
                }
                Err(AttemptError::Fatal(e)) => return Err(e),
            }
        }
    }

    async fn attempt(&self, data: Bytes, last: bool, is_retry: bool) -> Result<ChunkReply, AttemptError> {
        let client = self.client;
        let len = data.len() as u64;

        let part = Part::stream_with_length(data, len).file_name("blob");
        let mut form = Form::new().part(FILE_FIELD, part);

        let mut request = match &self.location {
            None => {
                if let Some(date) = &self.expiry_date {
                    form = form.text(EXPIRY_FIELD, date.clone());
                }
                if let Some(name) = &self.file_name {
                    form = form.text(FILE_NAME_FIELD, name.clone());
                }

                let url = client.resolve("upload").map_err(AttemptError::Fatal)?;
                client
                    .http
                    .post(url)
                    .header(CHUNK_SIZE, client.config().chunk_size.to_string())
            }
            Some(location) => client
                .http
                .patch(location.clone())
                .header(UPLOAD_OFFSET, self.offset.to_string()),
        };

        let complete = if last { "?1" } else { "?0" };
        request = request.header(UPLOAD_COMPLETE, HeaderValue::from_static(complete));

        let response = request
            .multipart(form)
            .send()
            .await
            .map_err(|e| AttemptError::Retry(e.to_string()))?;

        let status = response.status();

        match status {
            StatusCode::SEE_OTHER => self.location_of(&response).map(ChunkReply::Done),
            StatusCode::ACCEPTED => {
                let expected = self.offset + len;
                if let Some(offset) = header_u64(&response, UPLOAD_OFFSET) {
                    if offset != expected {
                        return Err(AttemptError::Fatal(ClientError::Protocol(format!(
                            "server reports offset {} after chunk, expected {}",
                            offset, expected
                        ))));
                    }
                }
                self.location_of(&response).map(ChunkReply::Continue)
            }
            StatusCode::CONFLICT if is_retry => {
                // An earlier attempt may have landed with its reply lost
                let landed = header_u64(&response, UPLOAD_OFFSET) == Some(self.offset + len);
                match (&self.location, landed) {
                    (Some(location), true) if !last => {
                        tracing::info!(offset = self.offset, "Chunk already stored by earlier attempt");
                        Ok(ChunkReply::Continue(location.clone()))
                    }
                    _ => Err(AttemptError::Fatal(ClientError::rejected(response).await)),
                }
            }
            s if s.is_server_error() => Err(AttemptError::Retry(format!("server returned {}", s))),
            _ => Err(AttemptError::Fatal(ClientError::rejected(response).await)),
        }
    }

    fn location_of(&self, response: &reqwest::Response) -> Result<Url, AttemptError> {
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                AttemptError::Fatal(ClientError::Protocol(format!(
                    "{} response without Location header",
                    response.status()
                )))
            })?;

        self.client.resolve(location).map_err(AttemptError::Fatal)
    }
}

/// Read up to `size` bytes, stopping early only at end of input
async fn read_chunk<R>(reader: &mut R, size: usize) -> Result<Bytes, ClientError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(size);
    reader.take(size as u64).read_to_end(&mut buf).await?;
    Ok(Bytes::from(buf))
}

fn header_u64(response: &reqwest::Response, name: &str) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}
