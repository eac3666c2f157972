//! HTTP(S) media source adapter.
//!
//! Blocking reqwest client. Opens use a `Range` header when resuming past
//! offset 0; mid-stream read failures reconnect at the current position a
//! bounded number of times before surfacing the error to the feeder.

use std::io::Read;
use std::time::Duration;

use anyhow::Context;
use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use tracing::{debug, warn};

use super::{MIN_ASYNC_BUFFER, SourceAdapter, SourceHandle};
use crate::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_RECONNECTS: u32 = 3;

pub struct HttpSource {
    client: Client,
    buffer_size: usize,
}

impl HttpSource {
    pub fn new(buffer_size: usize) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .build()
            .map_err(|e| Error::AdapterUnavailable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            buffer_size,
        })
    }
}

struct HttpHandle {
    client: Client,
    url: String,
    response: Option<Response>,
    content_pos: u64,
    content_len: u64,
    reconnects: u32,
}

fn connect(client: &Client, url: &str, offset: u64) -> anyhow::Result<(Response, u64)> {
    let mut req = client.get(url);
    if offset > 0 {
        req = req.header(RANGE, format!("bytes={offset}-"));
    }
    let resp = req.send().context("http request failed")?;
    if !resp.status().is_success() {
        anyhow::bail!("http status {}", resp.status());
    }

    // Total length: from Content-Range when resuming, else Content-Length.
    let total = if offset > 0 {
        resp.headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit('/').next())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
    } else {
        resp.headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
    };
    Ok((resp, total))
}

impl SourceAdapter for HttpSource {
    fn url_protocol(&self) -> &str {
        "http"
    }

    fn async_mode(&self) -> bool {
        true
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size.max(MIN_ASYNC_BUFFER)
    }

    fn open(&self, url: &str, offset: u64) -> Result<Box<dyn SourceHandle>> {
        debug!(url, offset, "opening http source");
        let (response, content_len) = connect(&self.client, url, offset)
            .map_err(|e| Error::msg(format!("{e:#}")))?;
        Ok(Box::new(HttpHandle {
            client: self.client.clone(),
            url: url.to_string(),
            response: Some(response),
            content_pos: offset,
            content_len,
            reconnects: 0,
        }))
    }
}

impl SourceHandle for HttpHandle {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let resp = match self.response.as_mut() {
                Some(r) => r,
                None => return Err(Error::msg("http stream closed")),
            };
            match resp.read(buf) {
                Ok(n) => {
                    self.content_pos += n as u64;
                    return Ok(n);
                }
                Err(e) => {
                    if self.reconnects >= MAX_RECONNECTS {
                        return Err(Error::msg(format!(
                            "http read failed after {} reconnects: {e}",
                            self.reconnects
                        )));
                    }
                    self.reconnects += 1;
                    warn!(
                        url = %self.url,
                        attempt = self.reconnects,
                        pos = self.content_pos,
                        "http read failed, reconnecting"
                    );
                    match connect(&self.client, &self.url, self.content_pos) {
                        Ok((resp, _)) => self.response = Some(resp),
                        Err(err) => {
                            self.response = None;
                            return Err(Error::msg(format!("{err:#}")));
                        }
                    }
                }
            }
        }
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        let (resp, total) = connect(&self.client, &self.url, offset)
            .map_err(|e| Error::msg(format!("{e:#}")))?;
        self.response = Some(resp);
        self.content_pos = offset;
        if total > 0 {
            self.content_len = total;
        }
        Ok(())
    }

    fn content_pos(&self) -> u64 {
        self.content_pos
    }

    fn content_len(&self) -> u64 {
        self.content_len
    }
}
