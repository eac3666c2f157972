//! M3U playlist expansion.
//!
//! Supports plain lists and `#EXTM3U` lists with `#EXTINF` / `#EXT-X-STREAM-INF`
//! directives. Entry URIs may be full, schemeless (`//host/...`), root-relative
//! (`/path`), or document-relative.

use std::sync::Arc;

use anyhow::Context;
use tracing::debug;

use crate::source::SourceAdapter;

const PLAYLIST_FETCH_SIZE: usize = 16 * 1024;

pub fn is_m3u(url: &str) -> bool {
    url.contains(".m3u")
}

/// Resolve one playlist entry against the playlist's own URL.
pub fn resolve_entry(base_url: &str, line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line.starts_with("http") {
        return Some(line.to_string());
    }
    if let Some(rest) = line.strip_prefix("//") {
        let scheme = if base_url.starts_with("https") { "https" } else { "http" };
        return Some(format!("{scheme}://{rest}"));
    }
    if line.starts_with('/') {
        // Keep scheme + host from the base.
        let scheme_end = base_url.find("//")? + 2;
        let host_end = base_url[scheme_end..]
            .find('/')
            .map(|i| scheme_end + i)
            .unwrap_or(base_url.len());
        return Some(format!("{}{}", &base_url[..host_end], line));
    }
    // Relative to the playlist's directory.
    let dir_end = base_url.rfind('/')?;
    Some(format!("{}/{}", &base_url[..dir_end], line))
}

/// Parse playlist text into resolved entry URLs.
pub fn parse_playlist(base_url: &str, content: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut is_valid_m3u = false;
    let mut entry_expected = false;

    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if !is_valid_m3u && line == "#EXTM3U" {
            is_valid_m3u = true;
            continue;
        }
        if line.starts_with("http") {
            // Bare URL lists are accepted without the #EXTM3U marker.
            is_valid_m3u = true;
            if let Some(url) = resolve_entry(base_url, line) {
                out.push(url);
            }
            continue;
        }
        if !is_valid_m3u {
            break;
        }
        if line.starts_with("#EXTINF") || line.starts_with("#EXT-X-STREAM-INF") {
            entry_expected = true;
            continue;
        }
        if line.starts_with('#') {
            // Unsupported directive; treat as comment.
            continue;
        }
        if entry_expected {
            entry_expected = false;
            if let Some(url) = resolve_entry(base_url, line) {
                out.push(url);
            }
        }
    }
    out
}

/// Fetch and parse a playlist through a source adapter.
pub fn fetch_playlist(adapter: &Arc<dyn SourceAdapter>, url: &str) -> anyhow::Result<Vec<String>> {
    let mut handle = adapter
        .open(url, 0)
        .with_context(|| format!("failed to open playlist {url}"))?;
    let mut content = vec![0u8; PLAYLIST_FETCH_SIZE];
    let mut filled = 0usize;
    while filled < content.len() {
        let n = handle.read(&mut content[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let text = String::from_utf8_lossy(&content[..filled]);
    let entries = parse_playlist(url, &text);
    debug!(url, entries = entries.len(), "resolved playlist");
    Ok(entries)
}

/// Resolve only the first media URL, for the header probe.
pub fn first_url(adapter: &Arc<dyn SourceAdapter>, url: &str) -> anyhow::Result<String> {
    fetch_playlist(adapter, url)?
        .into_iter()
        .next()
        .context("playlist has no entries")
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "http://radio.example.com/stations/pop/playlist.m3u";

    #[test]
    fn resolves_full_uri() {
        assert_eq!(
            resolve_entry(BASE, "http://cdn.example.com/a.mp3").as_deref(),
            Some("http://cdn.example.com/a.mp3")
        );
    }

    #[test]
    fn resolves_schemeless_uri() {
        assert_eq!(
            resolve_entry(BASE, "//cdn.example.com/a.mp3").as_deref(),
            Some("http://cdn.example.com/a.mp3")
        );
        let https_base = "https://radio.example.com/x.m3u";
        assert_eq!(
            resolve_entry(https_base, "//cdn.example.com/a.mp3").as_deref(),
            Some("https://cdn.example.com/a.mp3")
        );
    }

    #[test]
    fn resolves_root_relative_uri() {
        assert_eq!(
            resolve_entry(BASE, "/hits/b.mp3").as_deref(),
            Some("http://radio.example.com/hits/b.mp3")
        );
    }

    #[test]
    fn resolves_document_relative_uri() {
        assert_eq!(
            resolve_entry(BASE, "c.mp3").as_deref(),
            Some("http://radio.example.com/stations/pop/c.mp3")
        );
    }

    #[test]
    fn parses_extm3u_with_directives() {
        let content = "#EXTM3U\n#EXTINF:123,Artist - Song\nsong.mp3\n#EXT-X-STREAM-INF:BANDWIDTH=128000\n/live/stream.aac\n#EXT-X-SOMETHING\nignored.mp3\n";
        let urls = parse_playlist(BASE, content);
        assert_eq!(
            urls,
            vec![
                "http://radio.example.com/stations/pop/song.mp3".to_string(),
                "http://radio.example.com/live/stream.aac".to_string(),
            ]
        );
    }

    #[test]
    fn parses_bare_url_list() {
        let content = "http://a.example.com/1.mp3\r\nhttp://a.example.com/2.mp3\r\n";
        let urls = parse_playlist(BASE, content);
        assert_eq!(urls.len(), 2);
    }

    #[test]
    fn non_playlist_text_yields_nothing() {
        assert!(parse_playlist(BASE, "this is not\na playlist\n").is_empty());
    }
}
