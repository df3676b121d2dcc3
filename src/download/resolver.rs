// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Stream resolution seam.

use async_trait::async_trait;
use reqwest::Url;

use super::types::{MediaItem, MediaSource};
use crate::error::ResolveError;

/// Everything a resolver needs to pick a stream.
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    pub item: &'a MediaItem,
    pub media_source: &'a MediaSource,
    pub audio_stream_index: i32,
    pub subtitle_stream_index: Option<i32>,
    pub max_bitrate: Option<u64>,
}

/// A playable stream for an item.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStream {
    pub url: Option<String>,
    pub session_id: Option<String>,
    pub media_source: Option<MediaSource>,
}

/// Resolves a media item into a playable URL.
#[async_trait]
pub trait StreamResolver: Send + Sync {
    async fn resolve(&self, request: ResolveRequest<'_>) -> Result<ResolvedStream, ResolveError>;
}

/// Returns true if `url` points at a segmented stream (HLS) manifest.
pub fn is_segmented_manifest(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.ends_with(".m3u8")
}

/// Resolver that builds manifest URLs against a fixed server.
///
/// A media source that the server transcodes carries its own relative
/// `transcoding_url`, which is joined onto the base. Otherwise the manifest
/// is addressed by item id with the stream selection as query parameters.
#[derive(Debug, Clone)]
pub struct TemplateResolver {
    base: Url,
}

impl TemplateResolver {
    pub fn new(base_url: &str) -> Result<Self, ResolveError> {
        let base = Url::parse(base_url).map_err(|e| ResolveError::InvalidUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { base })
    }

    fn join(&self, relative: &str) -> Result<Url, ResolveError> {
        let joined = format!("{}{}", self.base.as_str().trim_end_matches('/'), relative);
        Url::parse(&joined).map_err(|e| ResolveError::InvalidUrl {
            url: joined,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl StreamResolver for TemplateResolver {
    async fn resolve(&self, request: ResolveRequest<'_>) -> Result<ResolvedStream, ResolveError> {
        let item_id = request.item.id.as_deref().ok_or(ResolveError::MissingItemId)?;
        let source = request.media_source;

        if let Some(transcoding) = source.transcoding_url.as_deref() {
            let url = self.join(transcoding)?;
            return Ok(ResolvedStream {
                url: Some(url.to_string()),
                session_id: None,
                media_source: Some(source.clone()),
            });
        }

        let mut url = self.join(&format!("/Videos/{}/master.m3u8", item_id))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(source_id) = source.id.as_deref() {
                query.append_pair("mediaSourceId", source_id);
            }
            query.append_pair("audioStreamIndex", &request.audio_stream_index.to_string());
            if let Some(subtitle) = request.subtitle_stream_index {
                query.append_pair("subtitleStreamIndex", &subtitle.to_string());
                query.append_pair("subtitleMethod", "Embed");
            }
            if let Some(bitrate) = request.max_bitrate {
                query.append_pair("maxStreamingBitrate", &bitrate.to_string());
            }
        }

        Ok(ResolvedStream {
            url: Some(url.to_string()),
            session_id: None,
            media_source: Some(source.clone()),
        })
    }
}
