// Vision fallback: before a non-vision upstream is called, every image
// block is replaced by a text description obtained from a vision-capable
// model. Descriptions are memoized for the process lifetime and fetched
// concurrently; a single failed description degrades to a placeholder
// without aborting the request.

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::api::claude::{ContentBlock, ImageSource, MessagesRequest};
use crate::config;

const DESCRIPTION_PROMPT: &str = "Describe this image in granular detail: all visible text \
verbatim, layout, colors, and any diagrams or UI elements. Be thorough and factual.";
const UNAVAILABLE_PLACEHOLDER: &str = "[Image description unavailable]";

/// Inline images hash only a bounded prefix of their base64 plus the total
/// length, so very large payloads key cheaply.
const INLINE_HASH_PREFIX: usize = 4096;

#[derive(Default)]
pub struct VisionCache {
    map: Mutex<HashMap<String, String>>,
}

impl VisionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.map.lock().get(key).cloned()
    }

    pub fn insert(&self, key: String, description: String) {
        self.map.lock().insert(key, description);
    }
}

pub fn image_cache_key(source: &ImageSource) -> String {
    if let Some(url) = &source.url {
        return format!("url:{}", url);
    }
    let data = source.data.as_deref().unwrap_or_default();
    let prefix = &data.as_bytes()[..data.len().min(INLINE_HASH_PREFIX)];
    let mut hasher = Sha256::new();
    hasher.update(prefix);
    format!("inline:{:x}:{}", hasher.finalize(), data.len())
}

/// Replace every image block in the request with its description, filling
/// the memoization cache on the way.
pub async fn apply_fallback(http: &reqwest::Client, cache: &VisionCache, req: &mut MessagesRequest) {
    let mut missing: HashSet<String> = HashSet::new();
    let mut sources: HashMap<String, ImageSource> = HashMap::new();

    for message in &req.messages {
        for block in message.content.blocks() {
            if let ContentBlock::Image { source } = block {
                let key = image_cache_key(&source);
                if cache.get(&key).is_none() {
                    missing.insert(key.clone());
                    sources.entry(key).or_insert(source);
                }
            }
        }
    }

    if !missing.is_empty() {
        let fetches = missing.iter().map(|key| {
            let source = sources.get(key).cloned();
            async move {
                let description = match source {
                    Some(source) => describe(http, &source).await.unwrap_or_else(|e| {
                        tracing::warn!("image description failed: {}", e);
                        UNAVAILABLE_PLACEHOLDER.to_string()
                    }),
                    None => UNAVAILABLE_PLACEHOLDER.to_string(),
                };
                (key.clone(), description)
            }
        });
        for (key, description) in futures::future::join_all(fetches).await {
            cache.insert(key, description);
        }
    }

    for message in &mut req.messages {
        if let crate::api::claude::MessageContent::Blocks(blocks) = &mut message.content {
            for block in blocks.iter_mut() {
                if let ContentBlock::Image { source } = block {
                    let key = image_cache_key(source);
                    let description = cache
                        .get(&key)
                        .unwrap_or_else(|| UNAVAILABLE_PLACEHOLDER.to_string());
                    *block = ContentBlock::Text {
                        text: substituted_text(&description),
                    };
                }
            }
        }
    }
}

fn substituted_text(description: &str) -> String {
    if description == UNAVAILABLE_PLACEHOLDER {
        description.to_string()
    } else {
        format!("[Image Description: {}]", description)
    }
}

/// One single-shot completion against the configured vision model via the
/// OpenRouter-style endpoint.
async fn describe(http: &reqwest::Client, source: &ImageSource) -> Result<String> {
    let config = config::get();
    let api_key = config
        .openrouter_api_key
        .as_deref()
        .ok_or_else(|| anyhow!("OPENROUTER_API_KEY is not set for the vision fallback"))?;
    let image_url = source
        .as_url()
        .ok_or_else(|| anyhow!("image block has neither data nor url"))?;

    let payload = json!({
        "model": config.vision_model,
        "messages": [{
            "role": "user",
            "content": [
                { "type": "text", "text": DESCRIPTION_PROMPT },
                { "type": "image_url", "image_url": { "url": image_url } }
            ]
        }],
        "max_tokens": 1024
    });
    let url = format!(
        "{}/chat/completions",
        config.openrouter_base_url.trim_end_matches('/')
    );

    let response = http.post(&url).bearer_auth(api_key).json(&payload).send().await?;
    if !response.status().is_success() {
        let status = response.status();
        return Err(anyhow!("vision upstream returned {}", status));
    }
    let body: Value = response.json().await?;
    body.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("vision upstream returned no content"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inline(data: &str) -> ImageSource {
        ImageSource {
            source_type: "base64".into(),
            media_type: Some("image/png".into()),
            data: Some(data.into()),
            url: None,
        }
    }

    #[test]
    fn identical_inline_images_share_a_key() {
        let a = image_cache_key(&inline("QUJDREVG"));
        let b = image_cache_key(&inline("QUJDREVG"));
        assert_eq!(a, b);
        assert_ne!(a, image_cache_key(&inline("QUJDREVH")));
    }

    #[test]
    fn url_images_key_on_the_url() {
        let source = ImageSource {
            source_type: "url".into(),
            media_type: None,
            data: None,
            url: Some("https://example.com/cat.png".into()),
        };
        assert_eq!(image_cache_key(&source), "url:https://example.com/cat.png");
    }

    #[test]
    fn long_payloads_key_on_prefix_and_length() {
        let base = "A".repeat(INLINE_HASH_PREFIX);
        let long_a = format!("{}{}", base, "B".repeat(100));
        let long_b = format!("{}{}", base, "C".repeat(100));
        // same prefix, same length: the key cannot tell them apart by design
        assert_eq!(image_cache_key(&inline(&long_a)), image_cache_key(&inline(&long_b)));
        // same prefix, different length: distinct keys
        let long_c = format!("{}{}", base, "C".repeat(101));
        assert_ne!(image_cache_key(&inline(&long_a)), image_cache_key(&inline(&long_c)));
    }

    #[tokio::test]
    async fn cached_descriptions_skip_the_upstream_entirely() {
        let cache = VisionCache::new();
        let source = inline("QUJD");
        cache.insert(image_cache_key(&source), "a red square".into());

        let mut req: MessagesRequest = serde_json::from_value(json!({
            "model": "glm-4.6",
            "messages": [{ "role": "user", "content": [
                { "type": "image", "source": { "type": "base64", "media_type": "image/png", "data": "QUJD" } },
                { "type": "image", "source": { "type": "base64", "media_type": "image/png", "data": "QUJD" } },
                { "type": "text", "text": "what is this?" }
            ]}]
        }))
        .unwrap();

        // no OPENROUTER_API_KEY is configured in tests; a cache hit must not
        // touch the network, so both identical blocks resolve from the cache
        let http = reqwest::Client::new();
        apply_fallback(&http, &cache, &mut req).await;

        let blocks = req.messages[0].content.blocks();
        for block in &blocks[..2] {
            match block {
                ContentBlock::Text { text } => {
                    assert_eq!(text, "[Image Description: a red square]")
                }
                other => panic!("image block not substituted: {:?}", other),
            }
        }
        assert!(matches!(&blocks[2], ContentBlock::Text { text } if text == "what is this?"));
    }
}
