use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Whether clients of one channel share a single upstream through the ring
/// buffer, or each get their own upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferMode {
    None,
    Buffered,
}

/// Per-channel admission parameters. Channels without an override use the
/// configured defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunerBinding {
    pub tuners_max: usize,
    pub buffer_mode: BufferMode,
    pub buffer_size_kb: usize,
    /// Some providers require a specific User-Agent; overrides the global one.
    pub user_agent: Option<String>,
}

impl Default for TunerBinding {
    fn default() -> Self {
        Self {
            tuners_max: 1,
            buffer_mode: BufferMode::Buffered,
            buffer_size_kb: 1024,
            user_agent: None,
        }
    }
}

/// Partial override merged over the default binding, keyed by channel id in
/// the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindingOverride {
    pub id: String,
    pub tuners_max: Option<usize>,
    pub buffer_mode: Option<BufferMode>,
    pub buffer_size_kb: Option<usize>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Live,
    Vod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    /// Stable identifier: the playlist's tvg-id when present, otherwise a
    /// digest of the upstream URL.
    pub id: String,
    pub name: String,
    pub url: String,
    pub group: Option<String>,
    pub kind: ChannelKind,
    /// Series title and season parsed from names like "Show S01E03".
    pub series: Option<String>,
    pub season: Option<u32>,
    pub declared_size: Option<u64>,
    pub declared_mtime: Option<DateTime<Utc>>,
}

impl Channel {
    /// File extension used for this entry in the virtual filesystem,
    /// derived from the upstream URL path.
    pub fn extension(&self) -> &str {
        let path = self.url.split(['?', '#']).next().unwrap_or("");
        match path.rsplit_once('.') {
            Some((_, ext)) if !ext.contains('/') && !ext.is_empty() && ext.len() <= 4 => ext,
            _ => "ts",
        }
    }
}

const VOD_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "m4v", "webm"];

fn stable_id(url: &str) -> String {
    let digest = format!("{:x}", md5::compute(url.as_bytes()));
    digest[..16].to_string()
}

/// The active channel set plus its admission bindings. Replaced wholesale
/// (behind an `Arc`) on playlist refresh; never mutated in place.
#[derive(Debug)]
pub struct Catalogue {
    channels: Vec<Channel>,
    index: HashMap<String, usize>,
    /// Digest of the playlist sources; names the top-level WebDAV directory
    /// so browsers pick up playlist changes by re-opening.
    pub digest: String,
    defaults: TunerBinding,
    overrides: HashMap<String, BindingOverride>,
}

impl Catalogue {
    pub fn new(
        channels: Vec<Channel>,
        digest: String,
        defaults: TunerBinding,
        overrides: Vec<BindingOverride>,
    ) -> Self {
        let index = channels
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id.clone(), i))
            .collect();
        let overrides = overrides.into_iter().map(|o| (o.id.clone(), o)).collect();
        Self {
            channels,
            index,
            digest,
            defaults,
            overrides,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Channel> {
        self.index.get(id).map(|&i| &self.channels[i])
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn vod_channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter().filter(|c| c.kind == ChannelKind::Vod)
    }

    /// Resolves the effective tuner binding for a channel: defaults merged
    /// with the per-channel override, `tuners_max` clamped to at least 1.
    pub fn binding(&self, id: &str) -> TunerBinding {
        let mut binding = self.defaults.clone();
        if let Some(o) = self.overrides.get(id) {
            if let Some(v) = o.tuners_max {
                binding.tuners_max = v;
            }
            if let Some(v) = o.buffer_mode {
                binding.buffer_mode = v;
            }
            if let Some(v) = o.buffer_size_kb {
                binding.buffer_size_kb = v;
            }
            if o.user_agent.is_some() {
                binding.user_agent = o.user_agent.clone();
            }
        }
        binding.tuners_max = binding.tuners_max.max(1);
        binding
    }

    /// Emits the consolidated playlist with stable per-channel stream URLs.
    pub fn build_m3u(&self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        let mut out = String::from("#EXTM3U\n");
        for channel in &self.channels {
            out.push_str(&format!("#EXTINF:-1 tvg-id=\"{}\"", channel.id));
            if let Some(group) = &channel.group {
                out.push_str(&format!(" group-title=\"{}\"", group));
            }
            out.push_str(&format!(
                ",{}\n{}/stream/{}\n",
                channel.name, base, channel.id
            ));
        }
        out
    }
}

/// Parses an extended M3U playlist into channels.
///
/// Recognised EXTINF attributes: `tvg-id`, `group-title`, and the
/// VOD-catalogue extras `size` (bytes) and `added` (unix seconds) that some
/// provider exports carry. Entries whose URL ends in a known container
/// extension are classified as VOD.
pub fn parse_m3u(content: &str) -> Result<Vec<Channel>> {
    // The attribute block is matched as a whole so quoted values may
    // contain commas; the display name starts after the first comma that
    // follows it.
    let re_extinf = Regex::new(r#"#EXTINF:-?\d+((?:\s+[A-Za-z0-9-]+="[^"]*")*)\s*,(.*)"#).unwrap();
    let re_attr = Regex::new(r#"([A-Za-z0-9-]+)="([^"]*)""#).unwrap();
    let re_episode = Regex::new(r"(?i)^(.*?)\s+S(\d+)\s*E\d+").unwrap();

    let mut channels = Vec::new();
    let mut pending: Option<(String, HashMap<String, String>)> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(caps) = re_extinf.captures(line) {
            let attrs = re_attr
                .captures_iter(&caps[1])
                .map(|a| (a[1].to_ascii_lowercase(), a[2].to_string()))
                .collect();
            pending = Some((caps[2].trim().to_string(), attrs));
        } else if line.starts_with("http://") || line.starts_with("https://") {
            let Some((name, attrs)) = pending.take() else {
                continue;
            };
            channels.push(channel_from_entry(name, attrs, line, &re_episode));
        }
    }

    Ok(channels)
}

fn channel_from_entry(
    name: String,
    attrs: HashMap<String, String>,
    url: &str,
    re_episode: &Regex,
) -> Channel {
    let id = attrs
        .get("tvg-id")
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| stable_id(url));
    let group = attrs.get("group-title").filter(|v| !v.is_empty()).cloned();

    let path = url.split(['?', '#']).next().unwrap_or("");
    let ext = path.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    let kind = match ext.as_deref() {
        Some(e) if VOD_EXTENSIONS.contains(&e) => ChannelKind::Vod,
        _ => ChannelKind::Live,
    };

    let (series, season) = if kind == ChannelKind::Vod {
        match re_episode.captures(&name) {
            Some(caps) => (
                Some(caps[1].trim().to_string()),
                caps[2].parse::<u32>().ok(),
            ),
            None => (None, None),
        }
    } else {
        (None, None)
    };

    let declared_size = attrs.get("size").and_then(|v| v.parse::<u64>().ok());
    let declared_mtime = attrs
        .get("added")
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

    Channel {
        id,
        name,
        url: url.to_string(),
        group,
        kind,
        series,
        season,
        declared_size,
        declared_mtime,
    }
}

/// Digest naming the catalogue snapshot; fed by the raw playlist texts.
pub fn playlist_digest(sources: &[String]) -> String {
    let mut ctx = md5::Context::new();
    for source in sources {
        ctx.consume(source.as_bytes());
    }
    format!("{:x}", ctx.compute())
}
