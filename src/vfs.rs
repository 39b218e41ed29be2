use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use reqwest::Client;
use tracing::debug;

use crate::cache::FileCache;
use crate::channels::{Catalogue, Channel};

/// Group name for entries the playlist left ungrouped.
pub const GROUP_FALLBACK: &str = "Other";
/// Directory holding the non-series entries of a group.
pub const INDIVIDUAL_DIR: &str = "Individual";
pub const ON_DEMAND_DIR: &str = "On Demand";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// What a path points at. Directories carry their immediate children so
/// PROPFIND Depth 1 and HTML listings come for free.
pub enum Resolved<'a> {
    Dir(Vec<DirEntry>),
    File(&'a Channel),
}

#[derive(Debug, Clone)]
pub struct FileStat {
    pub size: Option<u64>,
    pub mtime: DateTime<Utc>,
    pub content_type: String,
}

/// The virtual filesystem name of a VOD entry.
pub fn file_name(channel: &Channel) -> String {
    format!("{}.{}", sanitize(&channel.name), channel.extension())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if matches!(c, '/' | '\\') { '-' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

fn group_of(channel: &Channel) -> &str {
    channel.group.as_deref().unwrap_or(GROUP_FALLBACK)
}

fn season_dir(channel: &Channel) -> String {
    format!("Season {}", channel.season.unwrap_or(1))
}

fn dirs(names: impl IntoIterator<Item = String>) -> Vec<DirEntry> {
    names
        .into_iter()
        .map(|name| DirEntry { name, is_dir: true })
        .collect()
}

/// Resolves a decoded, slash-separated path against the catalogue tree:
///
/// `/<digest>/On Demand/<group>/Individual/<file>` for plain entries,
/// `/<digest>/On Demand/<group>/<series>/Season <n>/<file>` for series.
pub fn resolve<'a>(catalogue: &'a Catalogue, path: &str) -> Option<Resolved<'a>> {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();

    if parts.iter().any(|p| *p == "." || *p == "..") {
        return None;
    }

    match parts.as_slice() {
        [] => Some(Resolved::Dir(dirs([catalogue.digest.clone()]))),
        [digest, rest @ ..] => {
            if *digest != catalogue.digest {
                return None;
            }
            resolve_in_snapshot(catalogue, rest)
        }
    }
}

fn resolve_in_snapshot<'a>(catalogue: &'a Catalogue, parts: &[&str]) -> Option<Resolved<'a>> {
    match parts {
        [] => Some(Resolved::Dir(dirs([ON_DEMAND_DIR.to_string()]))),
        [ON_DEMAND_DIR] => {
            let groups: BTreeSet<String> = catalogue
                .vod_channels()
                .map(|c| group_of(c).to_string())
                .collect();
            Some(Resolved::Dir(dirs(groups)))
        }
        [ON_DEMAND_DIR, group] => {
            let mut names = BTreeSet::new();
            let mut has_plain = false;
            for c in catalogue.vod_channels().filter(|c| group_of(c) == *group) {
                match &c.series {
                    Some(series) => {
                        names.insert(sanitize(series));
                    }
                    None => has_plain = true,
                }
            }
            if names.is_empty() && !has_plain {
                return None;
            }
            let mut entries = Vec::new();
            if has_plain {
                entries.push(DirEntry {
                    name: INDIVIDUAL_DIR.to_string(),
                    is_dir: true,
                });
            }
            entries.extend(dirs(names));
            Some(Resolved::Dir(entries))
        }
        [ON_DEMAND_DIR, group, INDIVIDUAL_DIR] => {
            let files: Vec<DirEntry> = catalogue
                .vod_channels()
                .filter(|c| group_of(c) == *group && c.series.is_none())
                .map(|c| DirEntry {
                    name: file_name(c),
                    is_dir: false,
                })
                .collect();
            if files.is_empty() {
                return None;
            }
            Some(Resolved::Dir(files))
        }
        [ON_DEMAND_DIR, group, INDIVIDUAL_DIR, file] => catalogue
            .vod_channels()
            .filter(|c| group_of(c) == *group && c.series.is_none())
            .find(|c| file_name(c) == *file)
            .map(Resolved::File),
        [ON_DEMAND_DIR, group, series] => {
            let seasons: BTreeSet<String> = catalogue
                .vod_channels()
                .filter(|c| {
                    group_of(c) == *group
                        && c.series.as_deref().map(sanitize).as_deref() == Some(*series)
                })
                .map(season_dir)
                .collect();
            if seasons.is_empty() {
                return None;
            }
            Some(Resolved::Dir(dirs(seasons)))
        }
        [ON_DEMAND_DIR, group, series, season] => {
            let files: Vec<DirEntry> = catalogue
                .vod_channels()
                .filter(|c| {
                    group_of(c) == *group
                        && c.series.as_deref().map(sanitize).as_deref() == Some(*series)
                        && season_dir(c) == *season
                })
                .map(|c| DirEntry {
                    name: file_name(c),
                    is_dir: false,
                })
                .collect();
            if files.is_empty() {
                return None;
            }
            Some(Resolved::Dir(files))
        }
        [ON_DEMAND_DIR, group, series, season, file] => catalogue
            .vod_channels()
            .filter(|c| {
                group_of(c) == *group
                    && c.series.as_deref().map(sanitize).as_deref() == Some(*series)
                    && season_dir(c) == *season
            })
            .find(|c| file_name(c) == *file)
            .map(Resolved::File),
        _ => None,
    }
}

fn content_type_for(extension: &str) -> &'static str {
    match extension {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "ts" => "video/mpeg",
        _ => "application/octet-stream",
    }
}

/// Size and modification time for a VOD entry.
///
/// Preference order: playlist-declared values, then cached upstream
/// metadata, then a one-off HEAD of the origin (recorded in the cache for
/// the next call), then "now" for the timestamp.
pub async fn stat(channel: &Channel, cache: &FileCache, client: &Client) -> FileStat {
    let mut size = channel.declared_size;
    let mut mtime = channel.declared_mtime;
    let mut content_type = None;

    if size.is_none() || mtime.is_none() {
        match cache.lookup(&channel.url).await {
            Some(entry) => {
                size = size.or(entry.declared_size);
                mtime = mtime.or(entry.last_modified);
                content_type = entry.content_type;
            }
            None => {
                // Never probed this URL before: ask the origin once and
                // remember whatever it says.
                if let Some(probed) = head_origin(client, &channel.url).await {
                    cache
                        .record_remote_metadata(
                            &channel.url,
                            probed.size,
                            probed.last_modified,
                            probed.etag,
                            probed.content_type.clone(),
                        )
                        .await;
                    size = size.or(probed.size);
                    mtime = mtime.or(probed.last_modified);
                    content_type = probed.content_type;
                }
            }
        }
    }

    FileStat {
        size,
        mtime: mtime.unwrap_or_else(Utc::now),
        content_type: content_type
            .unwrap_or_else(|| content_type_for(channel.extension()).to_string()),
    }
}

struct ProbedMeta {
    size: Option<u64>,
    last_modified: Option<DateTime<Utc>>,
    etag: Option<String>,
    content_type: Option<String>,
}

async fn head_origin(client: &Client, url: &str) -> Option<ProbedMeta> {
    let response = match client.head(url).send().await {
        Ok(r) if r.status().is_success() => r,
        Ok(r) => {
            debug!("HEAD {} returned {}", url, r.status());
            return None;
        }
        Err(e) => {
            debug!("HEAD {} failed: {}", url, e);
            return None;
        }
    };

    let headers = response.headers();
    let last_modified = headers
        .get(reqwest::header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let etag = headers
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let content_type = headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    Some(ProbedMeta {
        size: response.content_length(),
        last_modified,
        etag,
        content_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{ChannelKind, TunerBinding};
    use crate::fetcher::{build_client, DEFAULT_CONNECT_TIMEOUT};
    use chrono::TimeZone;

    fn vod(name: &str, url: &str, group: Option<&str>) -> Channel {
        Channel {
            id: name.to_lowercase().replace(' ', "-"),
            name: name.into(),
            url: url.into(),
            group: group.map(str::to_string),
            kind: ChannelKind::Vod,
            series: None,
            season: None,
            declared_size: None,
            declared_mtime: None,
        }
    }

    fn episode(series: &str, season: u32, name: &str, group: &str) -> Channel {
        Channel {
            series: Some(series.into()),
            season: Some(season),
            ..vod(
                name,
                &format!(
                    "http://o/{}.mkv",
                    name.to_lowercase().replace(' ', "-")
                ),
                Some(group),
            )
        }
    }

    fn catalogue() -> Catalogue {
        let mut live = vod("Live One", "http://o/live.ts", Some("News"));
        live.kind = ChannelKind::Live;
        Catalogue::new(
            vec![
                live,
                vod("Some Film", "http://o/some-film.mp4", Some("Movies")),
                vod("Other Film", "http://o/other-film.mp4", None),
                episode("Space Show", 2, "Space Show S02E05", "Shows"),
                episode("Space Show", 2, "Space Show S02E06", "Shows"),
                episode("Space Show", 3, "Space Show S03E01", "Shows"),
            ],
            "abcd1234".into(),
            TunerBinding::default(),
            Vec::new(),
        )
    }

    fn dir_names(resolved: Resolved<'_>) -> Vec<String> {
        match resolved {
            Resolved::Dir(entries) => entries.into_iter().map(|e| e.name).collect(),
            Resolved::File(_) => panic!("expected a directory"),
        }
    }

    #[test]
    fn test_root_is_the_playlist_digest() {
        let cat = catalogue();
        assert_eq!(dir_names(resolve(&cat, "/").unwrap()), vec!["abcd1234"]);
        assert!(resolve(&cat, "/wrong-digest").is_none());
    }

    #[test]
    fn test_tree_shape() {
        let cat = catalogue();
        assert_eq!(
            dir_names(resolve(&cat, "/abcd1234").unwrap()),
            vec![ON_DEMAND_DIR]
        );

        // Live channels don't appear; groups are sorted; ungrouped entries
        // land in the fallback group.
        assert_eq!(
            dir_names(resolve(&cat, "/abcd1234/On Demand").unwrap()),
            vec!["Movies", GROUP_FALLBACK, "Shows"]
        );

        assert_eq!(
            dir_names(resolve(&cat, "/abcd1234/On Demand/Movies").unwrap()),
            vec![INDIVIDUAL_DIR]
        );
        assert_eq!(
            dir_names(resolve(&cat, "/abcd1234/On Demand/Movies/Individual").unwrap()),
            vec!["Some Film.mp4"]
        );

        assert_eq!(
            dir_names(resolve(&cat, "/abcd1234/On Demand/Shows").unwrap()),
            vec!["Space Show"]
        );
        assert_eq!(
            dir_names(resolve(&cat, "/abcd1234/On Demand/Shows/Space Show").unwrap()),
            vec!["Season 2", "Season 3"]
        );
        assert_eq!(
            dir_names(
                resolve(&cat, "/abcd1234/On Demand/Shows/Space Show/Season 2").unwrap()
            ),
            vec!["Space Show S02E05.mkv", "Space Show S02E06.mkv"]
        );
    }

    #[test]
    fn test_file_resolution() {
        let cat = catalogue();
        match resolve(&cat, "/abcd1234/On Demand/Movies/Individual/Some Film.mp4") {
            Some(Resolved::File(c)) => assert_eq!(c.name, "Some Film"),
            _ => panic!("expected file"),
        }
        match resolve(
            &cat,
            "/abcd1234/On Demand/Shows/Space Show/Season 3/Space Show S03E01.mkv",
        ) {
            Some(Resolved::File(c)) => assert_eq!(c.season, Some(3)),
            _ => panic!("expected episode"),
        }
        assert!(resolve(&cat, "/abcd1234/On Demand/Movies/Individual/Missing.mp4").is_none());
    }

    #[test]
    fn test_dot_segments_are_refused() {
        let cat = catalogue();
        assert!(resolve(&cat, "/abcd1234/On Demand/../On Demand").is_none());
        assert!(resolve(&cat, "/abcd1234/.").is_none());
    }

    #[tokio::test]
    async fn test_stat_prefers_declared_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let client = build_client("tvgate-test", DEFAULT_CONNECT_TIMEOUT).unwrap();
        let cache = FileCache::new(dir.path(), 10, client.clone()).unwrap();

        let mut channel = vod("Declared", "http://127.0.0.1:1/declared.mp4", None);
        channel.declared_size = Some(4096);
        channel.declared_mtime = Utc.with_ymd_and_hms(2021, 2, 2, 0, 0, 0).single();

        let stat = stat(&channel, &cache, &client).await;
        assert_eq!(stat.size, Some(4096));
        assert_eq!(
            stat.mtime,
            Utc.with_ymd_and_hms(2021, 2, 2, 0, 0, 0).single().unwrap()
        );
    }

    #[tokio::test]
    async fn test_stat_uses_cached_upstream_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let client = build_client("tvgate-test", DEFAULT_CONNECT_TIMEOUT).unwrap();
        let cache = FileCache::new(dir.path(), 10, client.clone()).unwrap();

        let channel = vod("Probed", "http://127.0.0.1:1/probed.mp4", None);
        let when = Utc.with_ymd_and_hms(2022, 3, 3, 0, 0, 0).single();
        cache
            .record_remote_metadata(&channel.url, Some(999), when, None, None)
            .await;

        let stat = stat(&channel, &cache, &client).await;
        assert_eq!(stat.size, Some(999));
        assert_eq!(stat.mtime, when.unwrap());
    }

    #[tokio::test]
    async fn test_stat_falls_back_to_now() {
        let dir = tempfile::tempdir().unwrap();
        let client = build_client("tvgate-test", DEFAULT_CONNECT_TIMEOUT).unwrap();
        let cache = FileCache::new(dir.path(), 10, client.clone()).unwrap();

        // Origin is unreachable; the HEAD fails fast and stat degrades to
        // "unknown size, recent mtime".
        let channel = vod("Unknown", "http://127.0.0.1:1/unknown.mp4", None);
        let stat = stat(&channel, &cache, &client).await;
        assert_eq!(stat.size, None);
        let age = Utc::now().signed_duration_since(stat.mtime);
        assert!(age.num_seconds().abs() < 60);
    }
}
