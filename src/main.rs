use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use config::Config;
use serde::de::Deserializer;
use serde::Deserialize;
use tracing::{error, info, warn};

use tvgate::cache::{FileCache, DEFAULT_MAX_ITEMS};
use tvgate::channels::{
    parse_m3u, playlist_digest, BindingOverride, BufferMode, Catalogue, Channel, TunerBinding,
};
use tvgate::fetcher::{build_client, RetryPolicy};
use tvgate::manager::StreamManager;
use tvgate::metrics::StatusCounters;
use tvgate::{create_app, fetch_playlist_sources, AppState};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Listen address override (host:port)
    #[arg(long)]
    listen: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Settings {
    server: ServerConfig,
    playlist: PlaylistConfig,
    #[serde(default)]
    stream: StreamConfig,
    #[serde(default)]
    upstream: UpstreamConfig,
    #[serde(default)]
    cache: CacheConfig,
    #[serde(default, rename = "channel")]
    channel_overrides: Vec<BindingOverride>,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    host: String,
    port: u16,
    /// External base URL used in the consolidated playlist; defaults to
    /// http://<host>:<port>.
    base_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaylistConfig {
    #[serde(alias = "url", deserialize_with = "deserialize_one_or_many")]
    urls: Vec<String>,
    #[serde(default)]
    refresh_minutes: u64,
}

fn deserialize_one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => Ok(vec![s]),
        OneOrMany::Many(v) => Ok(v),
    }
}

#[derive(Debug, Deserialize)]
struct StreamConfig {
    #[serde(default = "default_buffer_mode")]
    buffer_mode: BufferMode,
    #[serde(default = "default_buffer_size_kb")]
    buffer_size_kb: usize,
    #[serde(default = "default_tuners_max")]
    tuners_max: usize,
    #[serde(default)]
    retry_enabled: bool,
    #[serde(default = "default_max_retries")]
    max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    retry_delay_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_mode: default_buffer_mode(),
            buffer_size_kb: default_buffer_size_kb(),
            tuners_max: default_tuners_max(),
            retry_enabled: false,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_buffer_mode() -> BufferMode {
    BufferMode::Buffered
}

fn default_buffer_size_kb() -> usize {
    1024
}

fn default_tuners_max() -> usize {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize)]
struct UpstreamConfig {
    #[serde(default = "default_user_agent")]
    user_agent: String,
    #[serde(default = "default_connect_timeout_secs")]
    connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_user_agent() -> String {
    format!("tvgate/{}", env!("CARGO_PKG_VERSION"))
}

fn default_connect_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    dir: String,
    #[serde(default = "default_cache_max_items")]
    max_items: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            max_items: default_cache_max_items(),
        }
    }
}

fn default_cache_dir() -> String {
    "cache".to_string()
}

fn default_cache_max_items() -> usize {
    DEFAULT_MAX_ITEMS
}

async fn load_catalogue(
    client: &reqwest::Client,
    settings: &Settings,
) -> (Vec<Channel>, String) {
    let mut channels: Vec<Channel> = Vec::new();
    let mut sources: Vec<String> = Vec::new();

    for (url, result) in fetch_playlist_sources(client, &settings.playlist.urls).await {
        match result {
            Ok(text) => match parse_m3u(&text) {
                Ok(mut parsed) => {
                    info!("Loaded {} channels from {}", parsed.len(), url);
                    channels.append(&mut parsed);
                    sources.push(text);
                }
                Err(e) => error!("Failed to parse playlist from {}: {}", url, e),
            },
            Err(e) => error!("Failed to fetch playlist from {}: {}", url, e),
        }
    }

    (channels, playlist_digest(&sources))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let settings = Config::builder()
        .add_source(config::File::with_name(&args.config))
        .build()?;
    let settings: Settings = settings.try_deserialize()?;

    info!("Configuration loaded from {}", args.config);

    let client = build_client(
        &settings.upstream.user_agent,
        Duration::from_secs(settings.upstream.connect_timeout_secs),
    )?;

    let (channels, digest) = load_catalogue(&client, &settings).await;
    if channels.is_empty() {
        warn!("No channels loaded from any playlist; serving an empty catalogue");
    }
    info!("Total loaded channels: {}", channels.len());

    let defaults = TunerBinding {
        tuners_max: settings.stream.tuners_max,
        buffer_mode: settings.stream.buffer_mode,
        buffer_size_kb: settings.stream.buffer_size_kb,
        user_agent: None,
    };
    let catalogue = Catalogue::new(
        channels,
        digest,
        defaults,
        settings.channel_overrides.clone(),
    );

    let retry = RetryPolicy {
        enabled: settings.stream.retry_enabled,
        max_retries: settings.stream.max_retries,
        delay: Duration::from_millis(settings.stream.retry_delay_ms),
    };

    let cache = FileCache::new(&settings.cache.dir, settings.cache.max_items, client.clone())?;
    if let Err(e) = cache.load().await {
        warn!("Failed to load file cache state: {}", e);
    }

    let counters = Arc::new(StatusCounters::new());
    let manager = StreamManager::new(client.clone(), retry, counters);

    let listen = args
        .listen
        .unwrap_or_else(|| format!("{}:{}", settings.server.host, settings.server.port));
    let base_url = settings
        .server
        .base_url
        .clone()
        .unwrap_or_else(|| format!("http://{listen}"));

    let state = Arc::new(AppState::new(
        catalogue,
        manager,
        cache,
        client.clone(),
        base_url,
    ));

    // Periodic playlist refresh: the catalogue snapshot is swapped behind
    // the state handle; open sessions keep running against the old one.
    if settings.playlist.refresh_minutes > 0 {
        let refresh_state = Arc::clone(&state);
        let refresh_client = client.clone();
        tokio::spawn(async move {
            let interval = Duration::from_secs(settings.playlist.refresh_minutes * 60);
            loop {
                tokio::time::sleep(interval).await;
                let (channels, digest) = load_catalogue(&refresh_client, &settings).await;
                if channels.is_empty() {
                    warn!("Playlist refresh produced no channels; keeping current catalogue");
                    continue;
                }
                info!("Playlist refreshed: {} channels", channels.len());
                let defaults = TunerBinding {
                    tuners_max: settings.stream.tuners_max,
                    buffer_mode: settings.stream.buffer_mode,
                    buffer_size_kb: settings.stream.buffer_size_kb,
                    user_agent: None,
                };
                refresh_state
                    .replace_catalogue(Catalogue::new(
                        channels,
                        digest,
                        defaults,
                        settings.channel_overrides.clone(),
                    ))
                    .await;
            }
        });
    }

    let app = create_app(state);

    info!("Listening on http://{}", listen);
    let listener = tokio::net::TcpListener::bind(listen).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
