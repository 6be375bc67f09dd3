use clap::Parser;
use gateway::config::{FfmpegConfig, IceConfig, RelayServer, SourceUrls, DEFAULT_STUN_URLS};
use gateway::{Gateway, GatewayConfig, SourceKind};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "webrtc-gateway",
    about = "Relay RTSP/RTMP H.264 sources to WebRTC viewers"
)]
struct Args {
    /// RTMP source URL
    #[arg(long, env = "RTMP_URL")]
    rtmp_url: Option<String>,

    /// RTSP source URL
    #[arg(long, env = "RTSP_URL")]
    rtsp_url: Option<String>,

    /// Source forwarded at startup (rtsp or rtmp)
    #[arg(long, env = "SOURCE_TYPE")]
    source_type: Option<String>,

    /// RTSP lower transport passed to ffmpeg
    #[arg(long, env = "RTSP_TRANSPORT", default_value = "tcp")]
    rtsp_transport: String,

    /// STUN server URLs, comma separated
    #[arg(long, env = "STUN_URLS", value_delimiter = ',')]
    stun_urls: Vec<String>,

    #[arg(long, env = "TURN_URL")]
    turn_url: Option<String>,

    #[arg(long, env = "TURN_USERNAME", default_value = "")]
    turn_username: String,

    #[arg(long, env = "TURN_CREDENTIAL", default_value = "")]
    turn_credential: String,

    /// ffmpeg executable
    #[arg(long, env = "FFMPEG_BIN", default_value = "ffmpeg")]
    ffmpeg: String,
}

impl Args {
    fn into_config(self) -> Result<GatewayConfig, gateway::GatewayError> {
        let initial_source = self
            .source_type
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(str::parse::<SourceKind>)
            .transpose()?;

        let stun_urls = if self.stun_urls.is_empty() {
            DEFAULT_STUN_URLS.iter().map(|s| s.to_string()).collect()
        } else {
            self.stun_urls
        };
        let relay = self.turn_url.filter(|u| !u.is_empty()).map(|url| RelayServer {
            url,
            username: self.turn_username,
            credential: self.turn_credential,
        });

        Ok(GatewayConfig {
            sources: SourceUrls {
                rtmp: self.rtmp_url,
                rtsp: self.rtsp_url,
            },
            initial_source,
            ice: IceConfig { stun_urls, relay },
            ffmpeg: FfmpegConfig {
                binary: self.ffmpeg,
                rtsp_transport: self.rtsp_transport,
            },
            ..GatewayConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Args::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let gateway = match Gateway::new(config) {
        Ok(gateway) => gateway,
        Err(e) => {
            tracing::error!(error = %e, "failed to build gateway");
            return ExitCode::FAILURE;
        }
    };

    match gateway.start() {
        Ok(Some(source)) => tracing::info!(%source, "gateway running, press Ctrl-C to stop"),
        Ok(None) => tracing::warn!("gateway running without a source"),
        Err(e) => tracing::error!(error = %e, "failed to select startup source"),
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }

    gateway.shutdown().await;
    ExitCode::SUCCESS
}
