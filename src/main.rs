// Loqa Duplex: real-time voice conversations with a remote agent
//
// Usage:
//   loqa-duplex serve                                   # HTTP host API
//   loqa-duplex --loopback --input-wav in.wav call      # one call, echo agent
//
// Without the `cpal` feature, pass --input-wav (and optionally --output-wav)
// to run headless.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loqa_duplex::audio::codec::rate_from_mime_type;
use loqa_duplex::audio::{AudioBackendFactory, AudioSink, AudioSource};
use loqa_duplex::transport::{
    AgentEndpoint, Connector, InboundFrame, MemoryConnector, MemoryTransportConfig, NatsConnector,
};
use loqa_duplex::{create_router, AppState, Config, ConversationContext, SessionController};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "loqa-duplex")]
#[command(about = "Real-time duplex voice sessions with a conversational agent")]
struct Args {
    /// Config file (without extension)
    #[arg(long, default_value = "config/loqa-duplex", global = true)]
    config: String,

    /// Use a WAV file instead of the microphone
    #[arg(long, global = true)]
    input_wav: Option<PathBuf>,

    /// Write response audio to a WAV file instead of the speaker
    #[arg(long, global = true)]
    output_wav: Option<PathBuf>,

    /// Talk to an in-process echo agent instead of NATS
    #[arg(long, global = true)]
    loopback: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP host API
    Serve,

    /// Hold one conversation until Ctrl-C
    Call {
        /// Persona instruction for the agent
        #[arg(long)]
        persona: Option<String>,

        /// Voice name
        #[arg(long)]
        voice: Option<String>,

        /// Content excerpt to talk about
        #[arg(long)]
        excerpt: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let cfg = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    info!("Loqa Duplex v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded config: {}", cfg.service.name);

    let source = match &args.input_wav {
        Some(path) => AudioSource::File(path.clone()),
        None => AudioSource::Microphone,
    };
    let sink = match &args.output_wav {
        Some(path) => AudioSink::File(path.clone()),
        None if args.input_wav.is_some() => AudioSink::Null,
        None => AudioSink::Speaker,
    };
    let devices = Arc::new(AudioBackendFactory::new(source, sink));

    let connector: Arc<dyn Connector> = if args.loopback {
        let (connector, endpoint) = MemoryConnector::new(MemoryTransportConfig::default());
        spawn_echo_agent(endpoint);
        info!("Using in-process echo agent");
        Arc::new(connector)
    } else {
        info!("Using NATS agent at {}", cfg.transport.nats_url);
        Arc::new(NatsConnector::new(cfg.nats_config()))
    };

    let controller = Arc::new(SessionController::new(cfg.session_config(), devices, connector));

    match args.command {
        Command::Serve => serve(&cfg, controller).await,
        Command::Call {
            persona,
            voice,
            excerpt,
        } => {
            let context = cfg.agent.apply_defaults(ConversationContext {
                session_id: None,
                persona: persona.unwrap_or_default(),
                voice: voice.unwrap_or_default(),
                excerpt,
            });
            call(controller, context).await
        }
    }
}

async fn serve(cfg: &Config, controller: Arc<SessionController>) -> Result<()> {
    let state = AppState::new(Arc::clone(&controller)).with_agent(cfg.agent.clone());
    let app = create_router(state);

    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    controller.shutdown().await;
    Ok(())
}

async fn call(controller: Arc<SessionController>, context: ConversationContext) -> Result<()> {
    let mut events = controller.subscribe();
    let handle = controller.start(context).await?;
    println!("Connected ({}). Press Ctrl-C to hang up.", handle);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                let stats = controller.stop(&handle).await?;
                println!(
                    "Hung up after {:.1}s: {} frames sent, {} response chunks played",
                    stats.duration_secs, stats.frames_sent, stats.chunks_scheduled
                );
                break;
            }
            event = events.recv() => match event {
                Ok(event) if event.session_id == handle.id() => {
                    println!("[{}] {}", event.at.format("%H:%M:%S%.3f"), event.state);
                    if event.state.is_closed() {
                        if let Some(reason) = event.reason {
                            println!("{}", reason.user_message());
                        }
                        break;
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(e) => {
                    warn!("Status stream interrupted: {}", e);
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Agent that plays every received frame straight back
fn spawn_echo_agent(mut endpoint: AgentEndpoint) {
    tokio::spawn(async move {
        while let Some(mut agent) = endpoint.accept().await {
            tokio::spawn(async move {
                info!("Echo agent serving {}", agent.setup.session_id);
                while let Some(frame) = agent.outbound.recv().await {
                    let echo = InboundFrame {
                        sample_rate: rate_from_mime_type(&frame.mime_type),
                        inline_audio_base64: frame.data_base64,
                    };
                    if agent.send_audio(echo).await.is_err() {
                        break;
                    }
                }
                info!("Echo agent finished {}", agent.setup.session_id);
            });
        }
    });
}
