use sipua::application::metrics::describe_metrics;
use sipua::config::Config;
use sipua::infrastructure::protocols::sip::{SipEngine, SipError, SipTimers, UdpEngine};
use sipua::{Collaborators, IdentityProfile, SipAgent, SipEvent, SipEventListener};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Logs every event the agent surfaces
struct LogListener;

impl SipEventListener for LogListener {
    fn on_sip_event(&self, event: &SipEvent) {
        info!(
            event = event.event_type.as_str(),
            from = %event.from,
            rtp_port = ?event.remote_rtp_port,
            "{}",
            event.content
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "sipua.toml".to_string());
    let config = Config::load(&path)?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting sipua");
    info!("Configuration loaded from {}", path);
    describe_metrics();

    let timers = SipTimers::with_timeout(config.agent.transaction_timeout());
    let engines = move |profile: &IdentityProfile| -> Result<Arc<dyn SipEngine>, SipError> {
        let engine: Arc<dyn SipEngine> = Arc::new(UdpEngine::for_profile(profile, timers));
        Ok(engine)
    };

    let agent = SipAgent::new(
        config.profile.to_profile(),
        config.agent.clone(),
        Collaborators::new(Arc::new(engines)),
    );
    agent.add_listener(Arc::new(LogListener));

    agent.initialize(true).await?;
    agent.register(config.agent.register_expiry).await?;
    info!(
        "Registering {} with {}",
        config.profile.username, config.profile.registrar_ip
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    agent.unregister(&agent.contact_address().await).await?;
    agent.flush().await;
    agent.shutdown().await;

    info!("sipua stopped");
    Ok(())
}
