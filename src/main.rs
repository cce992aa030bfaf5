use softphone_engine::config::Config;
use softphone_engine::domain::leg::LegState;
use softphone_engine::domain::shared::value_objects::LegId;
use softphone_engine::infrastructure::{
    DialBehavior, LoggingAudioController, SimulatedBackend, TracingHistorySink,
};
use softphone_engine::SoftphoneEngine;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;

    // Initialize tracing; RUST_LOG wins over the configured filter
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.filter))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting softphone engine demo");
    info!("Configuration loaded: {:?}", config);

    let backend = Arc::new(SimulatedBackend::new());
    backend.set_default_dial_behavior(DialBehavior::Answer {
        after: Duration::from_millis(50),
    });

    let engine = SoftphoneEngine::new(
        config,
        backend.clone(),
        Arc::new(LoggingAudioController::new()),
        Arc::new(TracingHistorySink),
    );

    demo_attended_transfer(&engine, &backend).await?;
    demo_conference(&engine).await?;

    let status = engine.status().borrow().clone();
    println!("{}", serde_json::to_string_pretty(&status)?);

    engine.shutdown();
    info!("Softphone engine demo finished");
    Ok(())
}

/// Take an inbound call, consult 1002, then hand the caller over
async fn demo_attended_transfer(
    engine: &SoftphoneEngine,
    backend: &SimulatedBackend,
) -> anyhow::Result<()> {
    let caller = backend.inject_incoming("sip:2000@pbx.local");
    wait_for(engine, &caller, LegState::Ringing).await?;
    backend.connect(&caller);
    wait_for(engine, &caller, LegState::Connected).await?;

    let transfers = engine.transfers();
    let attempt = transfers.begin_attended(&caller, "1002").await?;
    info!("Consulting: {:?}", attempt.phase);

    if let Some(consult) = &attempt.consult_leg {
        wait_for(engine, consult, LegState::Connected).await?;
    }
    transfers.switch_active(attempt.id).await?;
    transfers.switch_active(attempt.id).await?;

    let done = transfers.complete(attempt.id).await?;
    info!("Transfer {} finished as {}", done.id, done.phase);
    Ok(())
}

/// Three-party conference, then tear it down
async fn demo_conference(engine: &SoftphoneEngine) -> anyhow::Result<()> {
    let seed = engine.place_call("1003").await?;
    wait_for(engine, &seed, LegState::Connected).await?;

    let conference = engine.start_conference(&seed).await?;
    engine.add_participant(conference, "1004").await?;
    engine.add_participant(conference, "1005").await?;

    if let Some(view) = engine.conferences().get(conference).await {
        for participant in &view.participants {
            info!(
                "Participant {} ({}) {:?}",
                participant.leg_id, participant.address, participant.status
            );
        }
    }

    let view = engine.conferences().terminate(conference).await?;
    info!("Conference {} is {}", view.id, view.phase);
    Ok(())
}

async fn wait_for(engine: &SoftphoneEngine, leg: &LegId, expected: LegState) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if engine.leg_state(leg).await == Some(expected) {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("leg {} never reached {}", leg, expected);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
