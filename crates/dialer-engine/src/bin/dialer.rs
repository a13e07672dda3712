//! Process entry point. Mirrors `main.py`'s wiring order: load
//! configuration, build the PBX/provider clients, load scenarios, wire
//! the Session Manager / Flow Engine / Dialer trio together, then run
//! the event stream and dialer loop until interrupted.

use std::sync::Arc;

use clap::Parser;
use pbx_dialer_engine::config::Settings;
use pbx_dialer_engine::dialer::Dialer;
use pbx_dialer_engine::flow::result::transcript_logger_or_noop;
use pbx_dialer_engine::flow::FlowEngine;
use pbx_dialer_engine::panel::PanelClient;
use pbx_dialer_engine::providers::{LlmClient, SmsClient, SttClient};
use pbx_dialer_engine::scenario::registry::ScenarioRegistry;
use pbx_dialer_engine::session::manager::SessionManager;
use pbx_dialer_engine::telephony::{AriClient, AriEventStream};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "dialer", about = "Outbound/inbound PBX dialer engine")]
struct Args {
    /// Path to the `.env` file to load before reading the process environment.
    #[arg(long, default_value = ".env")]
    env_file: String,

    /// Directory transcript logs are written to; omit to disable them.
    #[arg(long)]
    transcript_log_dir: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    pbx_dialer_engine::config::load_dotenv(&args.env_file);
    let settings = Settings::from_env()?;

    let filter = tracing_subscriber::EnvFilter::try_new(&settings.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("starting dialer engine");

    let http_max_connections = settings.concurrency.http_max_connections;
    let ari = Arc::new(AriClient::new(&settings.ari, http_max_connections)?);
    let scenarios = Arc::new(ScenarioRegistry::load_dir(
        &settings.scenario.dir,
        &settings.scenario.company,
    )?);
    let sessions = Arc::new(SessionManager::new(ari.clone(), scenarios.clone()));
    let panel = Arc::new(PanelClient::new(&settings.panel, http_max_connections)?);
    let llm = Arc::new(LlmClient::new(
        &settings.gapgpt,
        settings.concurrency.max_parallel_llm,
        http_max_connections,
    )?);
    let stt = Arc::new(SttClient::new(
        &settings.vira,
        settings.concurrency.max_parallel_stt,
        http_max_connections,
    )?);
    let sms = Arc::new(SmsClient::new(&settings.sms, http_max_connections)?);
    let transcripts = transcript_logger_or_noop(args.transcript_log_dir);

    if !scenarios.get_names().is_empty() {
        if let Err(e) = panel.register_scenarios(&scenarios.get_names()).await {
            error!(error = %e, "failed to register scenarios with panel");
        }
    }

    let engine = Arc::new(FlowEngine::new(
        sessions.clone(),
        ari.clone(),
        scenarios.clone(),
        panel.clone(),
        llm,
        stt,
        transcripts,
        settings.operator.clone(),
    ));
    sessions.set_scenario_handler(engine.clone());

    let dialer = Arc::new(Dialer::new(
        sessions.clone(),
        ari.clone(),
        panel.clone(),
        scenarios.clone(),
        sms,
        settings.dialer.clone(),
        settings.sms.fail_alert_threshold,
    ));
    engine.set_dialer_notifier(dialer.clone());
    engine.set_line_reservation(dialer.clone());
    sessions.set_dialer_notifier(dialer.clone());

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);

    let event_stream = AriEventStream::new(&settings.ari);
    let (event_tx, mut event_rx) = tokio::sync::mpsc::channel(256);
    let stream_task = tokio::spawn(event_stream.run(event_tx, stop_rx.clone()));

    let sessions_for_events = sessions.clone();
    let event_loop_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            sessions_for_events.handle_event(event).await;
        }
    });

    let dialer_task = tokio::spawn(dialer.clone().run(stop_rx.clone()));
    let missed_calls_task = tokio::spawn(dialer.clone().watch_missed_calls(stop_rx.clone()));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining");

    let _ = stop_tx.send(true);
    let _ = stream_task.await;
    let _ = dialer_task.await;
    let _ = missed_calls_task.await;
    event_loop_task.abort();

    panel.flush_pending().await;
    info!("dialer engine stopped");
    Ok(())
}
