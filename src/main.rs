use std::path::PathBuf;

use tracing_subscriber::EnvFilter;
use voice_preview::settings::{default_settings_path, load_settings, save_settings};
use voice_preview::{PreviewBackends, StartOutcome, VoicePreview};

const USAGE: &str = "usage: voice-preview <agent-ref> <tenant-ref> [--settings PATH] [--write-settings]";

struct Args {
    agent_ref: String,
    tenant_ref: String,
    settings_path: Option<PathBuf>,
    write_settings: bool,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args, String> {
    let mut positional = Vec::new();
    let mut settings_path = None;
    let mut write_settings = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--settings" => {
                let path = args.next().ok_or("--settings needs a path")?;
                settings_path = Some(PathBuf::from(path));
            }
            "--write-settings" => write_settings = true,
            "-h" | "--help" => return Err(USAGE.to_string()),
            other if other.starts_with("--") => return Err(format!("unknown flag {}", other)),
            _ => positional.push(arg),
        }
    }

    let [agent_ref, tenant_ref]: [String; 2] = positional.try_into().map_err(|_| USAGE.to_string())?;
    Ok(Args {
        agent_ref,
        tenant_ref,
        settings_path,
        write_settings,
    })
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("rustls crypto provider already installed");
    }

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), String> {
    let args = parse_args(std::env::args().skip(1))?;

    let path = args.settings_path.or_else(default_settings_path);
    let mut settings = match &path {
        Some(path) => load_settings(path),
        None => Default::default(),
    };
    if args.write_settings {
        let path = path.as_ref().ok_or("no config directory for settings")?;
        save_settings(path, &settings)?;
        log::info!("Settings written to {:?}", path);
    }
    settings.apply_env_overrides();
    settings.validate()?;

    let backends = PreviewBackends::native(&settings).map_err(|e| e.to_string())?;
    let preview = VoicePreview::new(settings, backends).map_err(|e| e.to_string())?;

    let result = match preview.start(&args.agent_ref, &args.tenant_ref).await {
        Ok(StartOutcome::Active(id)) => {
            log::info!("Preview {} active, press Ctrl-C to stop", id);
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Interrupted, stopping preview");
                    preview.stop().await.map_err(|e| e.to_string())
                }
                outcome = preview.wait_for_outcome() => match outcome {
                    Ok(outcome) if outcome.is_error() => Err(outcome.to_string()),
                    Ok(outcome) => {
                        log::info!("Preview {}", outcome);
                        Ok(())
                    }
                    Err(e) => Err(e.to_string()),
                },
            }
        }
        Ok(StartOutcome::Ended { outcome, .. }) if outcome.is_error() => Err(outcome.to_string()),
        Ok(StartOutcome::Ended { outcome, .. }) => {
            log::info!("Preview {}", outcome);
            Ok(())
        }
        Ok(StartOutcome::AlreadyRunning) => Err("a preview session is already running".to_string()),
        Err(e) => Err(e.to_string()),
    };

    preview.shutdown().await;
    result
}
