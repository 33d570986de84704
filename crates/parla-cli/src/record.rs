//! Push-to-talk loop: hold the shortcut to record, release to transcribe.

use anyhow::{Context, Result, anyhow};
use global_hotkey::hotkey::HotKey;
use global_hotkey::{GlobalHotKeyEvent, GlobalHotKeyManager, HotKeyState};
use parla_core::{
    AudioCapture, EventBus, HistoryStatus, LocalServiceManager, PipelineEvent, ProviderKind,
    SessionController, SessionPhase, Settings, TranscriptionDispatcher,
};
use tokio::sync::mpsc;

pub async fn run(
    mut settings: Settings,
    shortcut: String,
    provider: Option<ProviderKind>,
) -> Result<()> {
    if let Some(provider) = provider {
        settings.provider = provider;
    }

    let events = EventBus::new();
    // The service manager runs regardless of the selected provider so the
    // dispatcher can consult its state and the user can pre-start it.
    let service = LocalServiceManager::with_docker(settings.local.clone(), events.clone())
        .map_err(|err| anyhow!("{err}"))?;
    let dispatcher = TranscriptionDispatcher::new(Some(service));
    let controller = SessionController::new(AudioCapture::spawn(), dispatcher, events.clone());

    let hotkey: HotKey = shortcut
        .parse()
        .map_err(|err| anyhow!("invalid shortcut '{shortcut}': {err}"))?;

    // The hotkey manager is not Send on every platform, so it lives on
    // the bridge thread; registration errors come back over a channel.
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();
    let (hotkey_tx, mut hotkey_rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let manager = match GlobalHotKeyManager::new() {
            Ok(manager) => manager,
            Err(err) => {
                let _ = ready_tx.send(Err(format!("failed to init global shortcut: {err}")));
                return;
            }
        };
        if let Err(err) = manager.register(hotkey) {
            let _ = ready_tx.send(Err(format!("failed to register shortcut: {err}")));
            return;
        }
        let _ = ready_tx.send(Ok(()));
        let receiver = GlobalHotKeyEvent::receiver();
        while let Ok(event) = receiver.recv() {
            if hotkey_tx.send(event).is_err() {
                break;
            }
        }
    });
    ready_rx
        .recv()
        .map_err(|_| anyhow!("shortcut thread died during setup"))?
        .map_err(|err| anyhow!(err))?;

    println!(
        "Hold {shortcut} to record ({} provider). Ctrl+C to quit.",
        settings.provider.display_name()
    );

    let mut pipeline_events = events.subscribe();
    loop {
        tokio::select! {
            Some(event) = hotkey_rx.recv() => {
                if event.id != hotkey.id() {
                    continue;
                }
                match event.state {
                    HotKeyState::Pressed => {
                        if let Err(err) = controller.press(settings.clone()) {
                            tracing::error!("could not start recording: {err}");
                        }
                    }
                    HotKeyState::Released => controller.release(),
                }
            }
            event = pipeline_events.recv() => {
                match event {
                    Ok(PipelineEvent::Status(update)) => {
                        let label = match update.phase {
                            SessionPhase::Recording => "recording",
                            SessionPhase::Transcribing => "transcribing",
                            SessionPhase::Completed => "done",
                            SessionPhase::Error => "error",
                        };
                        tracing::debug!(session = %update.session, "status: {label}");
                    }
                    Ok(PipelineEvent::History(item)) => match item.status {
                        HistoryStatus::Success => {
                            if !item.final_text.is_empty() {
                                println!("{}", item.final_text);
                            }
                            for matched in &item.matches {
                                tracing::info!(
                                    "trigger '{}' matched: {}",
                                    matched.rule_title,
                                    matched.value
                                );
                            }
                        }
                        HistoryStatus::Failed => {
                            let message = item.error.unwrap_or_else(|| "unknown error".to_string());
                            eprintln!("transcription failed: {message}");
                        }
                    },
                    Ok(PipelineEvent::ServiceProgress(progress)) => {
                        tracing::debug!("service: {} {}", progress.stage, progress.message);
                    }
                    Err(_) => {}
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for ctrl-c")?;
                println!();
                break;
            }
        }
    }
    Ok(())
}
