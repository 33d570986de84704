//! Local service management subcommands.

use crate::ServiceCommand;
use anyhow::{Result, anyhow};
use parla_core::{EventBus, LocalServiceManager, PipelineEvent, ServiceStatus, Settings};

pub async fn run(settings: Settings, command: ServiceCommand) -> Result<()> {
    let events = EventBus::new();
    let mut progress = events.subscribe();

    // Mirror lifecycle progress onto the terminal while the command runs.
    let printer = tokio::spawn(async move {
        while let Ok(event) = progress.recv().await {
            if let PipelineEvent::ServiceProgress(progress) = event {
                match (progress.percent, progress.detail) {
                    (Some(percent), None) => {
                        println!("[{:>3}%] {} {}", percent, progress.stage, progress.message)
                    }
                    (_, Some(detail)) => println!("       {detail}"),
                    (None, None) => println!("       {} {}", progress.stage, progress.message),
                }
            }
        }
    });

    let manager = LocalServiceManager::with_docker(settings.local.clone(), events.clone())
        .map_err(|err| anyhow!("{err}"))?;

    let status = match command {
        ServiceCommand::Status => manager.status().await,
        ServiceCommand::Prepare => manager.prepare().await,
        ServiceCommand::Start => manager.start().await,
        ServiceCommand::Stop => manager.stop().await,
        ServiceCommand::Switch { model } => manager.switch_model(model).await,
        ServiceCommand::Reset => manager.reset().await,
    }
    .map_err(|err| anyhow!("{err}"))?;

    printer.abort();
    print_status(&status);
    Ok(())
}

fn print_status(status: &ServiceStatus) {
    println!("state:     {}", status.state);
    println!("model:     {} ({})", status.model, status.model_id);
    println!("device:    {}", status.device.as_str());
    println!("endpoint:  {}", status.service_url);
    println!("installed: {}", status.installed);
    if let Some(error) = &status.last_error {
        println!("last error: {error}");
    }
}
