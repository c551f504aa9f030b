//! Operational subcommands driving the instance manager.

use anyhow::Result;
use kecs_instance::{InstanceManager, StartOptions, StepState};
use tokio_util::sync::CancellationToken;

use crate::args::{DestroyArgs, InstanceArgs, StartArgs};

pub async fn run_start(args: StartArgs) -> Result<()> {
    let manager = InstanceManager::new();
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        kecs_common::shutdown::shutdown_signal().await;
        interrupt.cancel();
    });

    let options = StartOptions {
        instance_name: args.instance,
        data_dir: args.data_dir,
        config_file: None,
        disable_localstack: args.disable_localstack,
        disable_elbv2: args.disable_elbv2,
        api_port: args.api_port,
        admin_port: args.admin_port,
        dev_mode: args.dev_mode,
    };
    let started = manager.start(options, &cancel).await?;
    println!(
        "instance '{}' is running (api port {}, admin port {})",
        started.name, started.api_port, started.admin_port
    );
    println!("export KECS_API_ENDPOINT=http://localhost:{}", started.api_port);
    Ok(())
}

pub async fn run_stop(args: InstanceArgs) -> Result<()> {
    InstanceManager::new().stop(&args.instance).await?;
    println!("instance '{}' stopped", args.instance);
    Ok(())
}

pub async fn run_destroy(args: DestroyArgs) -> Result<()> {
    InstanceManager::new()
        .destroy(&args.instance, args.delete_data)
        .await?;
    if args.delete_data {
        println!("instance '{}' destroyed, data removed", args.instance);
    } else {
        println!("instance '{}' destroyed, data kept", args.instance);
    }
    Ok(())
}

pub async fn run_list() -> Result<()> {
    let instances = InstanceManager::new().list().await?;
    if instances.is_empty() {
        println!("no instances");
        return Ok(());
    }
    println!(
        "{:<20} {:<10} {:<10} {:<10} {}",
        "NAME", "STATE", "API", "ADMIN", "DATA"
    );
    for instance in instances {
        println!(
            "{:<20} {:<10} {:<10} {:<10} {}",
            instance.name,
            format!("{:?}", instance.state).to_uppercase(),
            instance.api_port,
            instance.admin_port,
            if instance.has_data { "yes" } else { "no" }
        );
    }
    Ok(())
}

pub async fn run_status(args: InstanceArgs) -> Result<()> {
    let manager = InstanceManager::new();
    match manager.creation_status(&args.instance).await {
        Some(steps) => {
            for step in steps {
                let marker = match step.state {
                    StepState::Running => "...",
                    StepState::Done => "ok",
                    StepState::Failed => "FAILED",
                };
                match step.message {
                    Some(message) => println!("{:<30} {marker}  {message}", step.step),
                    None => println!("{:<30} {marker}", step.step),
                }
            }
        }
        None => {
            let running = manager.is_running(&args.instance).await?;
            println!(
                "instance '{}' is {}",
                args.instance,
                if running { "running" } else { "stopped" }
            );
        }
    }
    Ok(())
}
