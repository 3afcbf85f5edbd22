use std::fmt::Debug;
use std::fmt::Display;

use clap::Parser;
use pixelated_dispatcher::cli;
use pixelated_dispatcher::cli::Cli;
use pixelated_dispatcher::cli::Command;
use pixelated_dispatcher::manager;
use pixelated_dispatcher::proxy;
use pixelated_dispatcher::telemetry::get_subscriber;
use pixelated_dispatcher::telemetry::init_subscriber;
use tokio::task::JoinError;

fn report_exit(
    name: &str,
    outcome: Result<Result<(), impl Debug + Display>, JoinError>,
) {
    match outcome {
        Ok(Ok(())) => {
            tracing::info!("{name} exited gracefully")
        }
        Ok(Err(e)) => {
            tracing::error!(
                error.cause_chain = ?e,
                error.message = %e,
                "{name} failed"
            )
        }
        Err(e) => {
            tracing::error!(
                error.cause_chain = ?e,
                error.message = %e,
                "{name} task failed"
            )
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    match Cli::parse().command {
        Command::Manager(args) => {
            let subscriber = get_subscriber("pixelated-dispatcher-manager", "info", std::io::stdout);
            init_subscriber(subscriber);

            let app = manager::startup::Application::build(args.into_settings()?).await?;
            tracing::info!(port = app.get_port(), "manager listening");
            let outcome = tokio::spawn(app.run_until_stopped()).await;
            report_exit("manager API", outcome);
        }
        Command::Proxy(args) => {
            let subscriber = get_subscriber("pixelated-dispatcher-proxy", "info", std::io::stdout);
            init_subscriber(subscriber);

            let app = proxy::startup::Application::build(args.into_settings()?).await?;
            tracing::info!(port = app.get_port(), "proxy listening");
            let outcome = tokio::spawn(app.run_until_stopped()).await;
            report_exit("proxy front", outcome);
        }
        Command::Client(command) => {
            let code = cli::run_client(command).await;
            std::process::exit(code);
        }
    }
    Ok(())
}
