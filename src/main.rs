use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::info;
use std::{panic, process};
use tokio_util::sync::CancellationToken;

use crate::config::{StreamConfig, app_name, app_version};
use crate::engine::loopback::LoopbackEngine;
use crate::pipeline::receiver::demo_graph;
use crate::pipeline::sender::generate;
use crate::pipeline::{ReceiverCoordinator, SenderCoordinator};

pub mod config;
pub mod engine;
pub mod error;
pub mod klv;
pub mod pipeline;

fn stream_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("endpoint")
            .short('e')
            .long("endpoint")
            .value_name("HOST:PORT")
            .help("Transport endpoint.")
            .default_value("127.0.0.1:5000"),
    )
    .arg(
        Arg::new("streams")
            .short('s')
            .long("streams")
            .value_name("COUNT")
            .help("Number of parallel video streams.")
            .value_parser(clap::value_parser!(usize))
            .default_value("1"),
    )
    .arg(
        Arg::new("fps")
            .long("fps")
            .value_name("RATE")
            .help("Generated frame rate.")
            .value_parser(clap::value_parser!(f64))
            .default_value("4"),
    )
    .arg(
        Arg::new("no-display")
            .long("no-display")
            .help("Do not log each paired frame on the receiver.")
            .action(ArgAction::SetTrue),
    )
}

fn config_from(matches: &ArgMatches) -> StreamConfig {
    let mut config = StreamConfig::default();
    if let Some(endpoint) = matches.get_one::<String>("endpoint") {
        config.endpoint = endpoint.clone();
    }
    if let Some(streams) = matches.get_one::<usize>("streams") {
        config.video_streams = (*streams).max(1);
    }
    if let Some(fps) = matches.get_one::<f64>("fps") {
        config.video.fps = *fps;
    }
    config.display = !matches.get_flag("no-display");
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let app_name = Box::leak(app_name().into_boxed_str());

    let matches = Command::new(&*app_name)
        .version(app_version())
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .subcommand_required(true)
        .subcommand(stream_args(Command::new("send").about(
            "Generate video and telemetry and stream them to an endpoint.",
        )))
        .subcommand(stream_args(Command::new("recv").about(
            "Receive a container stream and pair frames with telemetry.",
        )))
        .subcommand(stream_args(Command::new("demo").about(
            "Run sender and receiver in one process over a loopback engine.",
        )))
        .get_matches();

    // kill the main thread as soon as a secondary thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        process::exit(105);
    }));

    // gracefully close the app when receiving SIGINT, SIGTERM, or SIGHUP
    let shutdown = CancellationToken::new();
    let ctrlc_token = shutdown.clone();
    ctrlc::set_handler(move || {
        ctrlc_token.cancel();
    })?;

    // The in-process engine stands in until a transport-backed engine is
    // linked; the graph descriptions are the same either way.
    let engine = LoopbackEngine;

    match matches.subcommand() {
        Some(("send", sub)) => {
            let config = config_from(sub);
            let sender = SenderCoordinator::new(&engine, config)?;
            sender.run(shutdown).await?;
        }
        Some(("recv", sub)) => {
            let config = config_from(sub);
            let mut receiver = ReceiverCoordinator::new(&engine, config)?;
            receiver.run(shutdown).await?;
        }
        Some(("demo", sub)) => {
            let config = config_from(sub);
            let spec = demo_graph(&config)?;
            let mut receiver = ReceiverCoordinator::with_graph(&engine, config.clone(), &spec)?;
            let manager = receiver.manager();
            let health = receiver.health().clone();

            let generator_shutdown = shutdown.clone();
            let generator_config = config.clone();
            let generator = tokio::spawn(async move {
                // The coordinator transitions the shared pipeline to Playing.
                while !manager.state().is_playing() {
                    if generator_shutdown.is_cancelled() {
                        return Ok(());
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
                generate(&manager, &generator_config, &health, &generator_shutdown).await
            });

            receiver.run(shutdown).await?;
            generator.await??;
        }
        _ => unreachable!("subcommand is required"),
    }

    info!("done");
    Ok(())
}
