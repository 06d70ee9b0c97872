// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use futures::StreamExt;
use log::*;
use mimalloc::MiMalloc;
use podium::global::*;
use podium::ledger::MemoryLedger;
use podium::media::MemoryObjectStore;
use podium::server::{self, ServerState};
use podium::settings::SETTINGS;
use podium::{Podium, PodiumConfig};

use std::env;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::runtime::Builder;
use tokio::time::sleep;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::prelude::*;

#[cfg(not(windows))]
use signal_hook::consts::TERM_SIGNALS;
#[cfg(not(windows))]
use signal_hook::flag;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> anyhow::Result<()> {
    podium::global::init();

    #[cfg(not(windows))]
    for sig in TERM_SIGNALS {
        // A second term signal exits immediately with exit code 1.
        flag::register_conditional_shutdown(*sig, 1, EXIT_SIGNAL.clone())?;
        // Must be registered after the conditional shutdown, otherwise the
        // first signal would arm and then terminate.
        flag::register(*sig, EXIT_SIGNAL.clone())?;
    }

    run_init()
}

fn run_init() -> anyhow::Result<()> {
    let t = thread::spawn(start_runtime);

    // Blocks until the exit signal is received
    loop {
        if EXIT_SIGNAL.load(Ordering::Relaxed) {
            break;
        }
        thread::sleep(Duration::from_millis(200));
    }

    match t.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("runtime thread panicked")),
    }
}

fn start_runtime() -> anyhow::Result<()> {
    let worker_threads = if SETTINGS.node.worker_threads == 0 {
        num_cpus::get()
    } else {
        SETTINGS.node.worker_threads as usize
    };

    let runtime = Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_io()
        .enable_time()
        .build()?;

    let result = runtime.block_on(async {
        init_tracing("Podium")?;

        let config = PodiumConfig::from_settings(&SETTINGS);
        info!(
            "Running Podium v{} on {} as {}",
            env!("CARGO_PKG_VERSION"),
            config.universe,
            config.application_id
        );

        let podium = Podium::new(
            config,
            Arc::new(MemoryLedger::new()),
            Arc::new(MemoryObjectStore::new()),
        );

        let run_http = {
            let podium = podium.clone();
            async move {
                if !SETTINGS.server.http_enabled {
                    futures::future::pending::<()>().await;
                }

                let ip: IpAddr = match SETTINGS.server.listen_addr.parse() {
                    Ok(ip) => ip,
                    Err(err) => {
                        error!(
                            "Invalid listen address {}: {}",
                            SETTINGS.server.listen_addr, err
                        );
                        return;
                    }
                };

                let addr = SocketAddr::new(ip, SETTINGS.server.listen_port);
                let state = ServerState::new(podium, &SETTINGS.server.public_key);
                server::serve(state, addr, check_exit_signal()).await;
            }
        };

        // An unhandled channel fault takes the process down
        let mut faults = podium.take_faults();
        let watch_faults = async move {
            match faults.as_mut() {
                Some(faults) => {
                    if let Some(fault) = faults.next().await {
                        error!("Shutting down after {}", fault);
                    }
                }
                None => futures::future::pending::<()>().await,
            }
        };

        tokio::select!(
            _ = tokio::spawn(run_http) => (),
            _ = watch_faults => (),
            _ = check_exit_signal() => (),
        );

        podium.clean_up();
        info!("Podium v{} shut down", env!("CARGO_PKG_VERSION"));

        Ok::<(), anyhow::Error>(())
    });

    // Unblock the main thread when the runtime ends on its own
    request_exit();
    result
}

async fn check_exit_signal() {
    loop {
        if EXIT_SIGNAL.load(Ordering::Relaxed) {
            break;
        }

        sleep(Duration::from_millis(10)).await;
    }

    info!("Podium v{} shutting down...", env!("CARGO_PKG_VERSION"))
}

/// Initializes the tracing subscriber, exporting to a Jaeger agent when enabled.
fn init_tracing(service_name: &str) -> anyhow::Result<()> {
    let filter = if SETTINGS.node.debug_mode && env::var("RUST_LOG").is_err() {
        EnvFilter::new("podium=debug")
    } else {
        EnvFilter::from_default_env()
    };

    let jaeger = if SETTINGS.node.jaeger_tracing {
        env::set_var("OTEL_BSP_MAX_EXPORT_BATCH_SIZE", "12");
        let tracer = opentelemetry_jaeger::new_pipeline()
            .with_service_name(service_name)
            .with_max_packet_size(2usize.pow(13))
            .install_batch(opentelemetry::runtime::Tokio)?;

        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(jaeger)
        .try_init()?;

    Ok(())
}
