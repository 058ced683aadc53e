use tokio_util::sync::CancellationToken;

mod api;
mod config;
mod handler;
mod manager;
mod replay;

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    let config = config::load(config::config_path().as_deref()).unwrap_or_else(|e| {
        eprintln!("Error loading config: {:#}", e);
        std::process::exit(1);
    });
    let listen = config::api_listen(&config);
    manager::init_output_manager(config).unwrap_or_else(|e| {
        eprintln!("Error creating outputs: {:#}", e);
        std::process::exit(1);
    });

    let cancel = CancellationToken::new();
    if let Err(e) = manager::start_event_logger(cancel.clone()) {
        log::warn!("output events will not be logged: {:#}", e);
    }
    api::start_api_server(listen, cancel.clone());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    }

    manager::shutdown().await;
    std::process::exit(0);
}
