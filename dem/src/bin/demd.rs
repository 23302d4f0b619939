use std::{path::PathBuf, sync::atomic::Ordering, time::Duration};

use actix_web::{dev::Service, web, App, HttpServer};
use dem::{
    aen,
    config::store::Store,
    interfaces,
    logpages::IDLE_TIMEOUT,
    pseudo,
    rest,
    state::ManagerState,
};
use futures::future::{ok, Either};
use structopt::StructOpt;
use tracing::{error, info};

#[derive(Debug, StructOpt)]
pub(crate) struct CliArgs {
    /// The bind address for the REST management interface
    #[structopt(long, short = "p", default_value = "0.0.0.0:22345")]
    http: String,
    /// Directory holding the interface .conf files, the config store
    /// and the signature file
    #[structopt(long, short = "c", default_value = "/etc/nvme/nvmeof-dem")]
    conf_dir: PathBuf,
    /// Override the config store location
    #[structopt(long)]
    config_file: Option<PathBuf>,
    /// Override the signature file location
    #[structopt(long)]
    signature_file: Option<PathBuf>,
    /// Enable debug prints
    #[structopt(long, short)]
    debug: bool,
}

fn init_tracing(debug: bool) {
    if let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let level = if debug { "debug" } else { "info" };
        tracing_subscriber::fmt().with_env_filter(level).init();
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let args = CliArgs::from_args();
    init_tracing(args.debug);

    let config_file = args
        .config_file
        .clone()
        .unwrap_or_else(|| args.conf_dir.join(interfaces::CONFIG_FILENAME));
    let signature_file = args
        .signature_file
        .clone()
        .or_else(|| Some(args.conf_dir.join(interfaces::SIGNATURE_FILENAME)));

    let ifaces = match interfaces::load_interfaces(&args.conf_dir) {
        Ok(ifaces) if !ifaces.is_empty() => ifaces,
        Ok(_) => {
            error!("no viable interfaces in {:?}, exiting", args.conf_dir);
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no interfaces",
            ));
        }
        Err(e) => {
            error!("cannot read {:?}: {}", args.conf_dir, e);
            return Err(e);
        }
    };

    let state = ManagerState::build(Store::new(config_file), ifaces, signature_file)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

    for sig in &[signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        let _ = signal_hook::flag::register(*sig, state.stopped.clone());
    }

    let notifier = aen::spawn_notifier(state.aen.clone(), state.stopped.clone());

    let mut listeners = Vec::new();
    for iface in state.interfaces.clone() {
        let state = state.clone();
        listeners.push(
            std::thread::Builder::new()
                .name(format!("iface-{}", iface.traddr))
                .spawn(move || pseudo::interface_thread(state, iface))?,
        );
    }

    // first contact with the configured targets, then the periodic
    // keep-alive / refresh loop
    let ticker = {
        let state = state.clone();
        std::thread::Builder::new()
            .name("periodic".to_string())
            .spawn(move || {
                {
                    let mut aggr = state.aggregator.lock();
                    aggr.init_targets(&state);
                }
                while !state.stopped.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(IDLE_TIMEOUT));
                    if state.stopped.load(Ordering::Relaxed) {
                        break;
                    }
                    let mut aggr = state.aggregator.lock();
                    aggr.periodic_work(&state);
                }
            })?
    };

    info!("starting management interface on {}", args.http);

    let data = web::Data::new(state.clone());
    let auth_state = state.clone();
    let server = HttpServer::new(move || {
        let auth_state = auth_state.clone();
        App::new()
            .app_data(data.clone())
            .wrap_fn(move |req, srv| {
                if rest::authorized(&auth_state, &req) {
                    Either::Left(srv.call(req))
                } else {
                    let rsp = actix_web::ResponseError::error_response(
                        &rest::RestError::forbidden(),
                    );
                    Either::Right(ok(req.into_response(rsp)))
                }
            })
            .configure(rest::app_config)
            .default_service(web::route().to(rest::default_handler))
    })
    .bind(&args.http)?
    .run();

    *rest::SERVER.lock() = Some(server.clone());

    let ret = server.await;

    state.stopped.store(true, Ordering::Relaxed);
    for handle in listeners {
        let _ = handle.join();
    }
    let _ = ticker.join();
    let _ = notifier.join();

    info!("shutting down");
    ret
}
